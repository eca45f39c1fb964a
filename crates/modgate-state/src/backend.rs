//! Backend trait shared by the remote and local coordination stores.
//!
//! A backend is a flat key/value map with per-key advisory locks. Values are
//! opaque JSON documents; locks are records of `{holder, acquired_at, ttl}`.
//! Exactly one backend is selected when a process starts and it is used for
//! the lifetime of that process.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Which backend implementation is serving a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Etcd,
    File,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Etcd => "etcd",
            BackendKind::File => "file",
            BackendKind::Memory => "memory",
        };
        f.write_str(s)
    }
}

/// A held advisory lock as persisted by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Time-to-live in seconds.
    pub ttl: u64,
}

impl LockRecord {
    pub fn new(holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: Utc::now(),
            ttl: ttl.as_secs().max(1),
        }
    }

    /// A lock is expired once `now - acquired_at > ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.num_milliseconds() > (self.ttl as i64).saturating_mul(1000)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// A stored value with its optional expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Time-to-live in seconds; `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl StoredValue {
    pub fn new(value: serde_json::Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            created_at: Utc::now(),
            ttl: ttl.map(|t| t.as_secs().max(1)),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = now.signed_duration_since(self.created_at);
                age.num_milliseconds() > (ttl as i64).saturating_mul(1000)
            }
            None => false,
        }
    }
}

/// Key/value storage with advisory locking.
///
/// Implementations must be safe to share across tasks. Lock operations are
/// single attempts; bounded waiting lives in [`crate::CoordinationStore`].
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// The concrete implementation serving this store.
    fn kind(&self) -> BackendKind;

    /// Store `value` under `key`, optionally expiring after `ttl`.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Fetch the value under `key`. Expired values read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List live keys starting with `prefix`, sorted ascending.
    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Attempt to acquire the lock named `key` once.
    ///
    /// Returns `Ok(false)` when another holder owns an unexpired lock. An
    /// expired lock is removed and acquisition is retried exactly once.
    async fn try_lock(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release the lock named `key` held by `holder`.
    ///
    /// Releasing an absent or expired lock succeeds; releasing a lock owned
    /// by another live holder fails with `NotLockHolder`.
    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<()>;

    /// Inspect the current lock record, if any unexpired lock exists.
    async fn lock_info(&self, key: &str) -> StoreResult<Option<LockRecord>>;
}
