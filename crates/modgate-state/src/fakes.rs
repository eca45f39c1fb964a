//! In-memory fakes for the coordination backend (testing only)
//!
//! `MemoryBackend` satisfies the `CoordinationBackend` contract without
//! touching disk or network, and can be switched into a failing mode to
//! exercise `Unavailable` paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::backend::{BackendKind, CoordinationBackend, LockRecord, StoredValue};
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// In-memory key/value map plus lock table.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, StoredValue>>,
    locks: Mutex<HashMap<String, LockRecord>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable` (or recover).
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Insert a lock record directly, e.g. to simulate a crashed holder.
    pub fn insert_lock(&self, key: &str, record: LockRecord) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.insert(key.to_string(), record);
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend marked down".into()));
        }
        Ok(())
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, StoredValue>>> {
        self.check()?;
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("entries mutex poisoned".into()))
    }

    fn locks(&self) -> StoreResult<MutexGuard<'_, HashMap<String, LockRecord>>> {
        self.check()?;
        self.locks
            .lock()
            .map_err(|_| StoreError::Unavailable("locks mutex poisoned".into()))
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        crate::file::validate_key(key)?;
        self.entries()?
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let now = Utc::now();
        Ok(self
            .entries()?
            .get(key)
            .filter(|v| !v.is_expired_at(now))
            .map(|v| v.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .entries()?
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn try_lock(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        crate::file::validate_key(key)?;
        let mut locks = self.locks()?;
        match locks.get(key) {
            Some(existing) if !existing.is_expired() => Ok(false),
            _ => {
                locks.insert(key.to_string(), LockRecord::new(holder, ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<()> {
        let mut locks = self.locks()?;
        match locks.get(key) {
            Some(existing) if existing.holder != holder && !existing.is_expired() => {
                Err(StoreError::NotLockHolder {
                    key: key.to_string(),
                    holder: holder.to_string(),
                })
            }
            _ => {
                locks.remove(key);
                Ok(())
            }
        }
    }

    async fn lock_info(&self, key: &str) -> StoreResult<Option<LockRecord>> {
        Ok(self
            .locks()?
            .get(key)
            .filter(|r| !r.is_expired())
            .cloned())
    }
}
