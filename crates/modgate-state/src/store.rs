//! `CoordinationStore`: the facade every other component talks to.
//!
//! Wraps one [`CoordinationBackend`] with typed JSON helpers, bounded lock
//! waiting with exponential backoff, and [`CoordinationStore::with_lock`],
//! which always releases the lock, including when the closure panics.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, CoordinationBackend, LockRecord};
use crate::error::{StoreError, StoreResult};

/// Backoff schedule used while waiting for a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Proof of a lock acquired through a [`CoordinationStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    key: String,
    holder: String,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Process-unique holder prefix: `modgate_<pid>_<uuid>`.
pub fn default_holder_id() -> String {
    format!("modgate_{}_{}", std::process::id(), Uuid::new_v4().simple())
}

/// Shared handle over the selected coordination backend.
#[derive(Clone)]
pub struct CoordinationStore {
    backend: Arc<dyn CoordinationBackend>,
    holder: String,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for CoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationStore")
            .field("backend", &self.backend.kind())
            .field("holder", &self.holder)
            .finish()
    }
}

impl CoordinationStore {
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            backend,
            holder: default_holder_id(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.backend.put(key, value, ttl).await
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        self.backend.get(key).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.backend.delete(key).await
    }

    pub async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.backend.list_keys(prefix).await
    }

    /// Serialize `value` and store it.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.backend.put(key, value, ttl).await
    }

    /// Fetch and deserialize the value under `key`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Single acquisition attempt under this store's holder identity.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.backend.try_lock(key, &self.holder, ttl).await
    }

    /// Release a lock taken with [`CoordinationStore::try_lock`].
    pub async fn unlock(&self, key: &str) -> StoreResult<()> {
        self.backend.unlock(key, &self.holder).await
    }

    pub async fn lock_info(&self, key: &str) -> StoreResult<Option<LockRecord>> {
        self.backend.lock_info(key).await
    }

    /// Acquire `key`, waiting at most `wait` with exponential backoff.
    ///
    /// Each acquisition gets its own holder token so two tasks sharing this
    /// store never mistake each other's locks for their own.
    pub async fn lock(&self, key: &str, ttl: Duration, wait: Duration) -> StoreResult<HeldLock> {
        let holder = format!("{}#{}", self.holder, &Uuid::new_v4().simple().to_string()[..8]);
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            if self.backend.try_lock(key, &holder, ttl).await? {
                debug!(key = %key, holder = %holder, attempts = attempt + 1, "lock acquired");
                return Ok(HeldLock {
                    key: key.to_string(),
                    holder,
                    acquired_at: Utc::now(),
                    ttl,
                });
            }
            let elapsed = start.elapsed();
            if elapsed >= wait {
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let delay = self.backoff.delay_for(attempt).min(wait - elapsed);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release a lock obtained from [`CoordinationStore::lock`].
    pub async fn release(&self, lock: &HeldLock) -> StoreResult<()> {
        self.backend.unlock(&lock.key, &lock.holder).await?;
        debug!(key = %lock.key, holder = %lock.holder, "lock released");
        Ok(())
    }

    /// Acquire `key`, run `f`, and release the lock whatever `f` does.
    ///
    /// A panic inside `f` is resumed after the lock is released. A failure to
    /// release is logged; the lock then lapses after its TTL.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
        f: F,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(HeldLock) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lock = self.lock(key, ttl, wait).await.map_err(E::from)?;
        let held = lock.clone();
        let outcome = AssertUnwindSafe(async move { f(held).await })
            .catch_unwind()
            .await;

        if let Err(e) = self.release(&lock).await {
            warn!(key = %key, error = %e, "failed to release lock");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryBackend;

    fn make_store() -> CoordinationStore {
        CoordinationStore::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
        assert_eq!(policy.delay_for(40), Duration::from_millis(50));
    }

    #[test]
    fn holder_id_format() {
        let id = default_holder_id();
        assert!(id.starts_with(&format!("modgate_{}_", std::process::id())));
    }

    #[tokio::test]
    async fn lock_times_out_when_contended() {
        let store = make_store();
        let _held = store
            .lock("promote-m", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();

        let start = Instant::now();
        let err = store
            .lock("promote-m", Duration::from_secs(30), Duration::from_millis(120))
            .await
            .unwrap_err();
        match err {
            StoreError::LockTimeout { key, .. } => assert_eq!(key, "promote-m"),
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn lock_acquired_once_released() {
        let store = make_store();
        let held = store
            .lock("k", Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .lock("k", Duration::from_secs(30), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.release(&held).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second.holder(), held.holder());
    }

    #[tokio::test]
    async fn with_lock_releases_after_error() {
        let store = make_store();
        let result: Result<(), StoreError> = store
            .with_lock("k", Duration::from_secs(30), Duration::ZERO, |_| async {
                Err(StoreError::InvalidArgument("boom".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert!(store.lock_info("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn with_lock_releases_after_panic() {
        let store = make_store();
        let inner = store.clone();
        let joined = tokio::spawn(async move {
            let _: Result<(), StoreError> = inner
                .with_lock("k", Duration::from_secs(30), Duration::ZERO, |_| async {
                    panic!("closure panicked")
                })
                .await;
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert!(store.lock_info("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn with_lock_passes_held_lock() {
        let store = make_store();
        let key = store
            .with_lock::<_, StoreError, _, _>(
                "promote-a",
                Duration::from_secs(30),
                Duration::ZERO,
                |lock| async move { Ok(lock.key().to_string()) },
            )
            .await
            .unwrap();
        assert_eq!(key, "promote-a");
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_lock(
            "k",
            LockRecord {
                holder: "crashed".into(),
                acquired_at: Utc::now() - chrono::Duration::seconds(10),
                ttl: 1,
            },
        );
        let store = CoordinationStore::new(backend);
        assert!(store
            .lock("k", Duration::from_secs(30), Duration::ZERO)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn typed_json_helpers() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Entry {
            name: String,
        }
        let store = make_store();
        store
            .put_json("e", &Entry { name: "x".into() }, None)
            .await
            .unwrap();
        let got: Option<Entry> = store.get_json("e").await.unwrap();
        assert_eq!(got, Some(Entry { name: "x".into() }));
    }
}
