//! Local durable-file backend.
//!
//! Layout under the backend root:
//!
//! ```text
//! <root>/store.json        one JSON document holding every key (atomic replace)
//! <root>/.store.guard      flock target serializing read-modify-write cycles
//! <root>/locks/<sha256>.lock   one {holder, acquired_at, ttl} record per lock key
//! ```
//!
//! Every mutating call reads the document, applies the change and renames a
//! fully written temp file over `store.json` while holding an exclusive
//! `flock` on the guard file, so sequences are atomic across processes on one
//! host. There is no cross-host guarantee.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::backend::{BackendKind, CoordinationBackend, LockRecord, StoredValue};
use crate::error::{StoreError, StoreResult};

const STORE_FILE: &str = "store.json";
const GUARD_FILE: &str = ".store.guard";
const LOCKS_DIR: &str = "locks";
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, StoredValue>,
}

/// Exclusive or shared `flock` held for the lifetime of the guard.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, exclusive: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let op = if exclusive {
                libc::LOCK_EX
            } else {
                libc::LOCK_SH
            };
            loop {
                let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
                if rc == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = exclusive;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[derive(Debug)]
struct FileState {
    root: PathBuf,
    store_path: PathBuf,
    guard_path: PathBuf,
    locks_dir: PathBuf,
}

impl FileState {
    fn read_document(&self) -> StoreResult<StoreDocument> {
        match fs::read(&self.store_path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(StoreDocument::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Corrupt(format!("{}: {e}", self.store_path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, doc: &mut StoreDocument) -> StoreResult<()> {
        doc.version = DOCUMENT_VERSION;
        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.store_path).map_err(|e| StoreError::from(e.error))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> StoreResult<T> {
        let _guard = FileLock::acquire(&self.guard_path, false)?;
        let doc = self.read_document()?;
        Ok(f(&doc))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreDocument) -> T) -> StoreResult<T> {
        let _guard = FileLock::acquire(&self.guard_path, true)?;
        let mut doc = self.read_document()?;
        let out = f(&mut doc);
        self.write_document(&mut doc)?;
        Ok(out)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.locks_dir.join(format!("{}.lock", hex::encode(digest)))
    }

    /// Read a lock file. Unparsable records are treated as absent.
    fn read_lock(path: &Path) -> StoreResult<Option<LockRecord>> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_lock(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn try_lock(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let _guard = FileLock::acquire(&self.guard_path, true)?;
        let path = self.lock_path(key);

        // First attempt, then at most one retry after clearing an expired lock.
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord::new(holder, ttl);
                    let bytes = serde_json::to_vec(&record)?;
                    file.write_all(&bytes)?;
                    file.sync_all()?;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt > 0 {
                        return Ok(false);
                    }
                    match Self::read_lock(&path)? {
                        Some(existing) if !existing.is_expired() => return Ok(false),
                        stale => {
                            debug!(
                                key = %key,
                                previous_holder = stale.as_ref().map(|r| r.holder.as_str()).unwrap_or("<unreadable>"),
                                "removing expired lock"
                            );
                            Self::remove_lock(&path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    fn unlock(&self, key: &str, holder: &str) -> StoreResult<()> {
        let _guard = FileLock::acquire(&self.guard_path, true)?;
        let path = self.lock_path(key);
        match Self::read_lock(&path)? {
            None => Self::remove_lock(&path),
            Some(record) if record.holder == holder || record.is_expired() => {
                Self::remove_lock(&path)
            }
            Some(_) => Err(StoreError::NotLockHolder {
                key: key.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn lock_info(&self, key: &str) -> StoreResult<Option<LockRecord>> {
        let _guard = FileLock::acquire(&self.guard_path, false)?;
        Ok(Self::read_lock(&self.lock_path(key))?.filter(|r| !r.is_expired()))
    }
}

/// Coordination backend persisted to a single JSON document on local disk.
#[derive(Debug, Clone)]
pub struct FileBackend {
    state: Arc<FileState>,
}

impl FileBackend {
    /// Open (or create) a file store rooted at `root`.
    ///
    /// Fails with `Unavailable` if the directory cannot be created or written.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let locks_dir = root.join(LOCKS_DIR);
        fs::create_dir_all(&locks_dir).map_err(|e| {
            StoreError::Unavailable(format!("cannot create {}: {e}", locks_dir.display()))
        })?;

        // Probe writability now so a read-only medium fails at startup.
        NamedTempFile::new_in(&root).map_err(|e| {
            StoreError::Unavailable(format!("{} is not writable: {e}", root.display()))
        })?;

        let state = FileState {
            store_path: root.join(STORE_FILE),
            guard_path: root.join(GUARD_FILE),
            locks_dir,
            root,
        };
        // Surface a corrupt document at open time rather than on first use.
        state.read(|_| ())?;
        Ok(Self {
            state: Arc::new(state),
        })
    }

    /// Path of the persisted JSON document.
    pub fn document_path(&self) -> &Path {
        &self.state.store_path
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileState) -> StoreResult<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(&state))
            .await
            .map_err(|e| StoreError::Unavailable(format!("file store worker failed: {e}")))?
    }
}

#[async_trait]
impl CoordinationBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |state| {
            state.mutate(|doc| {
                doc.entries.insert(key, StoredValue::new(value, ttl));
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let key = key.to_string();
        self.blocking(move |state| {
            state.read(|doc| {
                let now = Utc::now();
                doc.entries
                    .get(&key)
                    .filter(|v| !v.is_expired_at(now))
                    .map(|v| v.value.clone())
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.blocking(move |state| {
            state.mutate(|doc| {
                doc.entries.remove(&key);
                // Expired entries are dropped on every rewrite.
                let now = Utc::now();
                doc.entries.retain(|_, v| !v.is_expired_at(now));
            })
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |state| {
            state.read(|doc| {
                let now = Utc::now();
                doc.entries
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .filter(|(_, v)| !v.is_expired_at(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
        })
        .await
    }

    async fn try_lock(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        validate_key(key)?;
        let key = key.to_string();
        let holder = holder.to_string();
        self.blocking(move |state| state.try_lock(&key, &holder, ttl))
            .await
    }

    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<()> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.blocking(move |state| state.unlock(&key, &holder)).await
    }

    async fn lock_info(&self, key: &str) -> StoreResult<Option<LockRecord>> {
        let key = key.to_string();
        self.blocking(move |state| state.lock_info(&key)).await
    }
}

pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn make_backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("state")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let (dir, backend) = make_backend();
        backend.put("modules/a", json!({"v": 1}), None).await.unwrap();
        drop(backend);

        let reopened = FileBackend::open(dir.path().join("state")).unwrap();
        assert_eq!(
            reopened.get("modules/a").await.unwrap(),
            Some(json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn document_is_single_json_file() {
        let (_dir, backend) = make_backend();
        backend.put("k1", json!("a"), None).await.unwrap();
        backend.put("k2", json!("b"), None).await.unwrap();

        let raw = std::fs::read(backend.document_path()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc["version"], json!(1));
        assert_eq!(doc["entries"]["k1"]["value"], json!("a"));
        assert_eq!(doc["entries"]["k2"]["value"], json!("b"));
    }

    #[tokio::test]
    async fn corrupt_document_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("state");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(STORE_FILE), b"{not json").unwrap();

        match FileBackend::open(&root) {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn expired_lock_file_is_replaced() {
        let (_dir, backend) = make_backend();
        let path = backend.state.lock_path("promote-m");
        let stale = LockRecord {
            holder: "dead-process".into(),
            acquired_at: Utc::now() - ChronoDuration::seconds(120),
            ttl: 30,
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        assert!(backend
            .try_lock("promote-m", "fresh", Duration::from_secs(30))
            .await
            .unwrap());
        let info = backend.lock_info("promote-m").await.unwrap().unwrap();
        assert_eq!(info.holder, "fresh");
    }

    #[tokio::test]
    async fn unreadable_lock_file_is_treated_as_absent() {
        let (_dir, backend) = make_backend();
        let path = backend.state.lock_path("promote-x");
        std::fs::write(&path, b"").unwrap();

        assert!(backend
            .try_lock("promote-x", "holder", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn locks_are_exclusive_across_backend_instances() {
        let (dir, a) = make_backend();
        let b = FileBackend::open(dir.path().join("state")).unwrap();

        assert!(a.try_lock("k", "a", Duration::from_secs(30)).await.unwrap());
        assert!(!b.try_lock("k", "b", Duration::from_secs(30)).await.unwrap());
        a.unlock("k", "a").await.unwrap();
        assert!(b.try_lock("k", "b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_puts_are_not_lost() {
        let (_dir, backend) = make_backend();
        let mut handles = Vec::new();
        for i in 0..16 {
            let b = backend.clone();
            handles.push(tokio::spawn(async move {
                b.put(&format!("k/{i:02}"), json!(i), None).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(backend.list_keys("k/").await.unwrap().len(), 16);
    }

    #[test]
    fn empty_key_rejected() {
        assert!(matches!(
            validate_key(""),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
