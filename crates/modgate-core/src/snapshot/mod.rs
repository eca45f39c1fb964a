//! Snapshot/Restore of a module's live files.
//!
//! A snapshot is taken immediately before a promotion overwrites live files.
//! Snapshots are append-only per module: restoring never deletes history.
//!
//! Two backends share one manifest index under `snapshots/<module_id>/`:
//! [`FsSnapshotStore`] copies file content into a blob store, and
//! [`GitSnapshotStore`] commits the live tree to a git repository.

pub mod blobs;
pub mod fs;
pub mod git;
pub mod index;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use blobs::Digest;
pub use fs::FsSnapshotStore;
pub use git::GitSnapshotStore;
pub use index::ManifestIndex;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot {snapshot_id} not found for module {module_id}")]
    NotFound {
        module_id: String,
        snapshot_id: String,
    },

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("git: {0}")]
    Git(String),

    #[error("snapshot manifest: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotKind {
    FileCopy,
    Git { revision: String },
}

/// Immutable reference to the pre-change state of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Sortable: `<sequence>-<timestamp>`.
    pub snapshot_id: String,
    pub module_id: String,
    pub live_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub kind: SnapshotKind,
    /// Empty when the module had no live files yet.
    pub files: Vec<SnapshotFile>,
}

impl SnapshotRef {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_manifest(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Capture the current contents of `live_dir` (possibly absent).
    async fn snapshot(&self, module_id: &str, live_dir: &Path) -> SnapshotResult<SnapshotRef>;

    /// Make `snapshot.live_dir` match the snapshot byte-for-byte.
    async fn restore(&self, snapshot: &SnapshotRef) -> SnapshotResult<()>;

    /// Snapshots for `module_id`, oldest first.
    async fn list(&self, module_id: &str) -> SnapshotResult<Vec<SnapshotRef>>;

    async fn latest(&self, module_id: &str) -> SnapshotResult<Option<SnapshotRef>> {
        Ok(self.list(module_id).await?.pop())
    }

    async fn get(&self, module_id: &str, snapshot_id: &str) -> SnapshotResult<SnapshotRef> {
        self.list(module_id)
            .await?
            .into_iter()
            .find(|s| s.snapshot_id == snapshot_id)
            .ok_or_else(|| SnapshotError::NotFound {
                module_id: module_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            })
    }
}

/// Run blocking snapshot IO off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> SnapshotResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SnapshotResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SnapshotError::Io(std::io::Error::other(e)))?
}

/// Delete live files that are not listed in `keep`, then empty directories.
pub(crate) fn prune_extra(live_dir: &Path, keep: &[String]) -> SnapshotResult<()> {
    for rel in crate::domain::candidate::list_relative_files(live_dir)? {
        if !keep.contains(&rel) {
            std::fs::remove_file(live_dir.join(&rel))?;
        }
    }
    remove_empty_dirs(live_dir)?;
    Ok(())
}

fn remove_empty_dirs(dir: &Path) -> std::io::Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut empty = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if remove_empty_dirs(&entry.path())? {
                std::fs::remove_dir(entry.path())?;
            } else {
                empty = false;
            }
        } else {
            empty = false;
        }
    }
    Ok(empty)
}

/// Check every snapshot file against the live tree.
pub(crate) fn verify_live(snapshot: &SnapshotRef) -> SnapshotResult<()> {
    for file in &snapshot.files {
        let path = snapshot.live_dir.join(&file.path);
        let data = std::fs::read(&path)?;
        let actual = Digest::compute(&data);
        if actual != file.digest {
            return Err(SnapshotError::DigestMismatch {
                path: path.display().to_string(),
                expected: file.digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
    }
    Ok(())
}
