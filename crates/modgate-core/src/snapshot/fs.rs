//! File-copy snapshots over the content-addressed blob store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::blobs::{write_atomic, BlobStore};
use super::index::ManifestIndex;
use super::{
    blocking, prune_extra, verify_live, SnapshotFile, SnapshotKind, SnapshotRef, SnapshotResult,
    SnapshotStore,
};
use crate::domain::candidate::{list_relative_files, remove_tree};

/// Layout: manifests in `<root>/<module_id>/`, blobs in `<root>/.objects/`.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    index: ManifestIndex,
    blobs: BlobStore,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            blobs: BlobStore::new(root.join(".objects")),
            index: ManifestIndex::new(root),
        }
    }

    fn capture(&self, module_id: &str, live_dir: &Path) -> SnapshotResult<SnapshotRef> {
        let mut files = Vec::new();
        for rel in list_relative_files(live_dir)? {
            let data = std::fs::read(live_dir.join(&rel))?;
            let digest = self.blobs.put(&data)?;
            files.push(SnapshotFile {
                path: rel,
                digest,
                size: data.len() as u64,
            });
        }
        let snapshot = self.index.append(SnapshotRef {
            snapshot_id: String::new(),
            module_id: module_id.to_string(),
            live_dir: live_dir.to_path_buf(),
            created_at: Utc::now(),
            kind: SnapshotKind::FileCopy,
            files,
        })?;
        info!(
            module_id = %module_id,
            snapshot_id = %snapshot.snapshot_id,
            files = snapshot.files.len(),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    fn apply(&self, snapshot: &SnapshotRef) -> SnapshotResult<()> {
        if snapshot.is_empty() {
            remove_tree(&snapshot.live_dir)?;
            return Ok(());
        }
        // Read and verify every blob before touching the live tree.
        let mut contents = Vec::with_capacity(snapshot.files.len());
        for file in &snapshot.files {
            contents.push((file.path.as_str(), self.blobs.get(&file.digest)?));
        }
        for (rel, data) in &contents {
            write_atomic(&snapshot.live_dir.join(rel), data)?;
        }
        prune_extra(&snapshot.live_dir, &snapshot.file_manifest())?;
        verify_live(snapshot)?;
        info!(
            module_id = %snapshot.module_id,
            snapshot_id = %snapshot.snapshot_id,
            "snapshot restored"
        );
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn snapshot(&self, module_id: &str, live_dir: &Path) -> SnapshotResult<SnapshotRef> {
        let this = self.clone();
        let module_id = module_id.to_string();
        let live_dir = live_dir.to_path_buf();
        blocking(move || this.capture(&module_id, &live_dir)).await
    }

    async fn restore(&self, snapshot: &SnapshotRef) -> SnapshotResult<()> {
        let this = self.clone();
        let snapshot = snapshot.clone();
        blocking(move || this.apply(&snapshot)).await
    }

    async fn list(&self, module_id: &str) -> SnapshotResult<Vec<SnapshotRef>> {
        let index = self.index.clone();
        let module_id = module_id.to_string();
        blocking(move || index.list(&module_id)).await
    }
}
