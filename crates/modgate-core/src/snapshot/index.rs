//! Append-only manifest index: `<root>/<module_id>/<snapshot_id>.json`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{SnapshotError, SnapshotRef, SnapshotResult};

#[derive(Debug, Clone)]
pub struct ManifestIndex {
    root: PathBuf,
}

impl ManifestIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_dir(&self, module_id: &str) -> PathBuf {
        self.root.join(module_id)
    }

    fn ids(&self, module_id: &str) -> io::Result<Vec<String>> {
        let dir = self.module_dir(module_id);
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Assign the next sequence id and persist without overwriting.
    pub fn append(&self, mut snapshot: SnapshotRef) -> SnapshotResult<SnapshotRef> {
        let dir = self.module_dir(&snapshot.module_id);
        fs::create_dir_all(&dir)?;
        let stamp = snapshot.created_at.format("%Y%m%dT%H%M%S%.3fZ");
        let mut seq = self
            .ids(&snapshot.module_id)?
            .last()
            .and_then(|id| id.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        loop {
            seq += 1;
            snapshot.snapshot_id = format!("{seq:06}-{stamp}");
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&serde_json::to_vec_pretty(&snapshot)?)?;
            tmp.as_file().sync_all()?;
            match tmp.persist_noclobber(dir.join(format!("{}.json", snapshot.snapshot_id))) {
                Ok(_) => return Ok(snapshot),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(SnapshotError::Io(e.error)),
            }
        }
    }

    pub fn list(&self, module_id: &str) -> SnapshotResult<Vec<SnapshotRef>> {
        let dir = self.module_dir(module_id);
        let mut out = Vec::new();
        for id in self.ids(module_id)? {
            let bytes = fs::read(dir.join(format!("{id}.json")))?;
            let snapshot: SnapshotRef = serde_json::from_slice(&bytes)
                .map_err(|e| SnapshotError::Corrupt(format!("{module_id}/{id}: {e}")))?;
            out.push(snapshot);
        }
        Ok(out)
    }
}
