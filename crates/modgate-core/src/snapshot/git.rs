//! Version-control snapshots: the live tree is committed to a git repository
//! and the snapshot records the resulting revision.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::index::ManifestIndex;
use super::{
    blocking, verify_live, Digest, SnapshotError, SnapshotFile, SnapshotKind, SnapshotRef,
    SnapshotResult, SnapshotStore,
};
use crate::domain::candidate::{list_relative_files, remove_tree};

/// Run git in `repo_dir` with a fixed committer identity.
fn run_git(repo_dir: &Path, args: &[&str]) -> SnapshotResult<String> {
    let output = Command::new("git")
        .args(["-c", "user.name=modgate", "-c", "user.email=modgate@localhost"])
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| SnapshotError::Git(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SnapshotError::Git(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// HEAD commit of the repository at `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> SnapshotResult<String> {
    let sha = run_git(repo_dir, &["rev-parse", "HEAD"])?;
    if sha.is_empty() {
        return Err(SnapshotError::Git(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }
    Ok(sha)
}

/// Whether `git` can be executed at all.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Snapshots committed to a repository rooted at the live modules tree.
///
/// Git operations on one repository are serialized through an in-process
/// mutex because they share the repository index.
#[derive(Debug, Clone)]
pub struct GitSnapshotStore {
    repo_root: PathBuf,
    index: ManifestIndex,
    repo_lock: Arc<Mutex<()>>,
}

impl GitSnapshotStore {
    pub fn new(repo_root: impl Into<PathBuf>, index_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            index: ManifestIndex::new(index_root),
            repo_lock: Arc::new(Mutex::new(())),
        }
    }

    fn ensure_repo(&self) -> SnapshotResult<()> {
        if self.repo_root.join(".git").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.repo_root)?;
        run_git(&self.repo_root, &["init", "-q"])?;
        run_git(
            &self.repo_root,
            &["commit", "-q", "--allow-empty", "-m", "modgate: initialize"],
        )?;
        Ok(())
    }

    fn relative<'a>(&self, live_dir: &'a Path) -> SnapshotResult<&'a Path> {
        live_dir.strip_prefix(&self.repo_root).map_err(|_| {
            SnapshotError::Git(format!(
                "{} is outside repository {}",
                live_dir.display(),
                self.repo_root.display()
            ))
        })
    }

    fn guard(&self) -> SnapshotResult<std::sync::MutexGuard<'_, ()>> {
        self.repo_lock
            .lock()
            .map_err(|_| SnapshotError::Git("repository lock poisoned".into()))
    }

    fn capture(&self, module_id: &str, live_dir: &Path) -> SnapshotResult<SnapshotRef> {
        let _guard = self.guard()?;
        self.ensure_repo()?;
        let rel = self.relative(live_dir)?.to_string_lossy().into_owned();

        let mut files = Vec::new();
        for path in list_relative_files(live_dir)? {
            let data = std::fs::read(live_dir.join(&path))?;
            files.push(SnapshotFile {
                path,
                digest: Digest::compute(&data),
                size: data.len() as u64,
            });
        }

        // `add -A` of a vanished path fails unless the path is tracked.
        if live_dir.exists() || !run_git(&self.repo_root, &["ls-files", "--", &rel])?.is_empty() {
            run_git(&self.repo_root, &["add", "-A", "--", &rel])?;
        }
        let message = format!("modgate: snapshot {module_id}");
        run_git(&self.repo_root, &["commit", "-q", "--allow-empty", "-m", &message])?;
        let revision = capture_head_sha(&self.repo_root)?;

        let snapshot = self.index.append(SnapshotRef {
            snapshot_id: String::new(),
            module_id: module_id.to_string(),
            live_dir: live_dir.to_path_buf(),
            created_at: Utc::now(),
            kind: SnapshotKind::Git { revision },
            files,
        })?;
        info!(module_id = %module_id, snapshot_id = %snapshot.snapshot_id, "git snapshot taken");
        Ok(snapshot)
    }

    fn apply(&self, snapshot: &SnapshotRef) -> SnapshotResult<()> {
        let SnapshotKind::Git { revision } = &snapshot.kind else {
            return Err(SnapshotError::Corrupt(format!(
                "snapshot {} is not a git snapshot",
                snapshot.snapshot_id
            )));
        };
        let _guard = self.guard()?;
        let rel = self.relative(&snapshot.live_dir)?.to_string_lossy().into_owned();
        remove_tree(&snapshot.live_dir)?;
        if !snapshot.is_empty() {
            run_git(&self.repo_root, &["checkout", revision.as_str(), "--", &rel])?;
        }
        verify_live(snapshot)?;
        info!(
            module_id = %snapshot.module_id,
            revision = %revision,
            "git snapshot restored"
        );
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for GitSnapshotStore {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store(tmp: &Path) -> GitSnapshotStore {
        GitSnapshotStore::new(tmp.join("modules"), tmp.join("snapshots"))
    }

    #[tokio::test]
    async fn commit_and_restore_round_trip() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("modules/connector/m1");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("a.py"), "v1").unwrap();
        let store = store(tmp.path());

        let snap = store.snapshot("m1", &live).await.unwrap();
        let SnapshotKind::Git { revision } = &snap.kind else {
            panic!("expected git snapshot");
        };
        assert_eq!(revision.len(), 40);

        fs::write(live.join("a.py"), "v2").unwrap();
        fs::write(live.join("extra.py"), "x").unwrap();
        store.restore(&snap).await.unwrap();
        assert_eq!(fs::read_to_string(live.join("a.py")).unwrap(), "v1");
        assert!(!live.join("extra.py").exists());
    }

    #[tokio::test]
    async fn snapshot_of_absent_module_restores_to_absent() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("modules/connector/fresh");
        let store = store(tmp.path());
        let snap = store.snapshot("fresh", &live).await.unwrap();
        assert!(snap.is_empty());
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("a.py"), "new").unwrap();
        store.restore(&snap).await.unwrap();
        assert!(!live.exists());
    }

    #[tokio::test]
    async fn live_dir_outside_repository_is_rejected() {
        if !git_available() {
            eprintln!("git not installed; skipping");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let elsewhere = tmp.path().join("elsewhere");
        assert!(matches!(
            store.snapshot("m1", &elsewhere).await,
            Err(SnapshotError::Git(_))
        ));
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
    }
}
