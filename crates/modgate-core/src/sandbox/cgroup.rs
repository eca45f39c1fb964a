//! cgroup v2 resource group for one sandboxed child.
//!
//! Creation needs write access to the cgroup hierarchy; without it the
//! executor runs with rlimits only.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::request::ResourceLimits;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// `cpu.max` period in microseconds; quota equals the period (one CPU).
const CPU_PERIOD_US: u64 = 100_000;

#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create `modgate-<uuid>` under `root` and write the limits.
    ///
    /// Returns `Ok(None)` when `root` is not a writable cgroup v2 hierarchy.
    pub fn create(root: &Path, limits: &ResourceLimits) -> io::Result<Option<Self>> {
        if !root.join("cgroup.controllers").exists() {
            debug!(root = %root.display(), "no cgroup v2 hierarchy");
            return Ok(None);
        }
        let path = root.join(format!("modgate-{}", Uuid::new_v4().simple()));
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(root = %root.display(), "cgroup hierarchy not writable");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let group = Self { path };
        let applied = group
            .write("memory.max", &limits.memory_bytes().to_string())
            .and_then(|_| group.write("pids.max", &limits.max_processes.to_string()))
            .and_then(|_| group.write("cpu.max", &format!("{CPU_PERIOD_US} {CPU_PERIOD_US}")));
        if let Err(e) = applied {
            // Controllers not delegated to this subtree.
            warn!(path = %group.path.display(), error = %e, "cgroup limits unavailable");
            let _ = fs::remove_dir(&group.path);
            return Ok(None);
        }
        let _ = group.write("memory.swap.max", "0");
        Ok(Some(group))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `cgroup.procs`; writing `0` to it joins the writer.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    fn write(&self, file: &str, value: &str) -> io::Result<()> {
        fs::write(self.path.join(file), value)
    }

    /// `oom_kill` counter from `memory.events`.
    pub fn oom_kills(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|s| parse_oom_kills(&s))
            .unwrap_or(0)
    }

    /// Kill every member and remove the group, retrying while members exit.
    pub async fn remove(&self) {
        let _ = self.write("cgroup.kill", "1");
        for _ in 0..20 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        warn!(path = %self.path.display(), "failed to remove sandbox cgroup");
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|l| l.split_once(' '))
        .find(|(k, _)| *k == "oom_kill")
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}
