//! Sandbox invocation and resource ceilings.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SandboxError;

/// Ceilings applied to the child before it runs candidate code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_seconds: u64,
    pub open_files: u64,
    pub max_processes: u64,
    /// Cap on captured stdout and stderr, each.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu_seconds: 5,
            open_files: 512,
            max_processes: 32,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

/// One execution of one entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInvocation {
    /// Candidate directory; the child runs in it, through the jail at `/work` when confined.
    pub candidate_dir: PathBuf,
    /// Entry file relative to `candidate_dir`.
    pub entry_file: String,
    pub entry_point: String,
    pub payload: serde_json::Value,
    pub limits: ResourceLimits,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl SandboxInvocation {
    pub fn new(
        candidate_dir: impl Into<PathBuf>,
        entry_file: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            candidate_dir: candidate_dir.into(),
            entry_file: entry_file.into(),
            entry_point: entry_point.into(),
            payload: serde_json::Value::Object(Default::default()),
            limits: ResourceLimits::default(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn entry_path(&self) -> PathBuf {
        self.candidate_dir.join(&self.entry_file)
    }

    /// Reject requests that would escape the staging directory or cannot run.
    pub fn validate(&self) -> Result<(), SandboxError> {
        let rel = Path::new(&self.entry_file);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if self.entry_file.is_empty() || escapes {
            return Err(SandboxError::InvalidRequest(format!(
                "entry file `{}` must be a relative path inside the candidate",
                self.entry_file
            )));
        }
        if !is_identifier(&self.entry_point) {
            return Err(SandboxError::InvalidRequest(format!(
                "entry point `{}` is not an identifier",
                self.entry_point
            )));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::InvalidRequest("timeout must be positive".into()));
        }
        if self.limits.memory_mb == 0
            || self.limits.cpu_seconds == 0
            || self.limits.open_files == 0
            || self.limits.max_processes == 0
        {
            return Err(SandboxError::InvalidRequest(
                "resource limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
