//! Startup configuration.
//!
//! [`ModgateConfig::load`] reads an optional TOML file, applies `MODGATE_*`
//! environment overrides on top and validates the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modgate_state::{BackendChoice, StoreConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::repair::{RepairAction, RepairThresholds};
use crate::sandbox::{IsolationMode, ProcessSandboxConfig, ResourceLimits};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Directory layout derived from the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn candidates(&self) -> PathBuf {
        self.root.join("candidates")
    }

    pub fn modules(&self) -> PathBuf {
        self.root.join("modules")
    }

    /// Live directory of one module.
    pub fn live_dir(&self, category: &str, module_id: &str) -> PathBuf {
        self.modules().join(category).join(module_id)
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn state(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn notifications(&self) -> PathBuf {
        self.root.join("notifications")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./modgate-data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub memory_mb: u64,
    pub cpu_seconds: u64,
    pub open_files: u64,
    pub max_processes: u64,
    pub timeout_secs: u64,
    pub interpreter: String,
    pub use_cgroups: bool,
    pub allow_network: bool,
    /// `required` refuses to run a candidate the kernel cannot confine.
    pub isolation: IsolationMode,
    pub runtime_paths: Vec<PathBuf>,
    pub max_output_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        let process = ProcessSandboxConfig::default();
        Self {
            memory_mb: limits.memory_mb,
            cpu_seconds: limits.cpu_seconds,
            open_files: limits.open_files,
            max_processes: limits.max_processes,
            timeout_secs: 20,
            interpreter: process.interpreter,
            use_cgroups: process.use_cgroups,
            allow_network: process.allow_network,
            isolation: process.isolation,
            runtime_paths: process.runtime_paths,
            max_output_bytes: limits.max_output_bytes,
        }
    }
}

impl SandboxSettings {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb,
            cpu_seconds: self.cpu_seconds,
            open_files: self.open_files,
            max_processes: self.max_processes,
            max_output_bytes: self.max_output_bytes,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn process_config(&self) -> ProcessSandboxConfig {
        ProcessSandboxConfig {
            interpreter: self.interpreter.clone(),
            use_cgroups: self.use_cgroups,
            allow_network: self.allow_network,
            isolation: self.isolation,
            runtime_paths: self.runtime_paths.clone(),
            ..ProcessSandboxConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub workers: usize,
    pub lock_ttl_secs: u64,
    pub lock_wait_ms: u64,
    /// Payloads passed to `execute` during sandbox testing, one run each.
    pub test_payloads: Vec<serde_json::Value>,
    pub strict_inspection: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 6,
            lock_ttl_secs: 60,
            lock_wait_ms: 5_000,
            test_payloads: vec![serde_json::json!({})],
            strict_inspection: false,
        }
    }
}

impl PipelineSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSettings {
    pub thresholds: RepairThresholds,
    /// Modules that never receive automated repairs.
    pub protected_modules: Vec<String>,
    /// Actions parked for a human decision instead of running.
    pub require_approval: Vec<RepairAction>,
    pub notify_on_failure: bool,
    pub max_repair_attempts: u32,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            thresholds: RepairThresholds::default(),
            protected_modules: Vec::new(),
            require_approval: Vec::new(),
            notify_on_failure: true,
            max_repair_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackend {
    #[default]
    Files,
    Git,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub backend: SnapshotBackend,
}

/// Optional per-window ceilings for one action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub per_hour: Option<u32>,
    pub per_day: Option<u32>,
}

fn default_rate_limits() -> BTreeMap<String, RateLimit> {
    BTreeMap::from([
        (
            "repair".to_string(),
            RateLimit {
                per_hour: Some(10),
                per_day: None,
            },
        ),
        (
            "regenerate".to_string(),
            RateLimit {
                per_hour: None,
                per_day: Some(5),
            },
        ),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModgateConfig {
    pub paths: PathsConfig,
    pub store: StoreConfig,
    pub sandbox: SandboxSettings,
    pub pipeline: PipelineSettings,
    pub repair: RepairSettings,
    pub snapshots: SnapshotSettings,
    #[serde(default = "default_rate_limits")]
    pub rate_limits: BTreeMap<String, RateLimit>,
}

impl Default for ModgateConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            store: StoreConfig::default(),
            sandbox: SandboxSettings::default(),
            pipeline: PipelineSettings::default(),
            repair: RepairSettings::default(),
            snapshots: SnapshotSettings::default(),
            rate_limits: default_rate_limits(),
        }
    }
}

impl ModgateConfig {
    /// File (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `MODGATE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup("MODGATE_HOME") {
            self.paths.root = PathBuf::from(home);
        }
        if let Some(backend) = lookup("MODGATE_STORE_BACKEND") {
            self.store.backend = backend
                .parse::<BackendChoice>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(endpoint) = lookup("MODGATE_ETCD_ENDPOINT") {
            self.store.etcd_endpoint = Some(endpoint);
        }
        if let Some(v) = lookup("MODGATE_SANDBOX_MEMORY_MB") {
            self.sandbox.memory_mb = parse_num("MODGATE_SANDBOX_MEMORY_MB", &v)?;
        }
        if let Some(v) = lookup("MODGATE_SANDBOX_CPU_SECS") {
            self.sandbox.cpu_seconds = parse_num("MODGATE_SANDBOX_CPU_SECS", &v)?;
        }
        if let Some(v) = lookup("MODGATE_SANDBOX_OPEN_FILES") {
            self.sandbox.open_files = parse_num("MODGATE_SANDBOX_OPEN_FILES", &v)?;
        }
        if let Some(v) = lookup("MODGATE_SANDBOX_TIMEOUT_SECS") {
            self.sandbox.timeout_secs = parse_num("MODGATE_SANDBOX_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("MODGATE_SANDBOX_ISOLATION") {
            self.sandbox.isolation = match v.as_str() {
                "required" => IsolationMode::Required,
                "best_effort" => IsolationMode::BestEffort,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "MODGATE_SANDBOX_ISOLATION must be required or best_effort, got {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("MODGATE_WORKERS") {
            self.pipeline.workers = parse_num("MODGATE_WORKERS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers must be at least 1".into());
        }
        if self.pipeline.lock_ttl_secs == 0 {
            return invalid("pipeline.lock_ttl_secs must be positive".into());
        }
        if self.pipeline.test_payloads.is_empty() {
            return invalid("pipeline.test_payloads must contain at least one payload".into());
        }
        for (name, value) in [
            ("sandbox.memory_mb", self.sandbox.memory_mb),
            ("sandbox.cpu_seconds", self.sandbox.cpu_seconds),
            ("sandbox.open_files", self.sandbox.open_files),
            ("sandbox.max_processes", self.sandbox.max_processes),
            ("sandbox.timeout_secs", self.sandbox.timeout_secs),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        if self.sandbox.max_output_bytes == 0 {
            return invalid("sandbox.max_output_bytes must be positive".into());
        }
        if self.sandbox.interpreter.trim().is_empty() {
            return invalid("sandbox.interpreter must not be empty".into());
        }
        self.repair
            .thresholds
            .validate()
            .map_err(ConfigError::Invalid)?;
        if self.repair.max_repair_attempts == 0 {
            return invalid("repair.max_repair_attempts must be at least 1".into());
        }
        if self.store.backend == BackendChoice::Etcd && self.store.etcd_endpoint.is_none() {
            return invalid("store.etcd_endpoint is required for the etcd backend".into());
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.paths.root)
    }

    /// Store settings with the file root filled in from the layout.
    pub fn store_config(&self) -> StoreConfig {
        let mut store = self.store.clone();
        if store.file_root.is_none() {
            store.file_root = Some(self.layout().state());
        }
        store
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}={value} is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = ModgateConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.workers, 6);
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(20));
        assert_eq!(config.sandbox.isolation, IsolationMode::Required);
        assert_eq!(config.rate_limits["repair"].per_hour, Some(10));
        assert_eq!(config.rate_limits["regenerate"].per_day, Some(5));
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = ModgateConfig::from_toml_str(
            r#"
            [paths]
            root = "/var/lib/modgate"

            [sandbox]
            memory_mb = 128
            timeout_secs = 3
            isolation = "best_effort"

            [pipeline]
            workers = 2
            test_payloads = [{ action = "ping" }, {}]

            [repair]
            protected_modules = ["core-auth"]
            require_approval = ["rollback"]

            [repair.thresholds]
            disable = 10
            rollback = 8
            regenerate = 5

            [rate_limits.rollback]
            per_hour = 3
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.layout().audit_log(), PathBuf::from("/var/lib/modgate/audit.jsonl"));
        assert_eq!(config.sandbox.limits().memory_mb, 128);
        assert_eq!(config.sandbox.cpu_seconds, 5);
        assert_eq!(config.sandbox.process_config().isolation, IsolationMode::BestEffort);
        assert_eq!(config.sandbox.runtime_paths, ModgateConfig::default().sandbox.runtime_paths);
        assert_eq!(config.pipeline.test_payloads.len(), 2);
        assert_eq!(config.repair.require_approval, vec![RepairAction::Rollback]);
        assert_eq!(config.repair.thresholds.disable, 10);
        assert_eq!(config.rate_limits["rollback"].per_hour, Some(3));
        assert!(!config.rate_limits.contains_key("repair"));
    }

    #[test]
    fn env_overrides_apply_last() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MODGATE_HOME", "/tmp/mg"),
            ("MODGATE_WORKERS", "3"),
            ("MODGATE_SANDBOX_TIMEOUT_SECS", "7"),
            ("MODGATE_STORE_BACKEND", "etcd"),
            ("MODGATE_ETCD_ENDPOINT", "http://etcd:2379"),
            ("MODGATE_SANDBOX_ISOLATION", "best_effort"),
        ]);
        let mut config = ModgateConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.paths.root, PathBuf::from("/tmp/mg"));
        assert_eq!(config.pipeline.workers, 3);
        assert_eq!(config.sandbox.timeout_secs, 7);
        assert_eq!(config.sandbox.isolation, IsolationMode::BestEffort);
        assert_eq!(config.store.backend, BackendChoice::Etcd);
        assert_eq!(config.store_config().file_root, Some(PathBuf::from("/tmp/mg/state")));
    }

    #[test]
    fn garbage_env_number_is_invalid() {
        let mut config = ModgateConfig::default();
        let err = config
            .apply_env(|k| (k == "MODGATE_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("MODGATE_WORKERS")));
    }

    #[test]
    fn zero_workers_and_limits_are_rejected() {
        let mut config = ModgateConfig::default();
        config.pipeline.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ModgateConfig::default();
        config.sandbox.open_files = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("open_files")));
    }

    #[test]
    fn unordered_thresholds_are_rejected() {
        let mut config = ModgateConfig::default();
        config.repair.thresholds.rollback = 9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn etcd_without_endpoint_is_rejected() {
        let mut config = ModgateConfig::default();
        config.store.backend = BackendChoice::Etcd;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        match ModgateConfig::load(Some(&path)) {
            Err(ConfigError::Read { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected Read error, got {:?}", other),
        }
    }
}
