//! Backend selection at startup.
//!
//! [`open_store`] picks exactly one backend for the lifetime of the process:
//! etcd when configured and reachable, otherwise the local file store when
//! fallback is allowed. Backends are never mixed after this point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::backend::CoordinationBackend;
use crate::error::{StoreError, StoreResult};
use crate::etcd::{EtcdBackend, EtcdConfig};
use crate::file::FileBackend;
use crate::store::CoordinationStore;

/// Which backend the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    Etcd,
    #[default]
    File,
}

impl std::str::FromStr for BackendChoice {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(BackendChoice::Etcd),
            "file" => Ok(BackendChoice::File),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown store backend '{other}' (expected 'etcd' or 'file')"
            ))),
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendChoice,
    pub etcd_endpoint: Option<String>,
    pub namespace: String,
    /// Use the local file store when etcd is unreachable at startup.
    pub fallback_to_file: bool,
    pub request_timeout_ms: u64,
    /// Directory for the local file store. Filled in from the data root
    /// when left unset.
    pub file_root: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::File,
            etcd_endpoint: None,
            namespace: "/modgate/".to_string(),
            fallback_to_file: true,
            request_timeout_ms: 3_000,
            file_root: None,
        }
    }
}

/// Open the configured backend.
#[instrument(skip(config), fields(backend = ?config.backend))]
pub async fn open_backend(config: &StoreConfig) -> StoreResult<Arc<dyn CoordinationBackend>> {
    match config.backend {
        BackendChoice::File => open_file(config),
        BackendChoice::Etcd => {
            let endpoint = config.etcd_endpoint.clone().ok_or_else(|| {
                StoreError::InvalidArgument("etcd backend selected without etcd_endpoint".into())
            })?;
            let etcd = EtcdConfig::new(endpoint)
                .with_namespace(config.namespace.clone())
                .with_request_timeout(Duration::from_millis(config.request_timeout_ms));
            match EtcdBackend::connect(etcd).await {
                Ok(backend) => Ok(Arc::new(backend)),
                Err(e) if config.fallback_to_file => {
                    warn!(error = %e, "etcd unreachable, using local file store for this process");
                    open_file(config)
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn open_file(config: &StoreConfig) -> StoreResult<Arc<dyn CoordinationBackend>> {
    let root = config.file_root.clone().ok_or_else(|| {
        StoreError::InvalidArgument("file backend selected without file_root".into())
    })?;
    let backend = FileBackend::open(&root)?;
    info!(root = %root.display(), "file store opened");
    Ok(Arc::new(backend))
}

/// Open the configured backend and wrap it in a [`CoordinationStore`].
pub async fn open_store(config: &StoreConfig) -> StoreResult<CoordinationStore> {
    let backend = open_backend(config).await?;
    let store = CoordinationStore::new(backend);
    info!(backend = %store.backend_kind(), holder = %store.holder(), "coordination store ready");
    Ok(store)
}
