//! Error taxonomy for the promotion pipeline.
//!
//! Infrastructure failures, candidate failures and policy rejections are kept
//! apart so callers can match on [`ErrorClass`] rather than message text.

use modgate_state::StoreError;

use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::generator::GenerateError;
use crate::inspector::InspectError;
use crate::notify::NotifyError;
use crate::registry::RegistryError;
use crate::sandbox::SandboxError;
use crate::snapshot::SnapshotError;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Store, lock, sandbox launch, filesystem. Always surfaced to the caller.
    Infrastructure,
    /// The candidate itself is bad.
    Candidate,
    /// Rejected by rate limits or permissions before any side effect.
    Policy,
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("inspection error: {0}")]
    Inspect(#[from] InspectError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("generator error: {0}")]
    Generate(#[from] GenerateError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("rate limited: {action} exceeded {limit} per {window}")]
    RateLimited {
        action: String,
        limit: u32,
        window: String,
    },

    #[error("action not permitted: {0}")]
    NotPermitted(String),

    #[error("pending approval not found: {0}")]
    ApprovalNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("candidate {0} changed after inspection began")]
    CandidateModified(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("task failed: {0}")]
    Task(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorClass {
        match self {
            PipelineError::RateLimited { .. }
            | PipelineError::NotPermitted(_)
            | PipelineError::ApprovalNotFound(_) => ErrorClass::Policy,
            PipelineError::Inspect(InspectError::NoSources(_)) => ErrorClass::Candidate,
            PipelineError::Generate(GenerateError::InvalidRequest(_))
            | PipelineError::CandidateModified(_) => ErrorClass::Candidate,
            _ => ErrorClass::Infrastructure,
        }
    }

    /// True when the coordination store itself failed.
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            PipelineError::Store(e) | PipelineError::Registry(RegistryError::Store(e)) => {
                e.is_unavailable()
            }
            _ => false,
        }
    }

    /// True when the error came from lock contention.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(StoreError::LockTimeout { .. })
                | PipelineError::Registry(RegistryError::Store(StoreError::LockTimeout { .. }))
        )
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
