//! Error types for modgate-state

use thiserror::Error;

/// Errors that can occur in the coordination store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A lock could not be acquired within the caller's wait budget.
    #[error("lock timeout: could not acquire '{key}' within {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Neither the remote backend nor the local fallback is writable.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// Unlock was attempted by a holder that does not own the lock.
    #[error("lock '{key}' is not held by '{holder}'")]
    NotLockHolder { key: String, holder: String },

    /// Persisted state could not be parsed.
    #[error("corrupt store state: {0}")]
    Corrupt(String),

    /// Invalid key or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors caused by the backing medium rather than by contention.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Corrupt(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result type for coordination store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
