//! Error types for the sandbox executor.

/// Infrastructure failures of the sandbox itself.
///
/// A candidate that crashes, times out or exceeds a limit is not an error;
/// it is a [`super::SandboxResult`] with `ok == false`.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox crashed on launch: {reason}")]
    CrashedOnLaunch { reason: String },

    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),
}

impl SandboxError {
    pub(crate) fn launch(reason: impl std::fmt::Display) -> Self {
        SandboxError::CrashedOnLaunch {
            reason: reason.to_string(),
        }
    }
}
