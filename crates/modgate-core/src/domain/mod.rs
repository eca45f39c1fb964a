//! Domain models for the promotion pipeline.
//!
//! - `Candidate`: staged, not-yet-promoted module files
//! - `Incident`: runtime failure report for a live module
//! - `PipelineError` / `ErrorClass`: the error taxonomy shared by every stage

pub mod candidate;
pub mod error;
pub mod incident;

pub use candidate::Candidate;
pub use error::{ErrorClass, PipelineError, Result};
pub use incident::{derive_severity, Incident};
