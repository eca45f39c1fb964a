//! Sandbox executor: one candidate entry point in a resource-limited child.
//!
//! # Modules
//!
//! - [`request`]: `SandboxInvocation` + `ResourceLimits`
//! - [`execution`]: `ExecutionState` lifecycle, `SandboxResult`, classification
//! - [`harness`]: interpreter-side harness and its structured record
//! - [`process`]: `ProcessSandbox` (rlimits, process group, timeout kill)
//! - [`confine`]: namespaces and the read-only jail around the child
//! - [`cgroup`]: optional cgroup v2 group per run
//! - [`scripted`]: `ScriptedSandbox` for tests
//! - [`error`]: `SandboxError`

pub mod cgroup;
pub mod confine;
pub mod error;
pub mod execution;
pub mod harness;
pub mod process;
pub mod request;
pub mod scripted;

use async_trait::async_trait;

pub use confine::{Isolation, IsolationMode};
pub use error::SandboxError;
pub use execution::{ExecutionState, ExecutionTrace, SandboxErrorKind, SandboxResult};
pub use process::{ProcessSandbox, ProcessSandboxConfig};
pub use request::{ResourceLimits, SandboxInvocation};
pub use scripted::{Scripted, ScriptedSandbox};

/// Runs one invocation to a terminal state.
///
/// Candidate misbehaviour is an `Ok` result with `ok == false`; `Err` is
/// reserved for failures to launch or invalid requests.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, invocation: SandboxInvocation) -> Result<SandboxResult, SandboxError>;
}
