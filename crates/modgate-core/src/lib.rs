//! modgate core library
//!
//! Generated extension modules enter as candidates, are statically
//! inspected, exercised in a resource-limited sandbox and only then promoted
//! into the live tree. Incidents reported against live modules drive a
//! severity-based repair policy.

pub mod audit;
pub mod config;
pub mod domain;
pub mod generator;
pub mod inspector;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod pipeline;
pub mod registry;
pub mod sandbox;
pub mod snapshot;
pub mod telemetry;

pub use domain::{derive_severity, Candidate, ErrorClass, Incident, PipelineError, Result};

pub use audit::{AuditError, AuditLog, AuditRecord};
pub use config::{ConfigError, Layout, ModgateConfig, RateLimit, SnapshotBackend};
pub use generator::{GenerateError, GenerateRequest, Generator, SourceGenerator, TemplateGenerator};
pub use inspector::{
    InspectError, InspectionIssue, InspectionReport, Inspector, InspectorConfig, IssueCategory,
};
pub use notify::{FileNotifier, Notification, Notifier, NotifyError};
pub use pipeline::{
    select_action, ErrorKind, ManagerSettings, PendingRepair, PipelineManager,
    PipelineManagerBuilder, PipelineOutcome, PipelineRequest, PipelineResult, PipelineStage,
    RateLimiter, RepairAction, RepairResult, RepairThresholds,
};
pub use registry::{ModuleRegistry, ModuleStatus, RegistryEntry, RegistryError};
pub use sandbox::{
    ExecutionState, Isolation, IsolationMode, ProcessSandbox, ProcessSandboxConfig,
    ResourceLimits, SandboxError, SandboxInvocation, SandboxResult, SandboxRunner, Scripted,
    ScriptedSandbox,
};
pub use snapshot::{
    FsSnapshotStore, GitSnapshotStore, SnapshotError, SnapshotKind, SnapshotRef, SnapshotStore,
};
pub use telemetry::{init_tracing, level_for_verbosity};

pub use metrics::METRICS;
pub use obs::{
    emit_lock_acquired, emit_lock_released, emit_lock_timeout, emit_pipeline_finished,
    emit_pipeline_started, emit_repair_decided, emit_repair_finished, emit_rollback_failed,
    emit_sandbox_finished, emit_sandbox_launch_failed, emit_stage, pipeline_span, PipelineSpan,
};

pub use modgate_state::{CoordinationStore, StoreConfig, StoreError};
