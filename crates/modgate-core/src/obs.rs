//! Structured lifecycle events for pipelines, sandbox runs, locks and repairs.
//!
//! Every helper logs a fixed `event` name so log consumers can filter on it.

use tracing::{info, warn};

/// Span for one pipeline run; attach to futures with `Instrument`.
pub fn pipeline_span(module_id: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("modgate.pipeline", module_id = %module_id, run_id = %run_id)
}

/// Enters [`pipeline_span`] for as long as it lives. Synchronous code only.
pub struct PipelineSpan {
    _span: tracing::span::EnteredSpan,
}

impl PipelineSpan {
    pub fn enter(module_id: &str, run_id: &str) -> Self {
        Self {
            _span: pipeline_span(module_id, run_id).entered(),
        }
    }
}

pub fn emit_pipeline_started(module_id: &str, category: &str, driver: &str) {
    info!(
        event = "pipeline.started",
        module_id = %module_id,
        category = %category,
        driver = %driver,
    );
}

pub fn emit_stage(module_id: &str, stage: &str) {
    info!(event = "pipeline.stage", module_id = %module_id, stage = %stage);
}

pub fn emit_pipeline_finished(module_id: &str, outcome: &str, duration_ms: u64, reason: &str) {
    info!(
        event = "pipeline.finished",
        module_id = %module_id,
        outcome = %outcome,
        duration_ms = duration_ms,
        reason = %reason,
    );
}

pub fn emit_sandbox_finished(entry: &str, state: &str, ok: bool, execution_time_ms: u64) {
    info!(
        event = "sandbox.finished",
        entry = %entry,
        state = %state,
        ok = ok,
        execution_time_ms = execution_time_ms,
    );
}

pub fn emit_sandbox_launch_failed(entry: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sandbox.launch_failed", entry = %entry, error = %error);
}

pub fn emit_lock_acquired(key: &str, holder: &str) {
    info!(event = "lock.acquired", key = %key, holder = %holder);
}

pub fn emit_lock_released(key: &str) {
    info!(event = "lock.released", key = %key);
}

pub fn emit_lock_timeout(key: &str) {
    warn!(event = "lock.timeout", key = %key);
}

pub fn emit_repair_decided(module_id: &str, severity: u8, action: &str) {
    info!(
        event = "repair.decided",
        module_id = %module_id,
        severity = severity,
        action = %action,
    );
}

pub fn emit_repair_finished(module_id: &str, action: &str, success: bool) {
    info!(
        event = "repair.finished",
        module_id = %module_id,
        action = %action,
        success = success,
    );
}

pub fn emit_rollback_failed(module_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "pipeline.rollback_failed", module_id = %module_id, error = %error);
}
