//! Pipeline run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inspector::InspectionReport;
use crate::sandbox::SandboxResult;

/// Per-candidate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Generated,
    Inspected,
    Rejected,
    SandboxTested,
    Failed,
    Promoted,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Generated => "generated",
            PipelineStage::Inspected => "inspected",
            PipelineStage::Rejected => "rejected",
            PipelineStage::SandboxTested => "sandbox_tested",
            PipelineStage::Failed => "failed",
            PipelineStage::Promoted => "promoted",
        }
    }
}

/// Infrastructure failure categories for `PipelineOutcome::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LockTimeout,
    StoreUnavailable,
    SandboxLaunch,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Promoted,
    Rejected,
    Failed,
    RateLimited,
    Error { kind: ErrorKind },
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::Promoted => "promoted",
            PipelineOutcome::Rejected => "rejected",
            PipelineOutcome::Failed => "failed",
            PipelineOutcome::RateLimited => "rate_limited",
            PipelineOutcome::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub module_id: String,
    pub category: String,
    pub run_id: Uuid,
    pub stages: Vec<StageRecord>,
    pub promoted: bool,
    #[serde(flatten)]
    pub outcome: PipelineOutcome,
    /// Always set for anything but a promotion.
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspection: Option<InspectionReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<SandboxResult>,
    /// Registry version after promotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub details: serde_json::Value,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn new(module_id: &str, category: &str, run_id: Uuid) -> Self {
        Self {
            module_id: module_id.to_string(),
            category: category.to_string(),
            run_id,
            stages: Vec::new(),
            promoted: false,
            outcome: PipelineOutcome::Error {
                kind: ErrorKind::Internal,
            },
            reason: None,
            inspection: None,
            tests: Vec::new(),
            version: None,
            snapshot_id: None,
            signature: None,
            details: serde_json::Value::Null,
            duration_ms: 0,
        }
    }

    pub(crate) fn record(&mut self, stage: PipelineStage) {
        self.stages.push(StageRecord {
            stage,
            at: Utc::now(),
        });
    }

    pub fn last_stage(&self) -> Option<PipelineStage> {
        self.stages.last().map(|s| s.stage)
    }

    pub(crate) fn finish(&mut self, outcome: PipelineOutcome, reason: Option<String>) {
        self.promoted = outcome == PipelineOutcome::Promoted;
        self.outcome = outcome;
        self.reason = reason;
    }
}
