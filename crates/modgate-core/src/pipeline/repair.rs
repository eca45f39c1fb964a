//! Repair-action selection for incidents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Incident;

/// Store namespace for repairs waiting on a human.
pub const APPROVALS_PREFIX: &str = "approvals/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    Disable,
    Rollback,
    Regenerate,
    Notify,
}

impl RepairAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairAction::Disable => "disable",
            RepairAction::Rollback => "rollback",
            RepairAction::Regenerate => "regenerate",
            RepairAction::Notify => "notify",
        }
    }
}

impl std::fmt::Display for RepairAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowest severity for each automated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairThresholds {
    pub disable: u8,
    pub rollback: u8,
    pub regenerate: u8,
}

impl Default for RepairThresholds {
    fn default() -> Self {
        Self {
            disable: 9,
            rollback: 7,
            regenerate: 4,
        }
    }
}

impl RepairThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.disable > 10 {
            return Err(format!("repair.thresholds.disable={} exceeds 10", self.disable));
        }
        if !(self.disable > self.rollback && self.rollback > self.regenerate) {
            return Err(format!(
                "repair thresholds must descend strictly: disable={} rollback={} regenerate={}",
                self.disable, self.rollback, self.regenerate
            ));
        }
        Ok(())
    }
}

/// Map a severity to its repair action.
pub fn select_action(severity: u8, thresholds: &RepairThresholds) -> RepairAction {
    if severity >= thresholds.disable {
        RepairAction::Disable
    } else if severity >= thresholds.rollback {
        RepairAction::Rollback
    } else if severity >= thresholds.regenerate {
        RepairAction::Regenerate
    } else {
        RepairAction::Notify
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairResult {
    pub module_id: String,
    pub severity: u8,
    pub action: RepairAction,
    pub success: bool,
    pub attempts: u32,
    #[serde(default)]
    pub pending_approval: bool,
    #[serde(default)]
    pub rate_limited: bool,
    pub reason: String,
    pub details: serde_json::Value,
}

impl RepairResult {
    pub(crate) fn new(module_id: &str, severity: u8, action: RepairAction) -> Self {
        Self {
            module_id: module_id.to_string(),
            severity,
            action,
            success: false,
            attempts: 0,
            pending_approval: false,
            rate_limited: false,
            reason: String::new(),
            details: serde_json::Value::Null,
        }
    }

    pub(crate) fn succeeded(mut self, reason: impl Into<String>, details: serde_json::Value) -> Self {
        self.success = true;
        self.reason = reason.into();
        self.details = details;
        self
    }

    pub(crate) fn failed(mut self, reason: impl Into<String>, details: serde_json::Value) -> Self {
        self.success = false;
        self.reason = reason.into();
        self.details = details;
        self
    }
}

/// A repair parked under `approvals/<correlation_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRepair {
    pub correlation_id: String,
    pub incident: Incident,
    pub severity: u8,
    pub action: RepairAction,
    pub requested_at: DateTime<Utc>,
}
