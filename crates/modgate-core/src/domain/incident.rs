//! Incident reports for live modules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest severity an incident can carry.
pub const MAX_SEVERITY: u8 = 10;

/// A runtime failure report for a live module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub module_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Explicit severity from the reporter. Derived when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u8>,
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

impl Incident {
    pub fn new(module_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            error: error.into(),
            stacktrace: None,
            metrics: BTreeMap::new(),
            severity: None,
            reported_at: Utc::now(),
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Effective severity in `0..=10`.
    pub fn effective_severity(&self) -> u8 {
        match self.severity {
            Some(s) => s.min(MAX_SEVERITY),
            None => derive_severity(self),
        }
    }
}

/// Derive a severity from the error text, stacktrace and metrics.
pub fn derive_severity(incident: &Incident) -> u8 {
    let mut text = incident.error.to_lowercase();
    if let Some(trace) = &incident.stacktrace {
        text.push('\n');
        text.push_str(&trace.to_lowercase());
    }

    let mut severity: u8 = if ["security", "breach", "unauthorized", "exploit", "corrupt"]
        .iter()
        .any(|k| text.contains(k))
    {
        9
    } else if [
        "segmentation fault",
        "segfault",
        "panic",
        "fatal",
        "crash",
        "out of memory",
        "memoryerror",
        "killed",
    ]
    .iter()
    .any(|k| text.contains(k))
    {
        7
    } else if ["exception", "traceback", "error", "failed"]
        .iter()
        .any(|k| text.contains(k))
    {
        5
    } else if ["timeout", "timed out", "slow", "latency", "degraded"]
        .iter()
        .any(|k| text.contains(k))
    {
        4
    } else {
        2
    };

    if let Some(rate) = incident.metrics.get("error_rate") {
        if *rate >= 0.5 {
            severity += 2;
        } else if *rate >= 0.2 {
            severity += 1;
        }
    }
    if incident
        .metrics
        .get("crash_count")
        .is_some_and(|count| *count >= 3.0)
    {
        severity += 1;
    }

    severity.min(MAX_SEVERITY)
}
