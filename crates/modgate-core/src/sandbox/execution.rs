//! Execution state machine and result classification.

use serde::{Deserialize, Serialize};

use super::confine::Isolation;
use super::harness::HarnessRecord;

/// Lifecycle of one sandboxed execution.
///
/// `Pending -> Launching -> Running -> {Completed | TimedOut | LimitExceeded}`,
/// with `Launching -> CrashedOnLaunch` when the child never starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Launching,
    Running,
    Completed,
    TimedOut,
    LimitExceeded,
    CrashedOnLaunch,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::LimitExceeded
                | ExecutionState::CrashedOnLaunch
        )
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Launching)
                | (Launching, Running)
                | (Launching, CrashedOnLaunch)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, LimitExceeded)
        )
    }
}

/// Ordered record of the states one execution passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    states: Vec<ExecutionState>,
}

impl Default for ExecutionTrace {
    fn default() -> Self {
        Self {
            states: vec![ExecutionState::Pending],
        }
    }
}

impl ExecutionTrace {
    pub fn current(&self) -> ExecutionState {
        self.states
            .last()
            .copied()
            .unwrap_or(ExecutionState::Pending)
    }

    /// Advance; an illegal transition leaves the trace unchanged.
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        if self.current().can_transition_to(next) {
            self.states.push(next);
            true
        } else {
            tracing::warn!(from = ?self.current(), to = ?next, "illegal sandbox state transition");
            false
        }
    }

    pub fn states(&self) -> &[ExecutionState] {
        &self.states
    }

    /// Trace for a scripted or synthetic run ending in `terminal`.
    pub fn finished(terminal: ExecutionState) -> Self {
        let mut trace = Self::default();
        trace.advance(ExecutionState::Launching);
        if terminal == ExecutionState::CrashedOnLaunch {
            trace.advance(terminal);
        } else {
            trace.advance(ExecutionState::Running);
            trace.advance(terminal);
        }
        trace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    Timeout,
    ResourceLimit,
    RuntimeError,
    ValidationFailed,
    /// The run could not be trusted: it changed its own files or ran with
    /// less isolation than policy requires.
    PolicyViolation,
}

impl SandboxErrorKind {
    pub fn from_harness(kind: &str) -> Self {
        match kind {
            "resource_limit" => SandboxErrorKind::ResourceLimit,
            "validation_failed" => SandboxErrorKind::ValidationFailed,
            "timeout" => SandboxErrorKind::Timeout,
            _ => SandboxErrorKind::RuntimeError,
        }
    }
}

/// Outcome of one sandboxed execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub execution_time_ms: u64,
    pub error: Option<SandboxErrorKind>,
    /// Human-readable failure detail.
    pub message: Option<String>,
    /// `result` field of the structured record, when one was printed.
    pub result: Option<serde_json::Value>,
    pub state: ExecutionState,
    pub trace: ExecutionTrace,
    #[serde(default)]
    pub output_truncated: bool,
    /// Confinement in force while the candidate ran.
    #[serde(default)]
    pub isolation: Isolation,
}

impl SandboxResult {
    /// Successful completion returning `result`.
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            stdout: format!("{}\n", serde_json::json!({ "ok": true, "result": result })),
            stderr: String::new(),
            exit_code: Some(0),
            signal: None,
            execution_time_ms: 0,
            error: None,
            message: None,
            result: Some(result),
            state: ExecutionState::Completed,
            trace: ExecutionTrace::finished(ExecutionState::Completed),
            output_truncated: false,
            isolation: Isolation::FULL,
        }
    }

    /// Failed run with the given classification.
    pub fn failure(kind: SandboxErrorKind, message: impl Into<String>) -> Self {
        let state = match kind {
            SandboxErrorKind::Timeout => ExecutionState::TimedOut,
            SandboxErrorKind::ResourceLimit => ExecutionState::LimitExceeded,
            _ => ExecutionState::Completed,
        };
        let exit_code = match state {
            ExecutionState::Completed => Some(1),
            _ => Some(137),
        };
        Self {
            ok: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            signal: None,
            execution_time_ms: 0,
            error: Some(kind),
            message: Some(message.into()),
            result: None,
            state,
            trace: ExecutionTrace::finished(state),
            output_truncated: false,
            isolation: Isolation::FULL,
        }
    }

    /// Turn this run into a failure the candidate cannot pass with.
    pub fn into_violation(mut self, message: impl Into<String>) -> Self {
        self.ok = false;
        self.error = Some(SandboxErrorKind::PolicyViolation);
        self.message = Some(message.into());
        self
    }

    pub fn with_execution_time_ms(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    /// One-line summary for pipeline reasons and audit details.
    pub fn summary(&self) -> String {
        match (&self.error, &self.message) {
            (None, _) => format!("ok in {}ms", self.execution_time_ms),
            (Some(kind), Some(msg)) => format!("{kind:?}: {msg}"),
            (Some(kind), None) => format!("{kind:?} (exit {:?})", self.exit_code),
        }
    }
}

/// Raw facts about a finished child process.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub execution_time_ms: u64,
    pub isolation: Isolation,
}

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// Turn process facts into a [`SandboxResult`].
///
/// The structured record on the last stdout line decides `ok` when present;
/// otherwise `ok` falls back to a zero exit code.
pub(crate) fn classify(outcome: ProcessOutcome, mut trace: ExecutionTrace) -> SandboxResult {
    let record = HarnessRecord::parse_last_line(&outcome.stdout);

    let limit_hit = outcome.oom_killed
        || outcome.signal == Some(SIGXCPU)
        || (outcome.signal == Some(SIGKILL) && !outcome.timed_out)
        || record
            .as_ref()
            .is_some_and(|r| r.kind.as_deref() == Some("resource_limit"))
        || (record.is_none() && outcome.stderr.contains("MemoryError"));

    let (state, ok, error, message) = if outcome.timed_out {
        (
            ExecutionState::TimedOut,
            false,
            Some(SandboxErrorKind::Timeout),
            Some(format!(
                "killed after exceeding the wall-clock timeout ({}ms elapsed)",
                outcome.execution_time_ms
            )),
        )
    } else if limit_hit {
        let detail = record
            .as_ref()
            .and_then(|r| r.error.clone())
            .unwrap_or_else(|| match outcome.signal {
                Some(SIGXCPU) | Some(SIGKILL) if !outcome.oom_killed => {
                    "cpu time limit exceeded".to_string()
                }
                _ => "memory limit exceeded".to_string(),
            });
        (
            ExecutionState::LimitExceeded,
            false,
            Some(SandboxErrorKind::ResourceLimit),
            Some(detail),
        )
    } else {
        match &record {
            Some(r) if r.ok => (ExecutionState::Completed, true, None, None),
            Some(r) => (
                ExecutionState::Completed,
                false,
                Some(
                    r.kind
                        .as_deref()
                        .map(SandboxErrorKind::from_harness)
                        .unwrap_or(SandboxErrorKind::RuntimeError),
                ),
                r.error.clone(),
            ),
            None if outcome.exit_code == Some(0) => (ExecutionState::Completed, true, None, None),
            None => (
                ExecutionState::Completed,
                false,
                Some(SandboxErrorKind::RuntimeError),
                Some(format!(
                    "exited with {:?} without a structured result",
                    outcome.exit_code
                )),
            ),
        }
    };

    trace.advance(state);
    SandboxResult {
        ok,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
        signal: outcome.signal,
        execution_time_ms: outcome.execution_time_ms,
        error,
        message,
        result: record.and_then(|r| r.result),
        state,
        trace,
        output_truncated: outcome.output_truncated,
        isolation: outcome.isolation,
    }
}
