//! Shared deterministic types for the task loop core.
//!
//! These types define stable contracts between components and the on-disk
//! formats (telemetry, run state, backend health). They must not depend on
//! external state or I/O.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Escalated,
}

impl TaskStatus {
    /// Terminal tasks are never revisited by the loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Escalated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one physical backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientError,
    FatalError,
    Timeout,
    RateLimited,
    /// The operator interrupted the call. Terminal for the run.
    Interrupted,
}

impl AttemptOutcome {
    /// Outcomes the retry controller may absorb with another call to the same backend.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientError | Self::Timeout | Self::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientError => "transient_error",
            Self::FatalError => "fatal_error",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained cause attached to a non-success outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Connection refused, DNS, stream closed before its terminal marker.
    Network,
    Timeout,
    RateLimited,
    /// Backend-side 5xx or equivalent.
    ServerFault,
    /// The child process died without an exit code.
    Crashed,
    /// Quota, credit or token allowance used up. Exhausts the backend.
    UsageLimit,
    /// Any other client-side rejection.
    Rejected,
    /// The backend binary is missing or its credentials are absent.
    Unavailable,
    /// Retry budget used up on retryable failures.
    RetriesExhausted,
    Interrupted,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerFault => "server_fault",
            Self::Crashed => "crashed",
            Self::UsageLimit => "usage_limit",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome plus reason and optional detail, produced by classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub outcome: AttemptOutcome,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
}

impl Classification {
    pub fn success() -> Self {
        Self {
            outcome: AttemptOutcome::Success,
            reason: None,
            detail: None,
        }
    }

    pub fn failure(
        outcome: AttemptOutcome,
        reason: FailureReason,
        detail: Option<String>,
    ) -> Self {
        Self {
            outcome,
            reason: Some(reason),
            detail,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Health of one backend within the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Available,
    CoolingDown,
    Exhausted,
}

/// Telemetry record for one physical backend call. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub run_id: String,
    pub task_id: String,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// 0-based index within the enclosing retry controller invocation.
    pub retry_index: u32,
    pub task_attempt: u32,
    pub task_approach: u32,
}

/// Why the run moved away from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// The retry controller surfaced a fatal error; the backend cools down.
    FatalError,
    /// The backend reported its allowance exhausted.
    UsageLimit,
    /// The backend claimed completion but the DoD gate rejected it.
    ValidationRejected,
}

/// Telemetry record marking a backend switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub run_id: String,
    pub task_id: String,
    pub from_backend: String,
    pub reason: SwitchReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Result of one DoD validation pass. Consumed immediately by the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub passed: bool,
    /// Names of the checks that ran, in order.
    pub checks_run: Vec<String>,
    /// Names of the checks that failed, in order.
    pub failed: Vec<String>,
    pub diagnostics: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    /// Result used when the operator bypasses the gate.
    pub fn skipped() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    /// Render diagnostics for the next instruction payload.
    pub fn failure_context(&self) -> String {
        let mut out = String::new();
        if !self.failed.is_empty() {
            out.push_str("Failed checks: ");
            out.push_str(&self.failed.join(", "));
            out.push('\n');
        }
        for diag in &self.diagnostics {
            out.push_str("- ");
            out.push_str(diag.trim());
            out.push('\n');
        }
        if !self.suggestions.is_empty() {
            out.push_str("Suggestions:\n");
            for suggestion in &self.suggestions {
                out.push_str("- ");
                out.push_str(suggestion.trim());
                out.push('\n');
            }
        }
        out
    }
}
