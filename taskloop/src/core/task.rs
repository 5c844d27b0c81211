//! Task lifecycle and attempt/approach budget bookkeeping.
//!
//! ```text
//! pending ──start──▶ in_progress ──complete──▶ done
//!                     │   ▲
//!      record_failure │   │ retry / new approach
//!                     ▼   │
//!                    (budget) ──▶ escalated | failed
//! ```

use serde::{Deserialize, Serialize};

use crate::core::types::TaskStatus;

/// Diagnostics kept from the current approach's failed attempts.
pub const FAILURE_HISTORY: usize = 3;

/// Separator between remembered diagnostics in the failure context.
const FAILURE_SEPARATOR: &str = "\n\n---\n\n";

/// Per-task budgets taken from the run config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskBudget {
    pub max_approaches: u32,
    pub max_attempts: u32,
}

/// What the loop should do after a failed completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStep {
    /// Re-submit within the same approach.
    Retry { attempt: u32 },
    /// Attempts exhausted; start a fresh strategy.
    NewApproach { approach: u32 },
    Escalated,
    Failed,
}

/// A checklist item under execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub section: Option<String>,
    pub parent: Option<String>,
    /// 0-based ordinal in the task list.
    pub position: usize,
    /// 1-based line in the TODO file.
    pub line_number: usize,
    pub status: TaskStatus,
    /// Approaches already exhausted.
    pub approach: u32,
    /// Failed attempts within the current approach.
    pub attempt: u32,
    pub budget: TaskBudget,
    /// Backends whose completion the DoD gate rejected in the current approach.
    pub rejected_backends: Vec<String>,
    /// Diagnostics of recent failed attempts, oldest first.
    pub failures: Vec<String>,
}

/// Resumable slice of task state, persisted in the run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub approach: u32,
    pub attempt: u32,
    #[serde(default)]
    pub rejected_backends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, budget: TaskBudget) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            section: None,
            parent: None,
            position: 0,
            line_number: 0,
            status: TaskStatus::Pending,
            approach: 0,
            attempt: 0,
            budget,
            rejected_backends: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Move a pending task into execution. Re-entering `in_progress` is a no-op.
    pub fn start(&mut self) -> Result<(), String> {
        match self.status {
            TaskStatus::Pending | TaskStatus::InProgress => {
                self.status = TaskStatus::InProgress;
                Ok(())
            }
            terminal => Err(format!("task {} is already {terminal}", self.id)),
        }
    }

    /// Mark the task done after a validated completion.
    pub fn complete(&mut self) -> Result<(), String> {
        if self.status != TaskStatus::InProgress {
            return Err(format!(
                "task {} must be in_progress to complete (is {})",
                self.id, self.status
            ));
        }
        self.status = TaskStatus::Done;
        self.failures.clear();
        Ok(())
    }

    /// Remember the diagnostics of a failed attempt, keeping the latest
    /// [`FAILURE_HISTORY`] entries.
    pub fn note_failure(&mut self, diagnostics: impl Into<String>) {
        self.failures.push(diagnostics.into());
        if self.failures.len() > FAILURE_HISTORY {
            let excess = self.failures.len() - FAILURE_HISTORY;
            self.failures.drain(..excess);
        }
    }

    /// Remembered diagnostics joined for the next payload, oldest first.
    pub fn failure_context(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(self.failures.join(FAILURE_SEPARATOR))
    }

    /// Charge one failed attempt against the budgets.
    ///
    /// Reaching `max_attempts` resets the attempt counter and opens a new
    /// approach, unless approaches are also used up, in which case the task
    /// becomes terminal. A new approach keeps only the latest diagnostics.
    pub fn record_failure(&mut self, escalation_enabled: bool) -> FailureStep {
        self.attempt += 1;
        if self.attempt < self.budget.max_attempts {
            return FailureStep::Retry {
                attempt: self.attempt,
            };
        }

        self.attempt = 0;
        self.approach += 1;
        self.rejected_backends.clear();
        if let Some(latest) = self.failures.pop() {
            self.failures = vec![latest];
        }
        if self.approach < self.budget.max_approaches {
            return FailureStep::NewApproach {
                approach: self.approach,
            };
        }

        if escalation_enabled {
            self.status = TaskStatus::Escalated;
            FailureStep::Escalated
        } else {
            self.status = TaskStatus::Failed;
            FailureStep::Failed
        }
    }

    /// Record that `backend`'s completion was rejected by validation.
    ///
    /// Once every configured backend has been rejected the list is cleared so
    /// rotation starts over. Returns `true` when that reset happened.
    pub fn reject_backend(&mut self, backend: &str, backend_count: usize) -> bool {
        if !self.rejected_backends.iter().any(|b| b == backend) {
            self.rejected_backends.push(backend.to_string());
        }
        if self.rejected_backends.len() >= backend_count {
            self.rejected_backends.clear();
            return true;
        }
        false
    }

    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            status: self.status,
            approach: self.approach,
            attempt: self.attempt,
            rejected_backends: self.rejected_backends.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Restore counters from a previous run, clamped to the current budgets.
    pub fn restore(&mut self, progress: &TaskProgress) {
        self.status = progress.status;
        self.approach = progress.approach;
        self.attempt = progress.attempt.min(self.budget.max_attempts.saturating_sub(1));
        self.rejected_backends = progress.rejected_backends.clone();
        self.failures.clear();
        for failure in &progress.failures {
            self.note_failure(failure.clone());
        }
        if !self.status.is_terminal() && self.approach >= self.budget.max_approaches {
            self.approach = self.budget.max_approaches.saturating_sub(1);
        }
    }
}
