//! Run state storage for resume (`.taskloop/state/run_state.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::task::TaskProgress;
use crate::io::write_atomic;

/// Persisted bookkeeping for the current run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    /// Per-task counters keyed by task id.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskProgress>,
    /// Tasks started across every invocation of this run.
    #[serde(default)]
    pub tasks_processed: u32,
    /// Set once the run walked the whole list; the next invocation starts a new run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            tasks: BTreeMap::new(),
            tasks_processed: 0,
            completed_at: None,
        }
    }

    /// True while a later invocation should resume this run.
    pub fn is_resumable(&self) -> bool {
        self.completed_at.is_none()
    }

    pub fn progress(&self, task_id: &str) -> Option<&TaskProgress> {
        self.tasks.get(task_id)
    }

    pub fn record(&mut self, task_id: &str, progress: TaskProgress) {
        self.tasks.insert(task_id.to_string(), progress);
    }
}

/// New run id: UTC timestamp plus a random suffix, e.g. `20250102T030405Z-3f9a`.
pub fn new_run_id() -> String {
    format!(
        "{}-{:04x}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        rand::random::<u16>()
    )
}

/// Load run state. A missing file reads as `None`.
pub fn load_run_state(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, tasks = state.tasks.len(), "run state loaded");
    Ok(Some(state))
}

/// Atomically write run state (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, "writing run state");
    let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
