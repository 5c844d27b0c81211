//! Operator hand-off log for tasks that ran out of approaches.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::core::task::Task;

#[derive(Debug, Clone)]
pub struct Escalation<'a> {
    pub run_id: &'a str,
    pub task: &'a Task,
    pub todo_file: &'a str,
    pub last_failure: Option<&'a str>,
    pub at: DateTime<Utc>,
}

/// Append one entry to the escalation log, creating it with a header if needed.
pub fn append_escalation(path: &Path, entry: &Escalation<'_>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create escalation dir {}", parent.display()))?;
    }
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open escalation log {}", path.display()))?;

    let mut buf = String::new();
    if is_new {
        buf.push_str(
            "# Escalations\n\nTasks that exhausted every approach and need an operator.\n",
        );
    }
    let task = entry.task;
    buf.push_str(&format!("\n## {}: {}\n\n", task.id, task.description));
    buf.push_str(&format!("- run: {}\n", entry.run_id));
    buf.push_str(&format!("- at: {}\n", entry.at.to_rfc3339()));
    buf.push_str(&format!("- location: {}:{}\n", entry.todo_file, task.line_number));
    if let Some(section) = &task.section {
        buf.push_str(&format!("- section: {section}\n"));
    }
    buf.push_str(&format!(
        "- budget: {} approaches x {} attempts\n",
        task.budget.max_approaches, task.budget.max_attempts
    ));
    if let Some(failure) = entry.last_failure.map(str::trim).filter(|f| !f.is_empty()) {
        buf.push_str("\nLast failure:\n\n```text\n");
        buf.push_str(failure);
        buf.push_str("\n```\n");
    }

    file.write_all(buf.as_bytes())
        .with_context(|| format!("append escalation log {}", path.display()))?;
    info!(task_id = %task.id, path = %path.display(), "task escalated to operator");
    Ok(())
}
