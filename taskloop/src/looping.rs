//! Task execution loop for `taskloop run`.
//!
//! Walks the TODO file top to bottom, driving each pending task through
//! [`run_step`] until it is done, escalated or failed. Run state is saved
//! before and after every step so an interrupted run resumes where it
//! stopped. A run that reaches the end of the list is closed, and the next
//! invocation starts a new run id.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::types::TaskStatus;
use crate::io::backend::Backend;
use crate::io::config::RunConfig;
use crate::io::dod::{Validator, criteria_path, load_criteria};
use crate::io::fallback::FallbackChain;
use crate::io::init::TaskloopPaths;
use crate::io::interrupt::CancelToken;
use crate::io::invoker::{CallSettings, InterruptPoint, Invoker};
use crate::io::prompt::PromptBuilder;
use crate::io::retry::RetryPolicy;
use crate::io::run_state::{RunState, load_run_state, new_run_id, write_run_state};
use crate::io::telemetry::TelemetryLog;
use crate::io::todo::{TodoItem, load_todo};
use crate::step::{StepEnv, StepOutcome, StepResult, run_step};

/// Conditions that stop the whole run rather than a single task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunHalt {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("all backends exhausted (stopped at task {task_id})")]
    BackendsExhausted { task_id: String },
    #[error("interrupted by operator (stopped at task {task_id})")]
    Interrupted { task_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Stop after starting this many tasks in this invocation.
    pub max_tasks: Option<u32>,
    /// Treat every completion as validated.
    pub skip_dod: bool,
    /// Ignore saved run state and start a new run id.
    pub fresh: bool,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No pending task is left in the TODO file.
    Complete,
    /// `max_tasks` tasks were started in this invocation.
    MaxTasksReached { max_tasks: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// Tasks started in this invocation.
    pub tasks_started: u32,
    pub steps_executed: u32,
    pub done: Vec<String>,
    pub escalated: Vec<String>,
    pub failed: Vec<String>,
    pub stop: LoopStop,
}

impl LoopOutcome {
    /// True when any task ended without being done.
    pub fn has_unfinished(&self) -> bool {
        !self.escalated.is_empty() || !self.failed.is_empty()
    }
}

/// Run pending tasks until the list is exhausted or `max_tasks` is reached.
///
/// Halts (configuration problems, every backend exhausted, operator
/// interrupt) surface as `Err(RunHalt)` after state has been saved. The
/// fallback chain is built lazily, so a list with nothing pending never
/// touches a backend.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_loop<F: FnMut(&StepOutcome)>(
    root: &Path,
    config: &RunConfig,
    mut backends: Vec<Box<dyn Backend>>,
    validator: &dyn Validator,
    token: CancelToken,
    options: &LoopOptions,
    mut on_step: F,
) -> Result<LoopOutcome> {
    let paths = TaskloopPaths::new(root);
    let todo_path = root.join(&config.todo_file);
    let todo_display = config.todo_file.display().to_string();
    let items = load_todo(&todo_path)?;

    let mut state = match load_run_state(&paths.run_state_path)? {
        Some(saved) if !options.fresh && saved.is_resumable() => {
            info!(run_id = %saved.run_id, "resuming run");
            saved
        }
        _ => RunState::new(new_run_id()),
    };
    let run_id = state.run_id.clone();
    write_run_state(&paths.run_state_path, &state)?;

    let telemetry = TelemetryLog::open(&paths.telemetry_path)?;
    let invoker = Invoker::new(
        &telemetry,
        token.clone(),
        CallSettings {
            timeout: config.call_timeout(),
            echo: config.stream,
            output_limit_bytes: config.output_limit_bytes,
            interrupt_grace: std::time::Duration::from_secs(config.interrupt_grace_secs),
        },
    );
    let retry = RetryPolicy {
        max_retries: config.max_retries,
        backoff: config.backoff_policy(),
    };
    let budget = config.task_budget();
    let prompts = PromptBuilder::new(
        config.prompt_budget_bytes,
        budget.max_approaches,
        budget.max_attempts,
    );
    let criteria = match criteria_path(root, &config.dod) {
        Some(path) => load_criteria(&path)?,
        None => None,
    };
    let escalation_path = root.join(&config.escalation.log_file);
    let env = StepEnv {
        paths: &paths,
        run_id: &run_id,
        todo_path: &todo_path,
        todo_display: &todo_display,
        invoker: &invoker,
        retry: &retry,
        prompts: &prompts,
        validator,
        dod_text: criteria.as_ref().map(|c| c.text.as_str()),
        skip_dod: options.skip_dod,
        escalation_enabled: config.escalation.enabled,
        escalation_path: &escalation_path,
    };

    let mut chain: Option<FallbackChain> = None;
    let mut outcome = LoopOutcome {
        run_id: run_id.clone(),
        tasks_started: 0,
        steps_executed: 0,
        done: Vec::new(),
        escalated: Vec::new(),
        failed: Vec::new(),
        stop: LoopStop::Complete,
    };

    for (position, item) in items.iter().enumerate() {
        if item.checked {
            continue;
        }
        let saved = state.progress(&item.id).cloned();
        if let Some(progress) = &saved
            && progress.status.is_terminal()
        {
            debug!(task_id = %item.id, status = %progress.status, "skipping settled task");
            continue;
        }
        if let Some(max_tasks) = options.max_tasks
            && outcome.tasks_started >= max_tasks
        {
            info!(max_tasks, "task limit reached");
            outcome.stop = LoopStop::MaxTasksReached { max_tasks };
            return Ok(outcome);
        }
        if token.is_cancelled() {
            let (task_attempt, task_approach) = saved
                .as_ref()
                .map_or((0, 0), |p| (p.attempt, p.approach));
            invoker.record_interrupt(&InterruptPoint {
                run_id: &run_id,
                task_id: &item.id,
                backend: "-",
                retry_index: 0,
                task_attempt,
                task_approach,
                detail: "interrupted before the task started",
            })?;
            return Err(RunHalt::Interrupted {
                task_id: item.id.clone(),
            }
            .into());
        }

        let chain = match &mut chain {
            Some(chain) => chain,
            slot @ None => slot.insert(FallbackChain::new(
                std::mem::take(&mut backends),
                &run_id,
                config.cooldown_secs,
                Some(paths.health_path.clone()),
            )?),
        };

        let mut task = item.to_task(position, budget);
        if let Some(progress) = &saved {
            task.restore(progress);
        }
        task.start()
            .map_err(|err| RunHalt::Configuration(format!("task {}: {err}", task.id)))?;
        outcome.tasks_started += 1;
        state.tasks_processed += 1;
        info!(task_id = %task.id, description = %task.description, "starting task");

        loop {
            state.record(&task.id, task.progress());
            write_run_state(&paths.run_state_path, &state)
                .with_context(|| format!("save run state before task {}", task.id))?;

            let step = match run_step(&env, chain, &mut task) {
                Ok(step) => step,
                Err(err) => {
                    if let Some(RunHalt::Interrupted { .. }) = err.downcast_ref::<RunHalt>() {
                        invoker.record_interrupt(&InterruptPoint {
                            run_id: &run_id,
                            task_id: &task.id,
                            backend: "-",
                            retry_index: 0,
                            task_attempt: task.attempt,
                            task_approach: task.approach,
                            detail: "interrupted while waiting for a backend",
                        })?;
                    }
                    return Err(err);
                }
            };
            outcome.steps_executed += 1;
            state.record(&task.id, task.progress());
            write_run_state(&paths.run_state_path, &state)
                .with_context(|| format!("save run state after task {}", task.id))?;
            on_step(&step);

            let settled = match step.result {
                StepResult::Done { .. } => &mut outcome.done,
                StepResult::Escalated => &mut outcome.escalated,
                StepResult::Failed => &mut outcome.failed,
                StepResult::Retry { .. } | StepResult::NewApproach { .. } => continue,
            };
            settled.push(task.id.clone());
            break;
        }
        if task.status != TaskStatus::Done {
            info!(task_id = %task.id, status = %task.status, "moving on without completing task");
        }
    }

    state.completed_at = Some(Utc::now());
    write_run_state(&paths.run_state_path, &state).context("close finished run")?;
    info!(
        done = outcome.done.len(),
        escalated = outcome.escalated.len(),
        failed = outcome.failed.len(),
        "task list finished"
    );
    Ok(outcome)
}

/// First item `run_loop` would work on, or `None` when nothing is pending.
///
/// Items settled in a resumable run state (escalated or failed) are
/// skipped, the same way a resumed run skips them.
pub fn next_pending(root: &Path, config: &RunConfig) -> Result<Option<TodoItem>> {
    let paths = TaskloopPaths::new(root);
    let items = load_todo(&root.join(&config.todo_file))?;
    let state = load_run_state(&paths.run_state_path)?.filter(RunState::is_resumable);
    let settled = |item: &TodoItem| {
        state
            .as_ref()
            .and_then(|s| s.progress(&item.id))
            .is_some_and(|p| p.status.is_terminal())
    };
    Ok(items
        .into_iter()
        .find(|item| !item.checked && !settled(item)))
}
