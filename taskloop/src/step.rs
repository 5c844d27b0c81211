//! One attempt at one task.
//!
//! Builds the instruction payload, drives it through the fallback chain,
//! gates the completion on the DoD validator, and charges the task budgets
//! when anything falls short.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::task::{FailureStep, Task};
use crate::core::types::{SwitchReason, SwitchRecord, ValidationResult};
use crate::io::dod::{ValidationRequest, Validator};
use crate::io::escalation::{Escalation, append_escalation};
use crate::io::fallback::{ChainResult, FallbackChain};
use crate::io::init::TaskloopPaths;
use crate::io::invoker::{CallScope, InterruptPoint, Invoker};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::retry::RetryPolicy;
use crate::io::todo;
use crate::looping::RunHalt;

/// Everything a step needs that stays fixed for the whole run.
pub struct StepEnv<'a> {
    pub paths: &'a TaskloopPaths,
    pub run_id: &'a str,
    pub todo_path: &'a Path,
    /// TODO path as shown to the agent.
    pub todo_display: &'a str,
    pub invoker: &'a Invoker<'a>,
    pub retry: &'a RetryPolicy,
    pub prompts: &'a PromptBuilder,
    pub validator: &'a dyn Validator,
    pub dod_text: Option<&'a str>,
    pub skip_dod: bool,
    pub escalation_enabled: bool,
    pub escalation_path: &'a Path,
}

/// What happened to the task after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Validated and checked off in the TODO file.
    Done { backend: String },
    /// Same approach, next attempt.
    Retry { attempt: u32 },
    /// Attempts used up; the next attempt must try something different.
    NewApproach { approach: u32 },
    /// Budgets exhausted; handed to the operator.
    Escalated,
    /// Budgets exhausted with escalation disabled.
    Failed,
}

impl StepResult {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Escalated | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub task_id: String,
    /// 1-based attempt number across all approaches.
    pub attempt_number: u32,
    pub result: StepResult,
    /// Diagnostics of this attempt when it fell short.
    pub failure: Option<String>,
}

/// 1-based attempt number across approaches, used for artifact directories.
pub fn attempt_number(task: &Task) -> u32 {
    task.approach * task.budget.max_attempts + task.attempt + 1
}

/// Run one attempt of `task`.
///
/// Halts (every backend exhausted, operator interrupt) surface as
/// `Err(RunHalt)`; every other shortfall is charged to the task budgets and
/// its diagnostics are remembered on the task for the next payload.
#[instrument(skip_all, fields(task_id = %task.id, approach = task.approach, attempt = task.attempt))]
pub fn run_step(
    env: &StepEnv<'_>,
    chain: &mut FallbackChain,
    task: &mut Task,
) -> Result<StepOutcome> {
    let attempt_number = attempt_number(task);
    let attempt_dir = env
        .paths
        .attempt_dir(env.run_id, &task.id, attempt_number);
    fs::create_dir_all(&attempt_dir)
        .with_context(|| format!("create attempt dir {}", attempt_dir.display()))?;

    let failure_context = task.failure_context();
    let prompt = env.prompts.build(&PromptInputs {
        task,
        todo_file: env.todo_display,
        failure: failure_context.as_deref(),
        dod: env.dod_text,
    })?;
    let prompt_path = attempt_dir.join("prompt.md");
    fs::write(&prompt_path, &prompt)
        .with_context(|| format!("write {}", prompt_path.display()))?;

    let scope = CallScope {
        run_id: env.run_id,
        task_id: &task.id,
        task_attempt: task.attempt,
        task_approach: task.approach,
        attempt_dir: &attempt_dir,
        workdir: &env.paths.root,
        prompt: &prompt,
    };
    let avoid = task.rejected_backends.clone();
    let chain_result = chain.run(env.invoker, &scope, env.retry, &avoid)?;

    let failure = match chain_result {
        ChainResult::AllExhausted => {
            return Err(RunHalt::BackendsExhausted {
                task_id: task.id.clone(),
            }
            .into());
        }
        ChainResult::Interrupted { .. } => {
            return Err(RunHalt::Interrupted {
                task_id: task.id.clone(),
            }
            .into());
        }
        ChainResult::Exhausted { tried, detail } => {
            warn!(tried = %tried.join(","), "no backend completed the task");
            format!("The previous task's agent run failed.\n{detail}")
        }
        ChainResult::Completed { backend, .. } => {
            if todo::ensure_pending(env.todo_path, task.line_number, &task.description)? {
                warn!(%backend, "agent checked the TODO item itself; reverted until validated");
            }
            let validation = validate(env, &attempt_dir, task, &backend)?;
            if validation.passed {
                task.complete().map_err(|err| anyhow!(err))?;
                todo::mark_done(env.todo_path, task.line_number, &task.description)?;
                info!(%backend, attempt_number, "task done");
                return Ok(StepOutcome {
                    task_id: task.id.clone(),
                    attempt_number,
                    result: StepResult::Done { backend },
                    failure: None,
                });
            }

            if task.reject_backend(&backend, chain.len()) {
                debug!("every backend rejected once; rotation starts over");
            }
            let context = validation.failure_context();
            env.invoker.telemetry().record_switch(&SwitchRecord {
                run_id: env.run_id.to_string(),
                task_id: task.id.clone(),
                from_backend: backend.clone(),
                reason: SwitchReason::ValidationRejected,
                detail: Some(validation.failed.join(", ")).filter(|d| !d.is_empty()),
                at: Utc::now(),
            })?;
            warn!(%backend, failed = %validation.failed.join(","), "completion rejected by DoD");
            format!("The previous task failed Definition of Done validation.\n\n{context}")
        }
    };

    task.note_failure(failure.clone());
    let result = match task.record_failure(env.escalation_enabled) {
        FailureStep::Retry { attempt } => StepResult::Retry { attempt },
        FailureStep::NewApproach { approach } => StepResult::NewApproach { approach },
        FailureStep::Escalated => {
            append_escalation(
                env.escalation_path,
                &Escalation {
                    run_id: env.run_id,
                    task,
                    todo_file: env.todo_display,
                    last_failure: Some(&failure),
                    at: Utc::now(),
                },
            )?;
            StepResult::Escalated
        }
        FailureStep::Failed => {
            warn!("task failed: approaches exhausted");
            StepResult::Failed
        }
    };
    Ok(StepOutcome {
        task_id: task.id.clone(),
        attempt_number,
        result,
        failure: Some(failure),
    })
}

fn validate(
    env: &StepEnv<'_>,
    attempt_dir: &Path,
    task: &Task,
    backend: &str,
) -> Result<ValidationResult> {
    if env.skip_dod {
        debug!("DoD validation skipped");
        return Ok(ValidationResult::skipped());
    }
    let validated = env.validator.validate(&ValidationRequest {
        workdir: &env.paths.root,
        task_id: &task.id,
        backend,
        log_path: &attempt_dir.join("dod.log"),
        token: env.invoker.token(),
    });
    if let Err(err) = &validated
        && matches!(err.downcast_ref::<RunHalt>(), Some(RunHalt::Interrupted { .. }))
    {
        env.invoker.record_interrupt(&InterruptPoint {
            run_id: env.run_id,
            task_id: &task.id,
            backend,
            retry_index: 0,
            task_attempt: task.attempt,
            task_approach: task.approach,
            detail: "interrupted during DoD validation",
        })?;
    }
    validated
}
