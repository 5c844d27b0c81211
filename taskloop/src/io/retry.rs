//! Retry controller: bounded retries of one backend with capped backoff.
//!
//! Total calls per invocation are `max_retries + 1`. Only `transient_error`,
//! `timeout` and `rate_limited` are retried; `fatal_error` and `interrupted`
//! return at once. Running out of retries becomes `fatal_error` with reason
//! `retries_exhausted`. A `Retry-After` hint stretches the next delay, up to
//! the backoff cap.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::backoff::BackoffPolicy;
use crate::core::types::{AttemptOutcome, Classification, FailureReason};
use crate::io::backend::Backend;
use crate::io::invoker::{CallScope, InterruptPoint, Invocation, Invoker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub classification: Classification,
    pub response: String,
    pub model: Option<String>,
    /// Physical calls made.
    pub calls: u32,
    /// Reason of the last retryable failure, when retries ran out.
    pub last_retryable: Option<FailureReason>,
}

impl RetryOutcome {
    fn from_invocation(inv: Invocation, calls: u32) -> Self {
        Self {
            classification: inv.classification,
            response: inv.response,
            model: inv.model,
            calls,
            last_retryable: None,
        }
    }
}

/// Call `backend` until it succeeds, fails fatally, or the budget is spent.
#[instrument(skip_all, fields(backend = backend.name(), task_id = scope.task_id))]
pub fn call_with_retries(
    invoker: &Invoker<'_>,
    backend: &dyn Backend,
    scope: &CallScope<'_>,
    policy: &RetryPolicy,
) -> Result<RetryOutcome> {
    let mut last: Option<Invocation> = None;
    let mut calls = 0;

    for retry_index in 0..=policy.max_retries {
        if retry_index > 0 {
            let mut delay = policy
                .backoff
                .jittered_delay(retry_index, rand::random::<f64>());
            if let Some(hint) = last.as_ref().and_then(|inv| inv.retry_after) {
                delay = delay.max(hint.min(policy.backoff.max));
            }
            debug!(retry_index, delay_ms = delay.as_millis() as u64, "backing off");
            if !invoker.token().sleep(delay) {
                invoker.record_interrupt(&InterruptPoint {
                    run_id: scope.run_id,
                    task_id: scope.task_id,
                    backend: backend.name(),
                    retry_index,
                    task_attempt: scope.task_attempt,
                    task_approach: scope.task_approach,
                    detail: "interrupted during backoff",
                })?;
                return Ok(interrupted_during_backoff(calls));
            }
        }

        let inv = invoker.invoke(backend, scope, retry_index)?;
        calls += 1;
        if !inv.classification.outcome.is_retryable() {
            return Ok(RetryOutcome::from_invocation(inv, calls));
        }
        last = Some(inv);
    }

    let last_reason = last.as_ref().and_then(|inv| inv.classification.reason);
    let last_detail = last
        .as_ref()
        .and_then(|inv| inv.classification.detail.clone());
    warn!(
        calls,
        last_reason = last_reason.map_or("-", FailureReason::as_str),
        "retries exhausted"
    );
    let detail = match (last_reason, last_detail) {
        (Some(reason), Some(detail)) => format!("{calls} calls, last {reason}: {detail}"),
        (Some(reason), None) => format!("{calls} calls, last {reason}"),
        (None, _) => format!("{calls} calls"),
    };
    Ok(RetryOutcome {
        classification: Classification::failure(
            AttemptOutcome::FatalError,
            FailureReason::RetriesExhausted,
            Some(detail),
        ),
        response: last.map(|inv| inv.response).unwrap_or_default(),
        model: None,
        calls,
        last_retryable: last_reason,
    })
}

fn interrupted_during_backoff(calls: u32) -> RetryOutcome {
    RetryOutcome {
        classification: Classification::failure(
            AttemptOutcome::Interrupted,
            FailureReason::Interrupted,
            Some("interrupted during backoff".to_string()),
        ),
        response: String::new(),
        model: None,
        calls,
        last_retryable: None,
    }
}
