//! One physical backend call, classified and recorded.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::classify::tail;
use crate::core::types::{AttemptOutcome, AttemptRecord, Classification, FailureReason};
use crate::io::backend::{Backend, CallRequest};
use crate::io::interrupt::{CallGuard, CancelToken};
use crate::io::telemetry::TelemetryLog;

const DETAIL_LIMIT: usize = 2_000;

/// Settings shared by every call in a run.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub timeout: Duration,
    pub echo: bool,
    pub output_limit_bytes: usize,
    pub interrupt_grace: Duration,
}

/// Identifies the task attempt a call belongs to.
#[derive(Debug, Clone)]
pub struct CallScope<'a> {
    pub run_id: &'a str,
    pub task_id: &'a str,
    pub task_attempt: u32,
    pub task_approach: u32,
    /// `.taskloop/attempts/<run_id>/<task_id>/<n>/`
    pub attempt_dir: &'a Path,
    pub workdir: &'a Path,
    pub prompt: &'a str,
}

impl CallScope<'_> {
    /// Artifacts for one call live in `<attempt_dir>/<backend>-<retry_index>/`.
    pub fn call_dir(&self, backend: &str, retry_index: u32) -> PathBuf {
        self.attempt_dir.join(format!("{backend}-{retry_index}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub classification: Classification,
    pub response: String,
    pub model: Option<String>,
    pub retry_after: Option<Duration>,
}

/// Where an operator interrupt landed when no backend call was running.
#[derive(Debug, Clone)]
pub struct InterruptPoint<'a> {
    pub run_id: &'a str,
    pub task_id: &'a str,
    /// Backend the interrupted step was working with, `-` when none.
    pub backend: &'a str,
    pub retry_index: u32,
    pub task_attempt: u32,
    pub task_approach: u32,
    pub detail: &'a str,
}

pub struct Invoker<'a> {
    telemetry: &'a TelemetryLog,
    token: CancelToken,
    settings: CallSettings,
    interrupt_recorded: Cell<bool>,
}

impl<'a> Invoker<'a> {
    pub fn new(telemetry: &'a TelemetryLog, token: CancelToken, settings: CallSettings) -> Self {
        Self {
            telemetry,
            token,
            settings,
            interrupt_recorded: Cell::new(false),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn telemetry(&self) -> &TelemetryLog {
        self.telemetry
    }

    /// Issue exactly one call and append exactly one attempt record.
    ///
    /// Harness failures inside the backend (log dir, stream file) are
    /// recorded as `fatal_error/unavailable` rather than propagated; only a
    /// telemetry write failure is returned as `Err`.
    pub fn invoke(
        &self,
        backend: &dyn Backend,
        scope: &CallScope<'_>,
        retry_index: u32,
    ) -> Result<Invocation> {
        let call_dir = scope.call_dir(backend.name(), retry_index);
        let request = CallRequest {
            workdir: scope.workdir.to_path_buf(),
            prompt: scope.prompt.to_string(),
            retry_index,
            log_path: call_dir.join("backend.log"),
            stream_path: call_dir.join("stream.log"),
            echo: self.settings.echo,
            output_limit_bytes: self.settings.output_limit_bytes,
            interrupt_grace: self.settings.interrupt_grace,
        };
        let guard = CallGuard::new(self.token.clone(), self.settings.timeout);

        let started_at = Utc::now();
        let clock = Instant::now();
        let submitted = fs::create_dir_all(&call_dir)
            .map_err(anyhow::Error::from)
            .and_then(|()| backend.submit(&request, &guard));
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let ended_at = Utc::now();

        let (classification, response, model, retry_after) = match submitted {
            Ok(exit) => (
                backend.classify(&exit),
                exit.response,
                exit.model,
                exit.retry_after,
            ),
            Err(err) => {
                warn!(
                    backend = backend.name(),
                    err = %format!("{err:#}"),
                    "backend call harness failed"
                );
                (
                    Classification::failure(
                        AttemptOutcome::FatalError,
                        FailureReason::Unavailable,
                        Some(format!("{err:#}")),
                    ),
                    String::new(),
                    None,
                    None,
                )
            }
        };
        if !response.trim().is_empty() {
            let response_path = call_dir.join("response.md");
            if let Err(err) = fs::write(&response_path, &response) {
                warn!(path = %response_path.display(), %err, "failed to save backend response");
            }
        }

        let record = AttemptRecord {
            run_id: scope.run_id.to_string(),
            task_id: scope.task_id.to_string(),
            backend: backend.name().to_string(),
            model: model.clone(),
            started_at,
            ended_at,
            duration_ms,
            outcome: classification.outcome,
            reason: classification.reason,
            detail: classification
                .detail
                .as_deref()
                .map(|d| tail(d, DETAIL_LIMIT).to_string()),
            retry_index,
            task_attempt: scope.task_attempt,
            task_approach: scope.task_approach,
        };
        self.telemetry.record_call(&record)?;
        if classification.outcome == AttemptOutcome::Interrupted {
            self.interrupt_recorded.set(true);
        }

        info!(
            task_id = scope.task_id,
            backend = backend.name(),
            model = model.as_deref().unwrap_or("-"),
            retry_index,
            outcome = %classification.outcome,
            reason = classification.reason.map_or("-", FailureReason::as_str),
            duration_ms,
            "backend call finished"
        );

        Ok(Invocation {
            classification,
            response,
            model,
            retry_after,
        })
    }

    /// Append the `interrupted` record for a stop outside a backend call
    /// (backoff, validation, between tasks).
    ///
    /// At most one interrupt is recorded per invoker, so this is a no-op once
    /// a call already ended as `interrupted`.
    pub fn record_interrupt(&self, point: &InterruptPoint<'_>) -> Result<()> {
        if self.interrupt_recorded.replace(true) {
            return Ok(());
        }
        let now = Utc::now();
        self.telemetry.record_call(&AttemptRecord {
            run_id: point.run_id.to_string(),
            task_id: point.task_id.to_string(),
            backend: point.backend.to_string(),
            model: None,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            outcome: AttemptOutcome::Interrupted,
            reason: Some(FailureReason::Interrupted),
            detail: Some(point.detail.to_string()),
            retry_index: point.retry_index,
            task_attempt: point.task_attempt,
            task_approach: point.task_approach,
        })?;
        info!(
            task_id = point.task_id,
            backend = point.backend,
            detail = point.detail,
            "interrupt recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backend::CliBackend;
    use crate::io::config::CliBackendConfig;
    use crate::io::telemetry::read_calls;
    use crate::test_support::{Reply, ScriptedBackend};

    fn settings(timeout: Duration) -> CallSettings {
        CallSettings {
            timeout,
            echo: false,
            output_limit_bytes: 10_000,
            interrupt_grace: Duration::from_millis(100),
        }
    }

    fn scope<'a>(dir: &'a Path) -> CallScope<'a> {
        CallScope {
            run_id: "run-1",
            task_id: "1.1",
            task_attempt: 1,
            task_approach: 0,
            attempt_dir: dir,
            workdir: dir,
            prompt: "do it",
        }
    }

    /// Verifies a hanging CLI agent is killed at the deadline and recorded as a timeout.
    #[test]
    fn hanging_cli_backend_times_out_and_is_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let backend = CliBackend::new(
            "hang",
            &CliBackendConfig {
                command: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                ..CliBackendConfig::default()
            },
        )
        .expect("backend");
        let invoker = Invoker::new(&log, CancelToken::new(), settings(Duration::from_millis(300)));

        let started = Instant::now();
        let inv = invoker.invoke(&backend, &scope(temp.path()), 0).expect("invoke");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(inv.classification.outcome, AttemptOutcome::Timeout);

        let calls = read_calls(log.path()).expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(calls[0].task_attempt, 1);
        assert!(temp.path().join("hang-0").join("backend.log").is_file());
    }

    /// A missing binary is still one recorded attempt.
    #[test]
    fn missing_command_records_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let backend = CliBackend::new(
            "ghost",
            &CliBackendConfig {
                command: vec!["taskloop-no-such-binary-xyz".to_string()],
                ..CliBackendConfig::default()
            },
        )
        .expect("backend");
        let invoker = Invoker::new(&log, CancelToken::new(), settings(Duration::from_secs(5)));

        let inv = invoker.invoke(&backend, &scope(temp.path()), 2).expect("invoke");
        assert_eq!(inv.classification.outcome, AttemptOutcome::FatalError);
        assert_eq!(inv.classification.reason, Some(FailureReason::Unavailable));
        let calls = read_calls(log.path()).expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].retry_index, 2);
    }

    #[test]
    fn scripted_success_records_model() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let backend = ScriptedBackend::new("router").with_model("m-one");
        let invoker = Invoker::new(&log, CancelToken::new(), settings(Duration::from_secs(5)));

        let inv = invoker.invoke(&backend, &scope(temp.path()), 0).expect("invoke");
        assert!(inv.classification.is_success());
        assert_eq!(inv.model.as_deref(), Some("m-one"));
        let calls = read_calls(log.path()).expect("calls");
        assert_eq!(calls[0].model.as_deref(), Some("m-one"));
        assert_eq!(calls[0].outcome, AttemptOutcome::Success);
    }

    /// An interrupt during a hanging call ends it as `interrupted`.
    #[test]
    fn interrupt_during_call_is_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let backend = ScriptedBackend::with_replies("claude", vec![Reply::Hang]);
        let token = CancelToken::new();
        token.cancel();
        let invoker = Invoker::new(&log, token, settings(Duration::from_secs(30)));

        let inv = invoker.invoke(&backend, &scope(temp.path()), 0).expect("invoke");
        assert_eq!(inv.classification.outcome, AttemptOutcome::Interrupted);
        assert_eq!(read_calls(log.path()).expect("calls").len(), 1);
    }

    /// A stop outside any call is recorded once, and not on top of an interrupted call.
    #[test]
    fn interrupt_outside_a_call_is_recorded_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings(Duration::from_secs(5)));
        let point = InterruptPoint {
            run_id: "run-1",
            task_id: "1.1",
            backend: "codex",
            retry_index: 1,
            task_attempt: 2,
            task_approach: 0,
            detail: "interrupted during backoff",
        };
        invoker.record_interrupt(&point).expect("record");
        invoker.record_interrupt(&point).expect("record again");

        let calls = read_calls(log.path()).expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].outcome, AttemptOutcome::Interrupted);
        assert_eq!(calls[0].reason, Some(FailureReason::Interrupted));
        assert_eq!(calls[0].backend, "codex");
        assert_eq!(calls[0].task_attempt, 2);
        assert_eq!(calls[0].detail.as_deref(), Some("interrupted during backoff"));

        let token = CancelToken::new();
        token.cancel();
        let log = TelemetryLog::open(&temp.path().join("second.jsonl")).expect("log");
        let invoker = Invoker::new(&log, token, settings(Duration::from_secs(5)));
        let backend = ScriptedBackend::with_replies("claude", vec![Reply::Hang]);
        invoker.invoke(&backend, &scope(temp.path()), 0).expect("invoke");
        invoker.record_interrupt(&point).expect("record");
        assert_eq!(read_calls(log.path()).expect("calls").len(), 1);
    }

    #[test]
    fn completed_response_is_saved_next_to_the_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings(Duration::from_secs(5)));
        let backend = ScriptedBackend::new("router");

        invoker.invoke(&backend, &scope(temp.path()), 0).expect("invoke");
        let saved = fs::read_to_string(temp.path().join("router-0").join("response.md"))
            .expect("response.md");
        assert_eq!(saved, "router finished");
    }

    #[test]
    fn harness_error_is_recorded_as_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("attempts.jsonl")).expect("log");
        let backend = ScriptedBackend::with_replies(
            "codex",
            vec![Reply::HarnessError("disk full".to_string())],
        );
        let invoker = Invoker::new(&log, CancelToken::new(), settings(Duration::from_secs(5)));

        let inv = invoker.invoke(&backend, &scope(temp.path()), 0).expect("invoke");
        assert_eq!(inv.classification.reason, Some(FailureReason::Unavailable));
        assert!(
            inv.classification
                .detail
                .as_deref()
                .is_some_and(|d| d.contains("disk full"))
        );
    }
}
