//! Fallback chain over prioritized backends.
//!
//! The chain owns backend health for the whole run. Each `run` walks the
//! roster in priority order with a fresh retry budget per backend, cooling
//! down or exhausting the backends that fail, and persists health after every
//! change so a resumed run honours cool-downs that are still running.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::health::{BackendState, Roster};
use crate::core::types::{AttemptOutcome, FailureReason, SwitchReason, SwitchRecord};
use crate::io::backend::Backend;
use crate::io::config::MAX_WAIT_SECS;
use crate::io::invoker::{CallScope, Invoker};
use crate::io::retry::{RetryPolicy, call_with_retries};
use crate::io::write_atomic;
use crate::looping::RunHalt;

/// How a chain call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResult {
    Completed {
        backend: String,
        response: String,
        model: Option<String>,
    },
    /// Every eligible backend was tried and failed for this call.
    Exhausted { tried: Vec<String>, detail: String },
    /// No backend can ever be used again in this run.
    AllExhausted,
    Interrupted { backend: Option<String> },
}

/// On-disk form of `.taskloop/state/backend_health.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthFile {
    pub run_id: String,
    pub backends: Vec<BackendState>,
}

pub struct FallbackChain {
    backends: Vec<Box<dyn Backend>>,
    roster: Roster,
    cooldown: TimeDelta,
    run_id: String,
    health_path: Option<PathBuf>,
}

impl FallbackChain {
    /// Build the chain in priority order.
    ///
    /// Backends failing preflight are marked exhausted; if none remain the
    /// run cannot start. Cool-downs persisted by the same run are adopted.
    /// `cooldown_secs` is clamped to [`MAX_WAIT_SECS`].
    pub fn new(
        backends: Vec<Box<dyn Backend>>,
        run_id: &str,
        cooldown_secs: u64,
        health_path: Option<PathBuf>,
    ) -> Result<Self> {
        let names: Vec<String> = backends.iter().map(|b| b.name().to_string()).collect();
        let mut roster = Roster::new(&names);

        if let Some(path) = &health_path
            && let Some(saved) = load_health(path)?
        {
            if saved.run_id == run_id {
                debug!(path = %path.display(), "adopting persisted backend health");
                roster.adopt(&saved.backends);
            } else {
                debug!(saved_run = %saved.run_id, "ignoring health from another run");
            }
        }

        for backend in &backends {
            if let Err(reason) = backend.preflight() {
                warn!(backend = backend.name(), %reason, "backend unavailable, skipping it");
                roster.mark_exhausted(backend.name(), FailureReason::Unavailable);
            }
        }
        if roster.is_empty() || roster.all_exhausted() {
            return Err(RunHalt::Configuration(
                "no usable backend: every configured backend failed preflight or is exhausted"
                    .to_string(),
            )
            .into());
        }

        let chain = Self {
            backends,
            roster,
            cooldown: i64::try_from(cooldown_secs.min(MAX_WAIT_SECS))
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
            run_id: run_id.to_string(),
            health_path,
        };
        chain.persist()?;
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Drive one request through the chain.
    ///
    /// `avoid` lists backends the current task prefers not to use (their
    /// completions were rejected). They are skipped unless nothing else is
    /// available. When every live backend is cooling down the chain waits
    /// for the earliest cool-down to end.
    #[instrument(skip_all, fields(task_id = scope.task_id))]
    pub fn run(
        &mut self,
        invoker: &Invoker<'_>,
        scope: &CallScope<'_>,
        policy: &RetryPolicy,
        avoid: &[String],
    ) -> Result<ChainResult> {
        let mut tried: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for _ in 0..self.backends.len() {
            if self.roster.all_exhausted() {
                return Ok(ChainResult::AllExhausted);
            }
            let Some(name) = self.select(invoker, &tried, avoid)? else {
                if invoker.token().is_cancelled() {
                    return Ok(ChainResult::Interrupted { backend: None });
                }
                break;
            };
            tried.push(name.clone());
            let Some(backend) = self.backends.iter().find(|b| b.name() == name) else {
                break;
            };

            debug!(backend = %name, "trying backend");
            let outcome = call_with_retries(invoker, backend.as_ref(), scope, policy)?;
            match outcome.classification.outcome {
                AttemptOutcome::Success => {
                    return Ok(ChainResult::Completed {
                        backend: name,
                        response: outcome.response,
                        model: outcome.model,
                    });
                }
                AttemptOutcome::Interrupted => {
                    return Ok(ChainResult::Interrupted {
                        backend: Some(name),
                    });
                }
                _ => {}
            }

            let reason = outcome
                .classification
                .reason
                .unwrap_or(FailureReason::Rejected);
            let detail = outcome.classification.detail.clone();
            let switch_reason = if reason == FailureReason::UsageLimit {
                self.roster.mark_exhausted(&name, reason);
                warn!(backend = %name, "backend usage exhausted for this run");
                SwitchReason::UsageLimit
            } else {
                let until = Utc::now()
                    .checked_add_signed(self.cooldown)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.roster.mark_cooling(&name, until, reason);
                warn!(backend = %name, %reason, cooldown_until = %until, "backend cooling down");
                SwitchReason::FatalError
            };
            self.persist()?;
            invoker.telemetry().record_switch(&SwitchRecord {
                run_id: scope.run_id.to_string(),
                task_id: scope.task_id.to_string(),
                from_backend: name.clone(),
                reason: switch_reason,
                detail: detail.clone(),
                at: Utc::now(),
            })?;
            failures.push(match detail {
                Some(detail) => format!("{name}: {reason}: {detail}"),
                None => format!("{name}: {reason}"),
            });
        }

        if self.roster.all_exhausted() {
            return Ok(ChainResult::AllExhausted);
        }
        let detail = if failures.is_empty() {
            "no backend available".to_string()
        } else {
            failures.join("\n")
        };
        info!(tried = tried.len(), "every eligible backend failed this call");
        Ok(ChainResult::Exhausted { tried, detail })
    }

    /// Next backend to try, honoring `avoid` when possible.
    fn select(
        &mut self,
        invoker: &Invoker<'_>,
        tried: &[String],
        avoid: &[String],
    ) -> Result<Option<String>> {
        let preferred: Vec<String> = tried.iter().chain(avoid).cloned().collect();
        let revived = self.roster.expire_cooldowns(Utc::now());
        if !revived.is_empty() {
            debug!(?revived, "cool-downs expired");
            self.persist()?;
        }
        if let Some(name) = self.roster.next_available(Utc::now(), &preferred) {
            return Ok(Some(name));
        }
        if let Some(name) = self.roster.next_available(Utc::now(), tried) {
            debug!(backend = %name, "only rejected backends are available");
            return Ok(Some(name));
        }
        if !tried.is_empty() {
            return Ok(None);
        }
        // Nothing tried yet and nothing available: wait out the shortest cool-down.
        let Some(until) = self.roster.earliest_cooldown() else {
            return Ok(None);
        };
        if !wait_until(invoker, until) {
            return Ok(None);
        }
        self.roster.expire_cooldowns(Utc::now());
        self.persist()?;
        Ok(self.roster.next_available(Utc::now(), &preferred).or_else(|| {
            self.roster.next_available(Utc::now(), &[])
        }))
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.health_path else {
            return Ok(());
        };
        let file = HealthFile {
            run_id: self.run_id.clone(),
            backends: self.roster.states().to_vec(),
        };
        let mut buf = serde_json::to_string_pretty(&file).context("serialize backend health")?;
        buf.push('\n');
        write_atomic(path, &buf)
    }
}

fn wait_until(invoker: &Invoker<'_>, until: DateTime<Utc>) -> bool {
    let wait = (until - Utc::now()).to_std().unwrap_or_default();
    info!(wait_secs = wait.as_secs(), "all backends cooling down, waiting");
    invoker.token().sleep(wait)
}

/// Load persisted health. A missing file reads as `None`.
pub fn load_health(path: &std::path::Path) -> Result<Option<HealthFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read backend health {}", path.display()))?;
    let file = serde_json::from_str(&contents)
        .with_context(|| format!("parse backend health {}", path.display()))?;
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::core::backoff::BackoffPolicy;
    use crate::core::classify::ExitSignal;
    use crate::core::types::BackendHealth;
    use crate::io::interrupt::CancelToken;
    use crate::io::invoker::CallSettings;
    use crate::io::telemetry::{TelemetryLog, read_calls, read_switches};
    use crate::test_support::{Reply, ScriptedBackend};

    const RUN: &str = "run-1";

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: BackoffPolicy {
                base: Duration::ZERO,
                max: Duration::ZERO,
                jitter: false,
            },
        }
    }

    fn settings() -> CallSettings {
        CallSettings {
            timeout: Duration::from_secs(5),
            echo: false,
            output_limit_bytes: 10_000,
            interrupt_grace: Duration::ZERO,
        }
    }

    fn scope(dir: &Path) -> CallScope<'_> {
        CallScope {
            run_id: RUN,
            task_id: "3",
            task_attempt: 0,
            task_approach: 0,
            attempt_dir: dir,
            workdir: dir,
            prompt: "p",
        }
    }

    fn usage_limit() -> Reply {
        Reply::exit_code(1, "Error: usage limit reached for this month")
    }

    fn rate_limited() -> Reply {
        Reply::Exit(ExitSignal::HttpStatus {
            status: 429,
            body: String::new(),
        })
    }

    /// Verifies A fatal, B rate-limited past budget, C succeeding ends on C.
    #[test]
    fn fatal_then_rate_limited_then_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let a = ScriptedBackend::new("a").always(Reply::exit_code(2, "segfault in agent"));
        let b = ScriptedBackend::new("b").always(rate_limited());
        let c = ScriptedBackend::new("c");
        let mut chain = FallbackChain::new(
            vec![a.boxed(), b.boxed(), c.boxed()],
            RUN,
            300,
            Some(temp.path().join("health.json")),
        )
        .expect("chain");

        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(2), &[])
            .expect("run");
        assert!(matches!(result, ChainResult::Completed { ref backend, .. } if backend == "c"));

        let calls = read_calls(log.path()).expect("calls");
        let per = |name: &str| calls.iter().filter(|c| c.backend == name).count();
        assert_eq!((per("a"), per("b"), per("c")), (1, 3, 1));

        let switches = read_switches(log.path()).expect("switches");
        assert_eq!(switches.len(), 2);
        assert_eq!(switches[0].from_backend, "a");
        assert_eq!(switches[1].from_backend, "b");
        assert!(switches.iter().all(|s| s.reason == SwitchReason::FatalError));

        // Rate limiting cools a backend down; it is never marked exhausted.
        let roster = chain.roster();
        assert_eq!(roster.get("a").expect("a").health, BackendHealth::CoolingDown);
        assert_eq!(roster.get("b").expect("b").health, BackendHealth::CoolingDown);
        assert_eq!(roster.get("c").expect("c").health, BackendHealth::Available);
    }

    /// An exhausted backend is never selected again in the run.
    #[test]
    fn usage_limit_exhausts_for_the_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let claude = ScriptedBackend::new("claude").always(usage_limit());
        let claude_calls = claude.calls();
        let codex = ScriptedBackend::new("codex");
        let mut chain =
            FallbackChain::new(vec![claude.boxed(), codex.boxed()], RUN, 0, None).expect("chain");

        for _ in 0..3 {
            let result = chain
                .run(&invoker, &scope(temp.path()), &policy(3), &[])
                .expect("run");
            assert!(
                matches!(result, ChainResult::Completed { ref backend, .. } if backend == "codex")
            );
        }
        assert_eq!(claude_calls.count(), 1);
        let switches = read_switches(log.path()).expect("switches");
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].reason, SwitchReason::UsageLimit);
    }

    #[test]
    fn every_backend_spent_reports_all_exhausted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let a = ScriptedBackend::new("a").always(usage_limit());
        let b = ScriptedBackend::new("b").always(Reply::Exit(ExitSignal::HttpStatus {
            status: 402,
            body: String::new(),
        }));
        let mut chain =
            FallbackChain::new(vec![a.boxed(), b.boxed()], RUN, 300, None).expect("chain");

        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(1), &[])
            .expect("run");
        assert_eq!(result, ChainResult::AllExhausted);
        assert!(chain.roster().all_exhausted());
    }

    /// Cooling backends make the call exhausted without marking them permanently spent.
    #[test]
    fn fatal_everywhere_is_exhausted_for_this_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let a = ScriptedBackend::new("a").always(Reply::exit_code(1, "bad flag"));
        let b = ScriptedBackend::new("b").always(Reply::Exit(ExitSignal::StreamError(
            "model refused".to_string(),
        )));
        let mut chain =
            FallbackChain::new(vec![a.boxed(), b.boxed()], RUN, 300, None).expect("chain");

        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(1), &[])
            .expect("run");
        let ChainResult::Exhausted { tried, detail } = result else {
            panic!("expected exhausted, got {result:?}");
        };
        assert_eq!(tried, ["a", "b"]);
        assert!(detail.contains("model refused"));
        assert!(!chain.roster().all_exhausted());
    }

    #[test]
    fn failed_preflight_marks_backend_exhausted() {
        let a = ScriptedBackend::new("a").failing_preflight("missing OPENROUTER_API_KEY");
        let b = ScriptedBackend::new("b");
        let chain = FallbackChain::new(vec![a.boxed(), b.boxed()], RUN, 300, None).expect("chain");
        assert_eq!(
            chain.roster().get("a").expect("a").health,
            BackendHealth::Exhausted
        );
    }

    #[test]
    fn no_backend_passing_preflight_is_a_configuration_error() {
        let a = ScriptedBackend::new("a").failing_preflight("not on PATH");
        let err = match FallbackChain::new(vec![a.boxed()], RUN, 300, None) {
            Ok(_) => panic!("expected configuration error"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<RunHalt>(),
            Some(RunHalt::Configuration(_))
        ));
    }

    /// Rejected backends are skipped while another one is available.
    #[test]
    fn avoided_backends_are_skipped_when_possible() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let a = ScriptedBackend::new("a");
        let a_calls = a.calls();
        let mut chain =
            FallbackChain::new(vec![a.boxed(), ScriptedBackend::new("b").boxed()], RUN, 300, None)
                .expect("chain");

        let avoid = vec!["a".to_string()];
        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(0), &avoid)
            .expect("run");
        assert!(matches!(result, ChainResult::Completed { ref backend, .. } if backend == "b"));
        assert_eq!(a_calls.count(), 0);

        let avoid = vec!["a".to_string(), "b".to_string()];
        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(0), &avoid)
            .expect("run");
        assert!(matches!(result, ChainResult::Completed { ref backend, .. } if backend == "a"));
    }

    /// A cool-down longer than the clock can represent is clamped, not a panic.
    #[test]
    fn oversized_cooldown_is_clamped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let a = ScriptedBackend::new("a").always(Reply::exit_code(2, "bad flag"));
        let mut chain = FallbackChain::new(
            vec![a.boxed(), ScriptedBackend::new("codex").boxed()],
            RUN,
            u64::MAX,
            Some(temp.path().join("health.json")),
        )
        .expect("chain");

        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(0), &[])
            .expect("run");
        assert!(matches!(result, ChainResult::Completed { ref backend, .. } if backend == "codex"));

        let a = chain.roster().get("a").expect("a");
        assert_eq!(a.health, BackendHealth::CoolingDown);
        let until = a.cooldown_until.expect("cooling until");
        let max_secs = i64::try_from(MAX_WAIT_SECS).expect("fits");
        assert!(until <= Utc::now() + TimeDelta::seconds(max_secs));
        assert!(load_health(&temp.path().join("health.json")).expect("load").is_some());
    }

    /// Cool-downs persist per run and are adopted only by the same run;
    /// exhaustion is retried by every invocation.
    #[test]
    fn health_is_persisted_and_reloaded_for_the_same_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let health = temp.path().join("state").join("backend_health.json");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        {
            let mut chain = FallbackChain::new(
                vec![
                    ScriptedBackend::new("a").always(usage_limit()).boxed(),
                    ScriptedBackend::new("b").always(Reply::exit_code(2, "crashed")).boxed(),
                    ScriptedBackend::new("c").boxed(),
                ],
                RUN,
                300,
                Some(health.clone()),
            )
            .expect("chain");
            chain
                .run(&invoker, &scope(temp.path()), &policy(0), &[])
                .expect("run");
        }
        let saved = load_health(&health).expect("load").expect("present");
        assert_eq!(saved.run_id, RUN);
        let saved_a = saved.backends.iter().find(|b| b.name == "a").expect("a");
        assert_eq!(saved_a.health, BackendHealth::Exhausted);

        let three = || {
            vec![
                ScriptedBackend::new("a").boxed(),
                ScriptedBackend::new("b").boxed(),
                ScriptedBackend::new("c").boxed(),
            ]
        };
        let resumed = FallbackChain::new(three(), RUN, 300, Some(health.clone())).expect("resumed");
        assert_eq!(resumed.roster().get("a").expect("a").health, BackendHealth::Available);
        assert_eq!(resumed.roster().get("b").expect("b").health, BackendHealth::CoolingDown);

        let fresh = FallbackChain::new(three(), "run-2", 300, Some(health)).expect("fresh");
        assert_eq!(fresh.roster().get("a").expect("a").health, BackendHealth::Available);
        assert_eq!(fresh.roster().get("b").expect("b").health, BackendHealth::Available);
    }

    #[test]
    fn interrupt_is_returned_without_touching_health() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let token = CancelToken::new();
        token.cancel();
        let invoker = Invoker::new(&log, token, settings());
        let mut chain = FallbackChain::new(
            vec![ScriptedBackend::with_replies("a", vec![Reply::Hang]).boxed()],
            RUN,
            300,
            None,
        )
        .expect("chain");

        let result = chain
            .run(&invoker, &scope(temp.path()), &policy(3), &[])
            .expect("run");
        assert_eq!(
            result,
            ChainResult::Interrupted {
                backend: Some("a".to_string())
            }
        );
        assert_eq!(chain.roster().get("a").expect("a").health, BackendHealth::Available);
        assert!(read_switches(log.path()).expect("switches").is_empty());
    }

    /// With everything cooling down the chain waits for the earliest cool-down.
    #[test]
    fn waits_for_cooldown_when_nothing_is_available() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = TelemetryLog::open(&temp.path().join("a.jsonl")).expect("log");
        let invoker = Invoker::new(&log, CancelToken::new(), settings());
        let a = ScriptedBackend::with_replies("a", vec![Reply::exit_code(1, "boom")]);
        let mut chain = FallbackChain::new(vec![a.boxed()], RUN, 1, None).expect("chain");

        let first = chain
            .run(&invoker, &scope(temp.path()), &policy(0), &[])
            .expect("first");
        assert!(matches!(first, ChainResult::Exhausted { .. }));

        let started = std::time::Instant::now();
        let second = chain
            .run(&invoker, &scope(temp.path()), &policy(0), &[])
            .expect("second");
        assert!(matches!(second, ChainResult::Completed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
