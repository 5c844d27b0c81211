//! Scripted backends, validators and scratch workspaces for tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::classify::ExitSignal;
use crate::core::types::ValidationResult;
use crate::io::backend::{Backend, BackendExit, CallRequest};
use crate::io::config::{BackendConfig, BackoffConfig, CliBackendConfig, DodConfig, RunConfig};
use crate::io::dod::{ValidationRequest, Validator};
use crate::io::interrupt::{CallGuard, POLL_INTERVAL, Stop};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Reply {
    Exit(ExitSignal),
    /// Block until the guard's deadline or an interrupt.
    Hang,
    /// `submit` itself fails.
    HarnessError(String),
}

impl Reply {
    pub fn completed() -> Self {
        Self::Exit(ExitSignal::Completed)
    }

    /// Non-zero CLI exit with `stderr` on the diagnostic channel.
    pub fn exit_code(code: i32, stderr: &str) -> Self {
        Self::Exit(ExitSignal::ExitCode {
            code: Some(code),
            stderr_tail: stderr.to_string(),
        })
    }
}

/// Shared view of the calls a [`ScriptedBackend`] received.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    count: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts().pop()
    }
}

type SubmitHook = Box<dyn Fn(&CallRequest) + Send + Sync>;

/// Backend that replays queued replies, then repeats a default reply.
pub struct ScriptedBackend {
    name: String,
    replies: Mutex<VecDeque<Reply>>,
    default_reply: Reply,
    model: Option<String>,
    preflight: Result<(), String>,
    retry_after: Option<Duration>,
    log: CallLog,
    on_submit: Option<SubmitHook>,
}

impl ScriptedBackend {
    /// A backend that always completes.
    pub fn new(name: &str) -> Self {
        Self::with_replies(name, Vec::new())
    }

    /// Replay `replies` in order, then complete on every further call.
    pub fn with_replies(name: &str, replies: Vec<Reply>) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(replies.into()),
            default_reply: Reply::completed(),
            model: None,
            preflight: Ok(()),
            retry_after: None,
            log: CallLog::default(),
            on_submit: None,
        }
    }

    /// Reply used once the queue is empty.
    pub fn always(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn failing_preflight(mut self, reason: &str) -> Self {
        self.preflight = Err(reason.to_string());
        self
    }

    /// Attach a `Retry-After` hint to every failed reply.
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    /// Run `hook` at the start of every call (e.g. to edit the workspace like an agent).
    pub fn on_submit(mut self, hook: impl Fn(&CallRequest) + Send + Sync + 'static) -> Self {
        self.on_submit = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> CallLog {
        self.log.clone()
    }

    pub fn boxed(self) -> Box<dyn Backend> {
        Box::new(self)
    }

    fn next_reply(&self) -> Reply {
        self.replies
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self) -> Result<(), String> {
        self.preflight.clone()
    }

    fn submit(&self, request: &CallRequest, guard: &CallGuard) -> Result<BackendExit> {
        self.log.count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.log.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        if let Some(hook) = &self.on_submit {
            hook(request);
        }
        let signal = match self.next_reply() {
            Reply::Exit(signal) => signal,
            Reply::HarnessError(message) => return Err(anyhow!(message)),
            Reply::Hang => loop {
                match guard.check() {
                    Some(Stop::Deadline) => break ExitSignal::TimedOut,
                    Some(Stop::Interrupted) => break ExitSignal::Interrupted,
                    None => thread::sleep(POLL_INTERVAL),
                }
            },
        };
        let (response, retry_after) = if signal == ExitSignal::Completed {
            (format!("{} finished", self.name), None)
        } else {
            (String::new(), self.retry_after)
        };
        Ok(BackendExit {
            signal,
            response,
            model: self.model.clone(),
            retry_after,
        })
    }
}

/// Validator driven by a closure.
pub struct FnValidator<F>(pub F);

impl<F> FnValidator<F>
where
    F: Fn(&ValidationRequest<'_>) -> ValidationResult,
{
    pub fn new(judge: F) -> Self {
        Self(judge)
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&ValidationRequest<'_>) -> ValidationResult,
{
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationResult> {
        Ok((self.0)(request))
    }
}

pub fn passed() -> ValidationResult {
    ValidationResult {
        passed: true,
        checks_run: vec!["Tests Pass".to_string()],
        ..ValidationResult::default()
    }
}

pub fn failed(diagnostic: &str) -> ValidationResult {
    ValidationResult {
        passed: false,
        checks_run: vec!["Tests Pass".to_string()],
        failed: vec!["Tests Pass".to_string()],
        diagnostics: vec![diagnostic.to_string()],
        suggestions: vec!["Fix failing tests before marking task complete".to_string()],
    }
}

/// Config for scripted runs: the named backends as placeholder CLI entries,
/// no backoff delay, no DoD checks.
pub fn scripted_config(order: &[&str]) -> RunConfig {
    let backends: BTreeMap<String, BackendConfig> = order
        .iter()
        .map(|name| {
            (
                (*name).to_string(),
                BackendConfig::Cli(CliBackendConfig {
                    command: vec!["true".to_string()],
                    ..CliBackendConfig::default()
                }),
            )
        })
        .collect();
    RunConfig {
        fallback_order: order.iter().map(|n| (*n).to_string()).collect(),
        timeout_secs: 5,
        max_retries: 1,
        cooldown_secs: 300,
        stream: false,
        interrupt_grace_secs: 0,
        backoff: BackoffConfig {
            base_ms: 0,
            max_ms: 0,
            jitter: false,
        },
        dod: DodConfig {
            criteria_file: None,
            checks: Vec::new(),
        },
        backends,
        ..RunConfig::default()
    }
}

/// Temporary workspace with a TODO file.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn with_todo(contents: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp workspace");
        fs::write(dir.path().join("TODO.md"), contents).expect("write TODO.md");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn todo_path(&self) -> PathBuf {
        self.root().join("TODO.md")
    }

    pub fn read_todo(&self) -> String {
        fs::read_to_string(self.todo_path()).expect("read TODO.md")
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.root().join(".taskloop").join("logs").join("attempts.jsonl")
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.root().join(relative)).expect("read workspace file")
    }
}
