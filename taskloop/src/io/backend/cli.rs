//! Backends that spawn a local agent CLI (`claude -p`, `codex exec -`).
//!
//! The prompt is written to stdin. Completion is the process exit; stdout is
//! only teed to `stream.log` and optionally echoed.

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::classify::{ExitSignal, LimitMarkers, classify, tail};
use crate::core::types::Classification;
use crate::io::backend::{Backend, BackendExit, CallRequest};
use crate::io::config::{CliBackendConfig, StreamFormat};
use crate::io::interrupt::{CallGuard, Stop};
use crate::io::process::{LineHook, RunOptions, SpawnError, run_guarded, write_output_log};

/// Bytes of stderr kept for classification.
const STDERR_TAIL_BYTES: usize = 4_000;

pub struct CliBackend {
    name: String,
    command: Vec<String>,
    stream_format: StreamFormat,
    markers: LimitMarkers,
}

impl CliBackend {
    pub fn new(name: &str, config: &CliBackendConfig) -> Result<Self> {
        let markers = config
            .markers()
            .with_context(|| format!("backend {name} markers"))?;
        Ok(Self {
            name: name.to_string(),
            command: config.command.clone(),
            stream_format: config.stream_format,
            markers,
        })
    }

    fn echo_hook(&self) -> LineHook {
        match self.stream_format {
            StreamFormat::Plain => Box::new(|line: &[u8]| {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(line);
                let _ = out.flush();
            }),
            StreamFormat::ClaudeJson => {
                let mut renderer = ClaudeStreamRenderer::default();
                Box::new(move |line: &[u8]| {
                    if let Some(text) = renderer.render(&String::from_utf8_lossy(line)) {
                        let mut out = std::io::stdout().lock();
                        let _ = out.write_all(text.as_bytes());
                        let _ = out.flush();
                    }
                })
            }
        }
    }
}

impl Backend for CliBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self) -> Result<(), String> {
        let program = self.command.first().map(String::as_str).unwrap_or_default();
        if find_program(program).is_some() {
            Ok(())
        } else {
            Err(format!("command not found: {program}"))
        }
    }

    #[instrument(skip_all, fields(backend = %self.name, retry_index = request.retry_index))]
    fn submit(&self, request: &CallRequest, guard: &CallGuard) -> Result<BackendExit> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create attempt dir {}", parent.display()))?;
        }

        let (program, args) = self
            .command
            .split_first()
            .context("backend command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        info!(program = %program, prompt_bytes = request.prompt.len(), "starting agent cli");

        let options = RunOptions {
            stdin: Some(request.prompt.as_bytes()),
            output_limit_bytes: request.output_limit_bytes,
            stream_path: Some(&request.stream_path),
            on_line: request.echo.then(|| self.echo_hook()),
            interrupt_grace: request.interrupt_grace,
        };

        let output = match run_guarded(cmd, options, guard) {
            Ok(output) => output,
            Err(err) => {
                let Some(spawn) = err.downcast_ref::<SpawnError>() else {
                    return Err(err);
                };
                warn!(err = %spawn, "agent cli failed to start");
                return Ok(BackendExit::new(
                    ExitSignal::SpawnFailed {
                        not_found: spawn.source.kind() == std::io::ErrorKind::NotFound,
                        message: spawn.to_string(),
                    },
                    "",
                ));
            }
        };

        write_output_log(
            &request.log_path,
            "backend",
            &output,
            request.output_limit_bytes,
        )?;

        let stdout = output.stdout_lossy();
        let signal = match output.stopped {
            Some(Stop::Deadline) => ExitSignal::TimedOut,
            Some(Stop::Interrupted) => ExitSignal::Interrupted,
            None if output.status.success() => ExitSignal::Completed,
            None => {
                let mut diagnostic = output.stderr_lossy();
                if self.stream_format == StreamFormat::ClaudeJson
                    && let Some(result) = claude_result(&stdout)
                    && result.is_error
                {
                    diagnostic.push('\n');
                    diagnostic.push_str(&result.text);
                }
                ExitSignal::ExitCode {
                    code: output.status.code(),
                    stderr_tail: tail(&diagnostic, STDERR_TAIL_BYTES).to_string(),
                }
            }
        };
        debug!(?signal, "agent cli finished");

        let response = match self.stream_format {
            StreamFormat::ClaudeJson => claude_result(&stdout).map(|r| r.text).unwrap_or(stdout),
            StreamFormat::Plain => stdout,
        };
        Ok(BackendExit::new(signal, response))
    }

    fn classify(&self, exit: &BackendExit) -> Classification {
        classify(&exit.signal, &self.markers)
    }
}

/// Resolve `program` the way a shell would: paths as-is, bare names via `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Final `result` event of a claude stream-json transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeResult {
    pub text: String,
    pub is_error: bool,
}

pub fn claude_result(stdout: &str) -> Option<ClaudeResult> {
    stdout.lines().rev().find_map(|line| {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        if value.get("type")?.as_str()? != "result" {
            return None;
        }
        Some(ClaudeResult {
            text: value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    })
}

/// Turns claude NDJSON events into human-readable text for the terminal.
///
/// Partial-message deltas are shown as they arrive; the full assistant message
/// and the final result are shown only when no deltas were seen, so text is
/// never printed twice. Non-JSON lines pass through unchanged.
#[derive(Debug, Default)]
pub struct ClaudeStreamRenderer {
    saw_text: bool,
}

impl ClaudeStreamRenderer {
    pub fn render(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return Some(format!("{trimmed}\n"));
        };

        if let Some(text) = value
            .get("event")
            .and_then(|ev| ev.get("delta"))
            .and_then(|delta| delta.get("text"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            self.saw_text = true;
            return Some(text.to_string());
        }

        if self.saw_text {
            return None;
        }

        if let Some(parts) = value
            .get("message")
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_array)
        {
            let text: String = parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                return None;
            }
            self.saw_text = true;
            return Some(text);
        }

        value
            .get("result")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}
