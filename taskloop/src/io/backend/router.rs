//! OpenRouter chat-completions backend.
//!
//! Each call picks `models[retry_index % models.len()]`, so the retry
//! controller's retries walk the model list. The model works on the
//! workspace through the file tools in [`super::tools`]; a call runs tool
//! rounds until the model answers without tool calls. A final answer that
//! changed nothing is not a completion.
//!
//! Requests run on a worker thread and the call side polls it against the
//! [`CallGuard`], so an interrupt or deadline returns promptly even while the
//! HTTP client is blocked on connect or on a silent server.

use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::classify::ExitSignal;
use crate::io::backend::tools::{self, ToolCall, WorkspaceTools};
use crate::io::backend::{Backend, BackendExit, CallRequest};
use crate::io::config::RouterBackendConfig;
use crate::io::interrupt::{CallGuard, Stop};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Tool-call slots accepted from one streamed turn.
const MAX_CALLS_PER_TURN: usize = 64;

pub struct RouterBackend {
    name: String,
    config: RouterBackendConfig,
    stream: bool,
    client: Client,
}

impl RouterBackend {
    pub fn new(name: &str, config: &RouterBackendConfig, stream: bool) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("build http client")?;
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            stream,
            client,
        })
    }

    pub fn model_for(&self, retry_index: u32) -> &str {
        let idx = retry_index as usize % self.config.models.len().max(1);
        self.config
            .models
            .get(idx)
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn api_key(&self) -> Option<String> {
        env::var(&self.config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    fn request_body(&self, model: &str, messages: &[Value]) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "tools": tools::definitions(),
            "stream": self.stream,
        });
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Start one HTTP exchange on a worker thread.
    ///
    /// The worker owns the blocking client call; if the call side stops
    /// listening, sends fail and the worker exits once the request timeout
    /// releases it.
    fn spawn_exchange(&self, api_key: String, body: Value, timeout: Duration) -> Receiver<Wire> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        let endpoint = self.config.endpoint.clone();
        let stream = self.stream;
        thread::spawn(move || {
            let sent = client
                .post(&endpoint)
                .bearer_auth(api_key)
                .header("X-Title", "taskloop")
                .timeout(timeout)
                .json(&body)
                .send();
            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    let _ = tx.send(Wire::Failed {
                        message: format!("{err:#}"),
                        timed_out: err.is_timeout(),
                    });
                    return;
                }
            };
            let status = response.status();
            let retry_after = parse_retry_after(response.headers());
            if tx
                .send(Wire::Status {
                    status: status.as_u16(),
                    retry_after,
                })
                .is_err()
            {
                return;
            }
            if stream && status.is_success() {
                let mut reader = BufReader::new(response);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line) {
                        Ok(0) => {
                            let _ = tx.send(Wire::End);
                            return;
                        }
                        Ok(_) => {
                            if tx.send(Wire::Line(line)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Wire::Failed {
                                message: format!("read stream: {err}"),
                                timed_out: err.kind() == std::io::ErrorKind::TimedOut,
                            });
                            return;
                        }
                    }
                }
            }
            let _ = match response.text() {
                Ok(text) => tx.send(Wire::Body(text)),
                Err(err) => tx.send(Wire::Failed {
                    message: format!("read body: {err:#}"),
                    timed_out: err.is_timeout(),
                }),
            };
        });
        rx
    }

    /// Run one request/response turn of the conversation.
    fn turn(
        &self,
        rx: &Receiver<Wire>,
        guard: &CallGuard,
        request: &CallRequest,
        transcript: &mut Transcript,
    ) -> Result<Turn, Ended> {
        let (status, retry_after) = match next_wire(rx, guard)? {
            Wire::Status {
                status,
                retry_after,
            } => (status, retry_after),
            Wire::Failed { message, timed_out } => {
                transcript.log.push_str(&format!("{message}\n"));
                return Err(Ended::from(failed_signal(message, timed_out, guard)));
            }
            _ => return Err(Ended::from(ExitSignal::Transport("no response status".into()))),
        };
        transcript.log.push_str(&format!("status: {status}\n"));

        if !(200..300).contains(&status) {
            let body = match next_wire(rx, guard)? {
                Wire::Body(body) => body,
                _ => String::new(),
            };
            transcript.log.push_str(&body);
            transcript.log.push('\n');
            return Err(Ended {
                signal: ExitSignal::HttpStatus { status, body },
                retry_after,
            });
        }

        if !self.stream {
            return match next_wire(rx, guard)? {
                Wire::Body(body) => {
                    transcript.log.push_str(&body);
                    transcript.log.push('\n');
                    parse_message(&body).map_err(Ended::from)
                }
                Wire::Failed { message, timed_out } => {
                    Err(Ended::from(failed_signal(message, timed_out, guard)))
                }
                _ => Err(Ended::from(ExitSignal::Transport("missing body".into()))),
            };
        }

        let mut turn = Turn::default();
        loop {
            let line = match next_wire(rx, guard) {
                Ok(Wire::Line(line)) => line,
                Ok(Wire::End) => {
                    warn!("router stream closed before [DONE]");
                    transcript.log.push_str(&turn.content);
                    return Err(Ended::from(ExitSignal::Transport(
                        "stream ended before [DONE]".to_string(),
                    )));
                }
                Ok(Wire::Failed { message, timed_out }) => {
                    return Err(Ended::from(failed_signal(message, timed_out, guard)));
                }
                Ok(_) => continue,
                Err(ended) => {
                    transcript.log.push_str(&turn.content);
                    return Err(ended);
                }
            };
            transcript.record_stream_line(&line);

            match parse_sse_line(&line) {
                SseEvent::Done => {
                    turn.finish_stream();
                    transcript.log.push_str(&turn.content);
                    transcript.log.push('\n');
                    return Ok(turn);
                }
                SseEvent::Error(message) => {
                    return Err(Ended::from(ExitSignal::StreamError(message)));
                }
                SseEvent::Delta {
                    content,
                    tool_calls,
                } => {
                    if request.echo && !content.is_empty() {
                        let mut out = std::io::stdout().lock();
                        let _ = out.write_all(content.as_bytes());
                        let _ = out.flush();
                    }
                    turn.content.push_str(&content);
                    turn.merge(tool_calls);
                }
                SseEvent::Ignore => {}
            }
        }
    }
}

impl Backend for RouterBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn preflight(&self) -> Result<(), String> {
        if self.api_key().is_some() {
            Ok(())
        } else {
            Err(format!("missing {}", self.config.api_key_env))
        }
    }

    #[instrument(skip_all, fields(backend = %self.name, retry_index = request.retry_index))]
    fn submit(&self, request: &CallRequest, guard: &CallGuard) -> Result<BackendExit> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create attempt dir {}", parent.display()))?;
        }
        let model = self.model_for(request.retry_index).to_string();
        let finish = |signal: ExitSignal, response: String, retry_after: Option<Duration>| {
            BackendExit {
                signal,
                response,
                model: Some(model.clone()),
                retry_after,
            }
        };

        let Some(api_key) = self.api_key() else {
            return Ok(finish(
                ExitSignal::SpawnFailed {
                    not_found: true,
                    message: format!("missing {}", self.config.api_key_env),
                },
                String::new(),
                None,
            ));
        };
        if let Some(stop) = guard.check() {
            return Ok(finish(stop_signal(stop), String::new(), None));
        }

        let stream_file = if self.stream {
            let file = File::create(&request.stream_path).with_context(|| {
                format!("create stream file {}", request.stream_path.display())
            })?;
            Some(BufWriter::new(file))
        } else {
            None
        };
        let mut transcript = Transcript {
            log: format!("model: {model}\n"),
            stream_file,
        };
        let mut workspace = WorkspaceTools::new(&request.workdir, request.output_limit_bytes);
        let mut messages = vec![json!({ "role": "user", "content": request.prompt })];
        let per_attempt = Duration::from_secs(self.config.per_attempt_timeout_secs);

        for round in 1..=self.config.max_tool_rounds {
            let timeout = guard.remaining().min(per_attempt);
            info!(model = %model, round, timeout_secs = timeout.as_secs(), "calling router");
            transcript.log.push_str(&format!("\n--- round {round} ---\n"));

            let rx = self.spawn_exchange(
                api_key.clone(),
                self.request_body(&model, &messages),
                timeout,
            );
            let turn = match self.turn(&rx, guard, request, &mut transcript) {
                Ok(turn) => turn,
                Err(ended) => {
                    write_log(request, &transcript.log)?;
                    debug!(signal = ?ended.signal, round, "router call ended early");
                    return Ok(finish(ended.signal, String::new(), ended.retry_after));
                }
            };

            if turn.tool_calls.is_empty() {
                write_log(request, &transcript.log)?;
                let changed = workspace.changed();
                if changed.is_empty() {
                    info!(round, "router finished without changing the workspace");
                    return Ok(finish(
                        ExitSignal::NoChanges(turn.content.clone()),
                        turn.content,
                        None,
                    ));
                }
                let mut response = turn.content;
                response.push_str("\n\nChanged files:\n");
                for path in changed {
                    response.push_str(&format!("- {path}\n"));
                }
                debug!(round, files = changed.len(), "router call finished");
                return Ok(finish(ExitSignal::Completed, response, None));
            }

            messages.push(json!({
                "role": "assistant",
                "content": turn.content,
                "tool_calls": turn.tool_calls,
            }));
            for call in &turn.tool_calls {
                let output = workspace.execute(&call.function);
                debug!(tool = %call.function.name, id = %call.id, "tool call");
                transcript.log.push_str(&format!(
                    "tool {} {} -> {}\n",
                    call.function.name,
                    call.function.arguments,
                    output.lines().next().unwrap_or_default()
                ));
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": output,
                }));
            }
        }

        write_log(request, &transcript.log)?;
        Ok(finish(
            ExitSignal::StreamError(format!(
                "no final answer after {} tool rounds",
                self.config.max_tool_rounds
            )),
            String::new(),
            None,
        ))
    }
}

/// What the exchange worker reports back.
enum Wire {
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    Line(String),
    Body(String),
    End,
    Failed {
        message: String,
        timed_out: bool,
    },
}

/// A turn that ended the call.
struct Ended {
    signal: ExitSignal,
    retry_after: Option<Duration>,
}

impl From<ExitSignal> for Ended {
    fn from(signal: ExitSignal) -> Self {
        Self {
            signal,
            retry_after: None,
        }
    }
}

/// One assistant reply: text plus any requested tool calls.
#[derive(Debug, Default)]
struct Turn {
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl Turn {
    fn merge(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            if delta.index >= MAX_CALLS_PER_TURN {
                continue;
            }
            if self.tool_calls.len() <= delta.index {
                self.tool_calls.resize_with(delta.index + 1, ToolCall::default);
            }
            let call = &mut self.tool_calls[delta.index];
            if let Some(id) = delta.id {
                call.id = id;
            }
            if let Some(name) = delta.function.name {
                call.function.name.push_str(&name);
            }
            if let Some(arguments) = delta.function.arguments {
                call.function.arguments.push_str(&arguments);
            }
        }
    }

    fn finish_stream(&mut self) {
        self.tool_calls.retain(|call| !call.function.name.is_empty());
        for (idx, call) in self.tool_calls.iter_mut().enumerate() {
            if call.id.is_empty() {
                call.id = format!("call_{idx}");
            }
            if call.call_type.is_empty() {
                call.call_type = "function".to_string();
            }
        }
    }
}

/// Backend log text plus the raw stream file, both kept across rounds.
struct Transcript {
    log: String,
    stream_file: Option<BufWriter<File>>,
}

impl Transcript {
    fn record_stream_line(&mut self, line: &str) {
        if let Some(file) = self.stream_file.as_mut()
            && let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush())
        {
            warn!(err = %e, "failed to write to stream file");
        }
    }
}

fn next_wire(rx: &Receiver<Wire>, guard: &CallGuard) -> Result<Wire, Ended> {
    loop {
        if let Some(stop) = guard.check() {
            return Err(Ended::from(stop_signal(stop)));
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(wire) => return Ok(wire),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Ended::from(ExitSignal::Transport(
                    "exchange worker exited".to_string(),
                )));
            }
        }
    }
}

fn stop_signal(stop: Stop) -> ExitSignal {
    match stop {
        Stop::Deadline => ExitSignal::TimedOut,
        Stop::Interrupted => ExitSignal::Interrupted,
    }
}

fn failed_signal(message: String, timed_out: bool, guard: &CallGuard) -> ExitSignal {
    if let Some(stop) = guard.check() {
        return stop_signal(stop);
    }
    if timed_out {
        return ExitSignal::TimedOut;
    }
    ExitSignal::Transport(message)
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Incremental tool-call fragment from a streamed chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// One parsed server-sent event line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta {
        content: String,
        tool_calls: Vec<ToolCallDelta>,
    },
    Error(String),
    Done,
    Ignore,
}

pub fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseEvent::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseEvent::Ignore;
    };
    if let Some(error) = value.get("error") {
        return SseEvent::Error(error_message(error));
    }
    let content = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = value
        .pointer("/choices/0/delta/tool_calls")
        .cloned()
        .and_then(|calls| serde_json::from_value::<Vec<ToolCallDelta>>(calls).ok())
        .unwrap_or_default();
    if content.is_empty() && tool_calls.is_empty() {
        return SseEvent::Ignore;
    }
    SseEvent::Delta {
        content,
        tool_calls,
    }
}

/// Parse a non-streaming chat-completions body.
fn parse_message(body: &str) -> Result<Turn, ExitSignal> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| ExitSignal::Transport(format!("read body: {err}")))?;
    if let Some(error) = value.get("error") {
        return Err(ExitSignal::StreamError(error_message(error)));
    }
    let content = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = match value.pointer("/choices/0/message/tool_calls") {
        None | Some(Value::Null) => Vec::new(),
        Some(calls) => serde_json::from_value::<Vec<ToolCall>>(calls.clone())
            .map_err(|err| ExitSignal::StreamError(format!("malformed tool_calls: {err}")))?,
    };
    Ok(Turn {
        content,
        tool_calls,
    })
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn write_log(request: &CallRequest, body: &str) -> Result<()> {
    let limit = request.output_limit_bytes;
    let buf = if body.len() > limit {
        let mut cut = limit;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n[truncated {} bytes]\n", &body[..cut], body.len() - cut)
    } else {
        body.to_string()
    };
    std::fs::write(&request.log_path, buf)
        .with_context(|| format!("write backend log {}", request.log_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttemptOutcome, FailureReason};
    use crate::io::interrupt::CancelToken;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn config(endpoint: &str, key_env: &str) -> RouterBackendConfig {
        RouterBackendConfig {
            endpoint: endpoint.to_string(),
            api_key_env: key_env.to_string(),
            models: vec!["m-one".to_string(), "m-two".to_string()],
            per_attempt_timeout_secs: 5,
            max_tokens: None,
            max_tool_rounds: 4,
        }
    }

    fn request(dir: &Path, retry_index: u32) -> CallRequest {
        CallRequest {
            workdir: dir.to_path_buf(),
            prompt: "hi".to_string(),
            retry_index,
            log_path: dir.join("logs").join("backend.log"),
            stream_path: dir.join("logs").join("stream.log"),
            echo: false,
            output_limit_bytes: 10_000,
            interrupt_grace: Duration::ZERO,
        }
    }

    fn guard() -> CallGuard {
        CallGuard::new(CancelToken::new(), Duration::from_secs(10))
    }

    /// Serve exactly one canned HTTP response on a local port.
    fn serve_once(response: String) -> String {
        serve_sequence(vec![response]).0
    }

    /// Serve canned responses to consecutive connections, recording each request body.
    fn serve_sequence(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        thread::spawn(move || {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept() else {
                    return;
                };
                let body = drain_request(&mut socket);
                recorded.lock().expect("lock").push(body);
                let _ = socket.write_all(response.as_bytes());
                let _ = socket.flush();
            }
        });
        (format!("http://{addr}/v1/chat/completions"), seen)
    }

    /// Read headers and the declared body so closing the socket does not reset it.
    fn drain_request(socket: &mut TcpStream) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            match socket.read(&mut buf) {
                Ok(0) | Err(_) => return String::new(),
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
            if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&seen[..header_end]).to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while seen.len() - header_end < content_length {
            match socket.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&seen[header_end..]).into_owned()
    }

    fn http(status: &str, content_type: &str, body: &str) -> String {
        http_with(status, content_type, "", body)
    }

    fn http_with(status: &str, content_type: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn write_call(id: &str, path: &str, content: &str) -> String {
        let arguments = json!({ "path": path, "content": content }).to_string();
        json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": { "name": "write_file", "arguments": arguments }
                }]
            }}]
        })
        .to_string()
    }

    #[test]
    fn retries_cycle_through_models() {
        let b = RouterBackend::new("router", &config("http://unused", "PATH"), true)
            .expect("backend");
        assert_eq!(b.model_for(0), "m-one");
        assert_eq!(b.model_for(1), "m-two");
        assert_eq!(b.model_for(2), "m-one");
    }

    #[test]
    fn preflight_requires_api_key() {
        let b = RouterBackend::new(
            "router",
            &config("http://unused", "TASKLOOP_TEST_KEY_THAT_IS_NOT_SET"),
            true,
        )
        .expect("backend");
        let err = b.preflight().unwrap_err();
        assert!(err.contains("TASKLOOP_TEST_KEY_THAT_IS_NOT_SET"));
    }

    #[test]
    fn sse_lines_parse_into_events() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#),
            SseEvent::Delta {
                content: "hi".to_string(),
                tool_calls: Vec::new(),
            }
        );
        assert_eq!(
            parse_sse_line(
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c","function":{"name":"read_file"}}]}}]}"#
            ),
            SseEvent::Delta {
                content: String::new(),
                tool_calls: vec![ToolCallDelta {
                    index: 1,
                    id: Some("c".to_string()),
                    function: FunctionDelta {
                        name: Some("read_file".to_string()),
                        arguments: None,
                    },
                }],
            }
        );
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"bad model"}}"#),
            SseEvent::Error("bad model".to_string())
        );
        assert_eq!(parse_sse_line(": OPENROUTER PROCESSING"), SseEvent::Ignore);
        assert_eq!(parse_sse_line(""), SseEvent::Ignore);
    }

    #[test]
    fn text_only_answer_is_rejected_without_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let endpoint = serve_once(http("200 OK", "text/event-stream", body));
        // PATH is always set, so it stands in for the API key variable.
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), true).expect("backend");
        let exit = b.submit(&request(temp.path(), 1), &guard()).expect("submit");
        assert_eq!(exit.signal, ExitSignal::NoChanges("Hello".to_string()));
        assert_eq!(exit.response, "Hello");
        assert_eq!(exit.model.as_deref(), Some("m-two"));
        let c = b.classify(&exit);
        assert_eq!(c.outcome, AttemptOutcome::FatalError);
        assert_eq!(c.reason, Some(FailureReason::Rejected));
        let stream = std::fs::read_to_string(temp.path().join("logs/stream.log")).expect("stream");
        assert!(stream.contains("[DONE]"));
    }

    #[test]
    fn tool_round_edits_the_workspace_then_completes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (endpoint, seen) = serve_sequence(vec![
            http("200 OK", "application/json", &write_call("call_1", "out.txt", "hi")),
            http(
                "200 OK",
                "application/json",
                r#"{"choices":[{"message":{"content":"wrote out.txt"}}]}"#,
            ),
        ]);
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), false).expect("backend");
        let exit = b.submit(&request(temp.path(), 0), &guard()).expect("submit");

        assert_eq!(exit.signal, ExitSignal::Completed);
        assert!(exit.response.starts_with("wrote out.txt"));
        assert!(exit.response.contains("- out.txt"));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("out.txt")).expect("written"),
            "hi"
        );
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains(r#""tools":"#));
        assert!(seen[1].contains(r#""tool_call_id":"call_1""#));
        let log = std::fs::read_to_string(temp.path().join("logs/backend.log")).expect("log");
        assert!(log.contains("--- round 2 ---"));
    }

    #[test]
    fn streamed_tool_call_fragments_are_joined() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"write_file\",\"arguments\":\"{\\\"path\\\":\\\"a.txt\\\",\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"content\\\":\\\"x\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let second = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let (endpoint, _) = serve_sequence(vec![
            http("200 OK", "text/event-stream", first),
            http("200 OK", "text/event-stream", second),
        ]);
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), true).expect("backend");
        let exit = b.submit(&request(temp.path(), 0), &guard()).expect("submit");

        assert_eq!(exit.signal, ExitSignal::Completed);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("a.txt")).expect("written"),
            "x"
        );
    }

    #[test]
    fn endless_tool_rounds_are_cut_off() {
        let temp = tempfile::tempdir().expect("tempdir");
        let endpoint = serve_once(http(
            "200 OK",
            "application/json",
            &write_call("call_1", "loop.txt", "again"),
        ));
        let mut cfg = config(&endpoint, "PATH");
        cfg.max_tool_rounds = 1;
        let b = RouterBackend::new("router", &cfg, false).expect("backend");
        let exit = b.submit(&request(temp.path(), 0), &guard()).expect("submit");
        assert!(matches!(
            exit.signal,
            ExitSignal::StreamError(ref m) if m.contains("1 tool rounds")
        ));
        assert_eq!(b.classify(&exit).outcome, AttemptOutcome::FatalError);
    }

    #[test]
    fn stream_without_done_is_transient() {
        let temp = tempfile::tempdir().expect("tempdir");
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
        let endpoint = serve_once(http("200 OK", "text/event-stream", body));
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), true).expect("backend");
        let exit = b.submit(&request(temp.path(), 0), &guard()).expect("submit");
        assert!(matches!(exit.signal, ExitSignal::Transport(_)));
        let c = b.classify(&exit);
        assert_eq!(c.outcome, AttemptOutcome::TransientError);
        assert_eq!(c.reason, Some(FailureReason::Network));
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let temp = tempfile::tempdir().expect("tempdir");
        let endpoint = serve_once(http_with(
            "429 Too Many Requests",
            "application/json",
            "Retry-After: 7\r\n",
            r#"{"error":{"message":"slow down"}}"#,
        ));
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), false).expect("backend");
        let exit = b.submit(&request(temp.path(), 0), &guard()).expect("submit");
        assert_eq!(b.classify(&exit).outcome, AttemptOutcome::RateLimited);
        assert_eq!(exit.retry_after, Some(Duration::from_secs(7)));
        let log = std::fs::read_to_string(temp.path().join("logs/backend.log")).expect("log");
        assert!(log.contains("slow down"));
    }

    #[test]
    fn retry_after_accepts_only_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, " 12 ".parse().expect("header"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().expect("header"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn interrupt_returns_while_server_is_silent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            if let Ok((mut socket, _)) = listener.accept() {
                drain_request(&mut socket);
                thread::sleep(Duration::from_secs(5));
            }
        });
        let endpoint = format!("http://{addr}/v1/chat/completions");
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), false).expect("backend");
        let token = CancelToken::new();
        let canceller = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });

        let started = Instant::now();
        let guard = CallGuard::new(token, Duration::from_secs(10));
        let exit = b.submit(&request(temp.path(), 0), &guard).expect("submit");
        assert_eq!(exit.signal, ExitSignal::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn refused_connection_is_transient() {
        let temp = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let endpoint = format!("http://{addr}/v1/chat/completions");
        let b = RouterBackend::new("router", &config(&endpoint, "PATH"), false).expect("backend");
        let exit = b.submit(&request(temp.path(), 0), &guard()).expect("submit");
        assert_eq!(b.classify(&exit).outcome, AttemptOutcome::TransientError);
    }
}
