//! Signal-based outcome classification for backend calls.
//!
//! Classification looks only at how a call ended (exit code, HTTP status,
//! transport failure, deadline) plus the diagnostic tail a CLI wrote to
//! stderr. The response payload itself never decides the outcome.

use regex::Regex;

use crate::core::types::{AttemptOutcome, Classification, FailureReason};

/// How a backend call ended, as observed by the backend adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitSignal {
    /// Process exited 0, or the HTTP stream delivered its terminal marker.
    Completed,
    /// Process exited non-zero (`code` is `None` when killed by a signal).
    ExitCode {
        code: Option<i32>,
        stderr_tail: String,
    },
    /// Non-2xx HTTP response.
    HttpStatus { status: u16, body: String },
    /// The backend reported an error inside an otherwise healthy stream.
    StreamError(String),
    /// Connect failure, reset, or a stream that ended without its terminal marker.
    Transport(String),
    /// The process could not be started.
    SpawnFailed { not_found: bool, message: String },
    /// The call deadline passed and the call was cancelled.
    TimedOut,
    /// The operator interrupted the call.
    Interrupted,
    /// The model finished without changing the workspace.
    NoChanges(String),
}

/// Patterns matched against CLI stderr to detect limit signals.
#[derive(Debug, Clone)]
pub struct LimitMarkers {
    pub usage_limit: Vec<Regex>,
    pub rate_limit: Vec<Regex>,
}

impl LimitMarkers {
    /// Compile marker patterns. Invalid patterns are reported by index and text.
    pub fn compile(usage_limit: &[String], rate_limit: &[String]) -> Result<Self, String> {
        Ok(Self {
            usage_limit: compile_all(usage_limit)?,
            rate_limit: compile_all(rate_limit)?,
        })
    }

    fn matches_usage(&self, text: &str) -> bool {
        self.usage_limit.iter().any(|re| re.is_match(text))
    }

    fn matches_rate(&self, text: &str) -> bool {
        self.rate_limit.iter().any(|re| re.is_match(text))
    }
}

impl Default for LimitMarkers {
    fn default() -> Self {
        Self::compile(&default_usage_markers(), &default_rate_markers())
            .unwrap_or_else(|_| Self {
                usage_limit: Vec::new(),
                rate_limit: Vec::new(),
            })
    }
}

pub fn default_usage_markers() -> Vec<String> {
    vec![
        r"(?i)usage limit".to_string(),
        r"(?i)quota".to_string(),
        r"(?i)credit balance|out of credits|insufficient credits".to_string(),
        r"(?i)token limit".to_string(),
    ]
}

pub fn default_rate_markers() -> Vec<String> {
    vec![
        r"(?i)rate[ _-]?limit".to_string(),
        r"(?i)too many requests".to_string(),
        r"\b429\b".to_string(),
    ]
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, String> {
    patterns
        .iter()
        .enumerate()
        .map(|(idx, pattern)| {
            Regex::new(pattern).map_err(|err| format!("marker[{idx}] `{pattern}`: {err}"))
        })
        .collect()
}

/// Map an exit signal onto the attempt taxonomy.
pub fn classify(signal: &ExitSignal, markers: &LimitMarkers) -> Classification {
    use AttemptOutcome as O;
    use FailureReason as R;

    match signal {
        ExitSignal::Completed => Classification::success(),
        ExitSignal::TimedOut => Classification::failure(O::Timeout, R::Timeout, None),
        ExitSignal::Interrupted => Classification::failure(O::Interrupted, R::Interrupted, None),
        ExitSignal::Transport(message) => {
            Classification::failure(O::TransientError, R::Network, Some(message.clone()))
        }
        ExitSignal::SpawnFailed { not_found, message } => {
            if *not_found {
                Classification::failure(O::FatalError, R::Unavailable, Some(message.clone()))
            } else {
                Classification::failure(O::TransientError, R::Network, Some(message.clone()))
            }
        }
        ExitSignal::StreamError(message) => classify_text(message, markers, R::Rejected),
        ExitSignal::NoChanges(message) => {
            Classification::failure(O::FatalError, R::Rejected, non_empty(message))
        }
        ExitSignal::HttpStatus { status, body } => classify_http(*status, body),
        ExitSignal::ExitCode {
            code: None,
            stderr_tail,
        } => Classification::failure(O::TransientError, R::Crashed, non_empty(stderr_tail)),
        ExitSignal::ExitCode {
            code: Some(_),
            stderr_tail,
        } => classify_text(stderr_tail, markers, R::Rejected),
    }
}

fn classify_http(status: u16, body: &str) -> Classification {
    use AttemptOutcome as O;
    use FailureReason as R;

    let detail = Some(format!("HTTP {status}: {}", tail(body, 300)));
    match status {
        429 => Classification::failure(O::RateLimited, R::RateLimited, detail),
        402 => Classification::failure(O::FatalError, R::UsageLimit, detail),
        408 => Classification::failure(O::Timeout, R::Timeout, detail),
        500..=599 => Classification::failure(O::TransientError, R::ServerFault, detail),
        _ => Classification::failure(O::FatalError, R::Rejected, detail),
    }
}

/// Usage markers are checked before rate markers; quota errors often mention rate limits too.
fn classify_text(text: &str, markers: &LimitMarkers, fallback: FailureReason) -> Classification {
    let detail = non_empty(text);
    if markers.matches_usage(text) {
        return Classification::failure(
            AttemptOutcome::FatalError,
            FailureReason::UsageLimit,
            detail,
        );
    }
    if markers.matches_rate(text) {
        return Classification::failure(
            AttemptOutcome::RateLimited,
            FailureReason::RateLimited,
            detail,
        );
    }
    Classification::failure(AttemptOutcome::FatalError, fallback, detail)
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(tail(trimmed, 500).to_string())
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
