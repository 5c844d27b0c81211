//! Run configuration stored under `.taskloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::backoff::BackoffPolicy;
use crate::core::classify::{LimitMarkers, default_rate_markers, default_usage_markers};
use crate::core::task::TaskBudget;

/// Environment variable overriding `fallback_order`.
pub const FALLBACK_ORDER_ENV: &str = "AGENT_FALLBACK_ORDER";

/// Upper bound for every configured wait (timeouts, cool-down, grace, backoff).
pub const MAX_WAIT_SECS: u64 = 30 * 24 * 60 * 60;

/// Run configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults. Loaded once per
/// process and treated as read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Markdown checklist, relative to the workspace root.
    pub todo_file: PathBuf,

    /// Backend names in priority order. Each must have an entry in `backends`.
    pub fallback_order: Vec<String>,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,

    /// Retries after the first call, per backend per request.
    pub max_retries: u32,

    /// Seconds a backend sits out after a fatal error.
    pub cooldown_secs: u64,

    pub max_approaches: u32,
    pub max_attempts_per_approach: u32,

    /// Echo streamed backend output to the terminal.
    pub stream: bool,

    /// Seconds a CLI backend gets to exit on its own after an interrupt.
    pub interrupt_grace_secs: u64,

    /// Truncate captured backend/check output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Maximum prompt size before droppable sections are removed.
    pub prompt_budget_bytes: usize,

    pub backoff: BackoffConfig,
    pub dod: DodConfig,
    pub escalation: EscalationConfig,
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            max_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DodConfig {
    /// Checklist of completion criteria. When unset, well-known locations are searched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criteria_file: Option<PathBuf>,
    pub checks: Vec<DodCheck>,
}

impl Default for DodConfig {
    fn default() -> Self {
        Self {
            criteria_file: None,
            checks: vec![DodCheck {
                name: "Tests Pass".to_string(),
                command: vec!["just".to_string(), "ci".to_string()],
                timeout_secs: 300,
                suggestion: Some(
                    "Run the checks locally and fix failures before finishing".to_string(),
                ),
            }],
        }
    }
}

/// One external completion check. Non-zero exit or timeout fails it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DodCheck {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

fn default_check_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscalationConfig {
    /// When false, tasks that exhaust every approach are marked failed.
    pub enabled: bool,
    /// Operator hand-off log, relative to the workspace root.
    pub log_file: PathBuf,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: PathBuf::from(".taskloop/ESCALATIONS.md"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local agent CLI fed the prompt on stdin.
    Cli(CliBackendConfig),
    /// OpenRouter chat-completions endpoint.
    Router(RouterBackendConfig),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StreamFormat {
    /// Echo stdout lines as they arrive.
    #[default]
    Plain,
    /// NDJSON events from `claude --output-format stream-json`; echo text only.
    ClaudeJson,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliBackendConfig {
    pub command: Vec<String>,
    pub stream_format: StreamFormat,
    /// Regexes matched against stderr that mean the allowance is spent.
    pub usage_markers: Vec<String>,
    /// Regexes matched against stderr that mean throttling.
    pub rate_markers: Vec<String>,
}

impl Default for CliBackendConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            stream_format: StreamFormat::Plain,
            usage_markers: default_usage_markers(),
            rate_markers: default_rate_markers(),
        }
    }
}

impl CliBackendConfig {
    pub fn markers(&self) -> Result<LimitMarkers> {
        LimitMarkers::compile(&self.usage_markers, &self.rate_markers).map_err(|err| anyhow!(err))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterBackendConfig {
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Models tried in turn; retry `k` uses `models[k % len]`.
    pub models: Vec<String>,
    /// Upper bound on a single model call, applied under `timeout_secs`.
    pub per_attempt_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Model turns that may request workspace tools before the call is abandoned.
    pub max_tool_rounds: u32,
}

impl Default for RouterBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            models: vec![
                "anthropic/claude-sonnet-4".to_string(),
                "openai/gpt-4.1".to_string(),
                "google/gemini-2.5-pro".to_string(),
            ],
            per_attempt_timeout_secs: 90,
            max_tokens: None,
            max_tool_rounds: 24,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(
            "claude".to_string(),
            BackendConfig::Cli(CliBackendConfig {
                command: [
                    "claude",
                    "-p",
                    "--output-format",
                    "stream-json",
                    "--include-partial-messages",
                    "--verbose",
                    "--allowedTools",
                    "Read,Edit,Write,Replace,Glob,Grep,LS,Bash",
                ]
                .map(String::from)
                .to_vec(),
                stream_format: StreamFormat::ClaudeJson,
                ..CliBackendConfig::default()
            }),
        );
        backends.insert(
            "codex".to_string(),
            BackendConfig::Cli(CliBackendConfig {
                command: [
                    "codex",
                    "exec",
                    "--sandbox",
                    "workspace-write",
                    "--skip-git-repo-check",
                    "-",
                ]
                .map(String::from)
                .to_vec(),
                ..CliBackendConfig::default()
            }),
        );
        backends.insert(
            "router".to_string(),
            BackendConfig::Router(RouterBackendConfig::default()),
        );

        Self {
            todo_file: PathBuf::from("TODO.md"),
            fallback_order: vec![
                "codex".to_string(),
                "claude".to_string(),
                "router".to_string(),
            ],
            timeout_secs: 600,
            max_retries: 3,
            cooldown_secs: 300,
            max_approaches: 3,
            max_attempts_per_approach: 3,
            stream: true,
            interrupt_grace_secs: 5,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 40_000,
            backoff: BackoffConfig::default(),
            dod: DodConfig::default(),
            escalation: EscalationConfig::default(),
            backends,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        check_wait("timeout_secs", self.timeout_secs)?;
        check_wait("cooldown_secs", self.cooldown_secs)?;
        check_wait("interrupt_grace_secs", self.interrupt_grace_secs)?;
        check_wait("backoff.max_ms", self.backoff.max_ms / 1_000)?;
        if self.max_approaches == 0 {
            return Err(anyhow!("max_approaches must be > 0"));
        }
        if self.max_attempts_per_approach == 0 {
            return Err(anyhow!("max_attempts_per_approach must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(anyhow!("backoff.base_ms must be <= backoff.max_ms"));
        }
        if self.fallback_order.is_empty() {
            return Err(anyhow!("fallback_order must name at least one backend"));
        }
        for (idx, name) in self.fallback_order.iter().enumerate() {
            if self.fallback_order[..idx].contains(name) {
                return Err(anyhow!("fallback_order lists '{name}' twice"));
            }
            if !self.backends.contains_key(name) {
                return Err(anyhow!(
                    "fallback_order names '{name}' but [backends.{name}] is not defined"
                ));
            }
        }
        for (name, backend) in &self.backends {
            match backend {
                BackendConfig::Cli(cli) => {
                    if cli.command.is_empty() || cli.command[0].trim().is_empty() {
                        return Err(anyhow!(
                            "backends.{name}.command must be a non-empty array"
                        ));
                    }
                    cli.markers()
                        .with_context(|| format!("backends.{name} markers"))?;
                }
                BackendConfig::Router(router) => {
                    if router.models.is_empty() {
                        return Err(anyhow!("backends.{name}.models must not be empty"));
                    }
                    if router.per_attempt_timeout_secs == 0 {
                        return Err(anyhow!(
                            "backends.{name}.per_attempt_timeout_secs must be > 0"
                        ));
                    }
                    check_wait(
                        &format!("backends.{name}.per_attempt_timeout_secs"),
                        router.per_attempt_timeout_secs,
                    )?;
                    if router.max_tool_rounds == 0 {
                        return Err(anyhow!("backends.{name}.max_tool_rounds must be > 0"));
                    }
                }
            }
        }
        for check in &self.dod.checks {
            if check.command.is_empty() || check.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "dod check '{}' must have a non-empty command",
                    check.name
                ));
            }
            if check.timeout_secs == 0 {
                return Err(anyhow!("dod check '{}' timeout_secs must be > 0", check.name));
            }
            check_wait(
                &format!("dod check '{}' timeout_secs", check.name),
                check.timeout_secs,
            )?;
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff.base_ms),
            max: Duration::from_millis(self.backoff.max_ms),
            jitter: self.backoff.jitter,
        }
    }

    pub fn task_budget(&self) -> TaskBudget {
        TaskBudget {
            max_approaches: self.max_approaches,
            max_attempts: self.max_attempts_per_approach,
        }
    }

    /// Apply the env fallback order, then move `primary` to the front.
    ///
    /// Names in the env value that have no backend definition are dropped with
    /// a warning; an env value that leaves nothing usable is ignored.
    pub fn apply_backend_overrides(
        &mut self,
        env_order: Option<&str>,
        primary: Option<&str>,
    ) -> Result<()> {
        if let Some(raw) = env_order {
            let parsed = parse_fallback_order(raw);
            let (known, unknown): (Vec<_>, Vec<_>) = parsed
                .into_iter()
                .partition(|name| self.backends.contains_key(name));
            for name in &unknown {
                warn!(backend = %name, env = FALLBACK_ORDER_ENV, "ignoring unknown backend");
            }
            if known.is_empty() {
                warn!(
                    env = FALLBACK_ORDER_ENV,
                    value = raw,
                    "no usable backends, keeping config order"
                );
            } else {
                self.fallback_order = known;
            }
        }

        if let Some(primary) = primary {
            let primary = normalize_backend_name(primary);
            if !self.backends.contains_key(&primary) {
                return Err(anyhow!("unknown backend '{primary}'"));
            }
            self.fallback_order.retain(|name| name != &primary);
            self.fallback_order.insert(0, primary);
        }
        Ok(())
    }
}

fn check_wait(field: &str, secs: u64) -> Result<()> {
    if secs > MAX_WAIT_SECS {
        return Err(anyhow!("{field} must be <= {MAX_WAIT_SECS} seconds"));
    }
    Ok(())
}

/// Split a fallback order such as `"router | codex > claude"`.
///
/// Accepts `|`, `,`, `>` and whitespace as separators, lowercases names,
/// maps OpenRouter aliases to `router`, and drops duplicates keeping the
/// first occurrence.
pub fn parse_fallback_order(raw: &str) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for token in raw.split(|c: char| matches!(c, '|' | ',' | '>') || c.is_whitespace()) {
        if token.is_empty() {
            continue;
        }
        let name = normalize_backend_name(token);
        if !order.contains(&name) {
            order.push(name);
        }
    }
    order
}

fn normalize_backend_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "openrouter" | "openrouter_harness" | "openrouter-harness" => "router".to_string(),
        _ => lower,
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}
