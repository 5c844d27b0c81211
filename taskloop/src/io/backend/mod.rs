//! Agent backend abstraction.
//!
//! The [`Backend`] trait decouples the fallback chain from how a backend is
//! reached (a local CLI or an HTTP endpoint). Tests use scripted backends
//! that return predetermined exits without spawning anything.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::core::classify::{ExitSignal, LimitMarkers, classify};
use crate::core::types::Classification;
use crate::io::config::{BackendConfig, RunConfig};
use crate::io::interrupt::CallGuard;

pub mod cli;
pub mod router;
pub mod tools;

pub use cli::CliBackend;
pub use router::RouterBackend;

/// Parameters for one physical backend call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Working directory the agent operates in.
    pub workdir: PathBuf,
    /// Instruction payload.
    pub prompt: String,
    /// 0-based retry index within the current retry controller invocation.
    pub retry_index: u32,
    /// Combined stdout/stderr (or HTTP exchange) log.
    pub log_path: PathBuf,
    /// Incremental output as it streams in.
    pub stream_path: PathBuf,
    /// Echo streamed text to the terminal.
    pub echo: bool,
    pub output_limit_bytes: usize,
    pub interrupt_grace: Duration,
}

/// What a backend observed when a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendExit {
    pub signal: ExitSignal,
    /// Raw response text (agent output or assembled completion).
    pub response: String,
    /// Model used, for backends that pick one per call.
    pub model: Option<String>,
    /// Wait the service asked for before the next call (`Retry-After`).
    pub retry_after: Option<Duration>,
}

impl BackendExit {
    pub fn new(signal: ExitSignal, response: impl Into<String>) -> Self {
        Self {
            signal,
            response: response.into(),
            model: None,
            retry_after: None,
        }
    }
}

/// Abstraction over agent backends.
pub trait Backend {
    fn name(&self) -> &str;

    /// Cheap readiness check run once when the chain is built (binary on
    /// `PATH`, credentials present). `Err` carries the operator-facing reason.
    fn preflight(&self) -> Result<(), String>;

    /// Issue one call. Must stop and return promptly once `guard` says so;
    /// an `Err` means the harness itself failed (not the backend).
    fn submit(&self, request: &CallRequest, guard: &CallGuard) -> Result<BackendExit>;

    fn classify(&self, exit: &BackendExit) -> Classification {
        classify(&exit.signal, &LimitMarkers::default())
    }
}

/// Instantiate configured backends in fallback order.
pub fn build_backends(cfg: &RunConfig) -> Result<Vec<Box<dyn Backend>>> {
    let mut backends: Vec<Box<dyn Backend>> = Vec::with_capacity(cfg.fallback_order.len());
    for name in &cfg.fallback_order {
        let Some(backend_cfg) = cfg.backends.get(name) else {
            anyhow::bail!("fallback_order names '{name}' but it is not defined");
        };
        match backend_cfg {
            BackendConfig::Cli(cli) => backends.push(Box::new(CliBackend::new(name, cli)?)),
            BackendConfig::Router(router) => {
                backends.push(Box::new(RouterBackend::new(name, router, cfg.stream)?));
            }
        }
    }
    Ok(backends)
}
