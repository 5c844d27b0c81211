//! Operator interrupt forwarding and per-call deadlines.
//!
//! Ctrl-C sets a process-wide [`CancelToken`]. Every backend call polls a
//! [`CallGuard`] that combines the token with the call's deadline, so the
//! active call can stop its child or request and report the interrupt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Shared interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on interrupt. Returns `false` if interrupted.
    /// A duration past the clock's range sleeps until interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            let left = match until {
                Some(until) if now >= until => return true,
                Some(until) => until - now,
                None => POLL_INTERVAL,
            };
            thread::sleep(left.min(POLL_INTERVAL));
        }
    }
}

/// Granularity at which cancellable waits re-check the token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a guarded call must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Deadline,
    Interrupted,
}

/// Deadline plus interrupt token handed to one backend call.
///
/// A timeout too large for the monotonic clock leaves the guard without a
/// deadline.
#[derive(Debug, Clone)]
pub struct CallGuard {
    token: CancelToken,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl CallGuard {
    pub fn new(token: CancelToken, timeout: Duration) -> Self {
        Self {
            token,
            timeout,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Interrupts win over deadlines so the loop halts instead of retrying.
    pub fn check(&self) -> Option<Stop> {
        if self.token.is_cancelled() {
            return Some(Stop::Interrupted);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(Stop::Deadline);
        }
        None
    }
}

/// Install a Ctrl-C listener that cancels `token`.
///
/// The listener runs a current-thread tokio runtime on a detached thread. A
/// second Ctrl-C while the first is still being handled exits immediately.
pub fn install_ctrl_c(token: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("taskloop-ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(err = %err, "ctrl-c listener failed");
                        return;
                    }
                    if token.is_cancelled() {
                        eprintln!("second interrupt, exiting");
                        std::process::exit(crate::exit_codes::INTERRUPTED);
                    }
                    debug!("interrupt received");
                    eprintln!("interrupt received, stopping the active call");
                    token.cancel();
                }
            });
        })
        .context("spawn ctrl-c thread")?;
    Ok(())
}
