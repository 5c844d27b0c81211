//! Checklist-driven agent task executor.
//!
//! Reads a Markdown TODO list and works through it one task at a time by
//! handing each task to an AI coding backend. Completions are only accepted
//! after a Definition-of-Done gate passes; the executor, never the agent,
//! checks items off. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, backoff, task
//!   budgets, backend health). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, TODO file, processes,
//!   HTTP, telemetry, run state). Seams are traits so tests can script them.
//!
//! Orchestration modules ([`step`], [`looping`]) coordinate core logic with
//! I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
