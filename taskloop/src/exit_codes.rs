//! Stable exit codes for taskloop CLI commands.

/// Command succeeded (every selected task is done).
pub const OK: i32 = 0;
/// Invalid configuration, missing TODO file, or other environment errors.
pub const INVALID: i32 = 1;
/// `taskloop next` found no pending task (list complete).
pub const COMPLETE: i32 = 2;
/// A run left tasks failed or escalated, or `check` found the DoD gate failing.
pub const INCOMPLETE: i32 = 3;
/// Every backend is exhausted; the run halted on a task.
pub const HALTED: i32 = 4;
/// The operator interrupted the run.
pub const INTERRUPTED: i32 = 130;
