//! Deterministic, pure logic shared by the task loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and take the current time as an argument where it matters, so they
//! stay deterministic under test.

pub mod backoff;
pub mod classify;
pub mod health;
pub mod task;
pub mod types;
