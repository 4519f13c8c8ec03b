//! Sequential task runner for autonomous coding agents.
//!
//! This crate drives an ordered list of tasks (loaded from a CSV file)
//! through interchangeable agent backends, each invoked as an external
//! process. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (cursor transitions, backend
//!   ordering, task-id arithmetic). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem state, control files,
//!   verification commands, git snapshots, process execution).
//! - **[`backends`]**: One adapter per agent CLI behind the uniform
//!   [`backends::AgentBackend`] contract.
//!
//! The orchestration module ([`run`]) coordinates core logic with I/O to
//! implement the per-task phase state machine (implement, verify/fix,
//! follow-ups) with crash-safe persistence after every step.

pub mod backends;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
