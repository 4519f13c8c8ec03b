//! Side-effecting operations: filesystem, git, process execution.

pub mod config;
pub mod control;
pub mod followups;
pub mod git;
pub mod handoff;
pub mod process;
pub mod prompt;
pub mod state;
pub mod tasks;
pub mod verify;
