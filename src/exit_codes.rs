//! Stable exit codes for agentrun CLI commands.

/// Run completed, or stopped gracefully via the stop marker.
pub const OK: i32 = 0;
/// Invalid input: malformed task file, bad config, unknown backend name.
pub const INVALID: i32 = 1;
/// The primary backend failed its availability probe under `--strict`.
pub const UNAVAILABLE: i32 = 2;
/// The run finished but at least one task failed all backends/retries.
pub const TASKS_FAILED: i32 = 3;
