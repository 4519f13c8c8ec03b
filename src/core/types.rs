//! Core data model: tasks, the cursor, per-task state, and run results.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One unit of work loaded from the task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Unique, stable identifier (file order defines processing order).
    pub id: String,
    /// Human-readable title; may be empty.
    pub title: String,
    /// Specification text handed to the implementing backend.
    pub spec: String,
    /// Optional per-task backend override (normalized name).
    pub backend_override: Option<String>,
}

/// Phase of the per-task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Implementation step (including the verify/fix loop).
    Main,
    /// Follow-up prompts after a successful implementation.
    After,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Main => write!(f, "main"),
            Phase::After => write!(f, "after"),
        }
    }
}

/// Durable pointer identifying the next unit of work.
///
/// Advances monotonically per task: MAIN, then AFTER(0..k), then the next
/// task's MAIN. The persisted cursor always denotes work not yet performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub task_index: usize,
    pub phase: Phase,
    pub after_index: usize,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            task_index: 0,
            phase: Phase::Main,
            after_index: 0,
        }
    }
}

impl Cursor {
    /// Cursor positioned at a given task's MAIN phase.
    pub fn at_task(task_index: usize) -> Self {
        Self {
            task_index,
            phase: Phase::Main,
            after_index: 0,
        }
    }

    /// Transition MAIN -> AFTER(0) for the current task.
    pub fn enter_after(self) -> Self {
        Self {
            task_index: self.task_index,
            phase: Phase::After,
            after_index: 0,
        }
    }

    /// Transition AFTER(i) -> AFTER(i+1).
    pub fn advance_after(self) -> Self {
        Self {
            after_index: self.after_index + 1,
            ..self
        }
    }

    /// Transition to the next task's MAIN phase.
    pub fn next_task(self) -> Self {
        Cursor::at_task(self.task_index + 1)
    }
}

/// Terminal-ish status of a task as recorded in persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    /// Implementation (and verification, if configured) succeeded.
    MainOk,
    /// All phases finished; follow-up failures do not clear this.
    Done,
    /// Every backend/retry combination was exhausted.
    Failed,
}

/// Append-only record of one backend invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// RFC3339 timestamp of the attempt.
    pub ts: String,
    pub phase: Phase,
    /// Index into the follow-up list for AFTER steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_index: Option<usize>,
    pub backend: String,
    pub ok: bool,
    pub exit_code: i32,
    /// Path to the raw step log, if one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Persisted per-task state: history, session tokens, and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskState {
    pub history: Vec<StepRecord>,
    /// Resume/session tokens keyed by the backend name that produced them.
    /// A token is only ever replayed against the same backend.
    pub sessions: BTreeMap<String, String>,
    pub last_ok_backend: Option<String>,
    pub status: TaskStatus,
}

/// The only value returned across the [`crate::backends::AgentBackend`] boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub backend: String,
    pub ok: bool,
    pub exit_code: i32,
    /// Combined (bounded) process output.
    pub raw_output: String,
    /// Assistant-visible text extracted from the backend's output format.
    pub assistant_text: String,
    /// Token allowing a later call to the same backend to continue the
    /// conversation, when the backend supports it.
    pub resume_token: Option<String>,
    pub error_summary: Option<String>,
    /// The backend judged its stored resume token invalid; the orchestrator
    /// must forget it for this task.
    pub drop_resume_token: bool,
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Fatal task-input error (malformed/duplicate ids, missing spec text).
///
/// Aborts the run immediately; `main` maps it to its own exit code.
#[derive(Debug, Clone)]
pub struct InputError(pub String);

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for InputError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advances_monotonically_through_phases() {
        let c = Cursor::default();
        assert_eq!(c.task_index, 0);
        assert_eq!(c.phase, Phase::Main);

        let c = c.enter_after();
        assert_eq!(c.phase, Phase::After);
        assert_eq!(c.after_index, 0);

        let c = c.advance_after().advance_after();
        assert_eq!(c.after_index, 2);
        assert_eq!(c.task_index, 0);

        let c = c.next_task();
        assert_eq!(c.task_index, 1);
        assert_eq!(c.phase, Phase::Main);
        assert_eq!(c.after_index, 0);
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Main).expect("json"), "\"main\"");
        assert_eq!(
            serde_json::to_string(&Phase::After).expect("json"),
            "\"after\""
        );
    }

    #[test]
    fn truncate_chars_is_boundary_safe() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        let cut = truncate_chars("héllo wörld", 6);
        assert_eq!(cut.chars().count(), 6);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn task_state_round_trips_sessions() {
        let mut state = TaskState::default();
        state
            .sessions
            .insert("claude".to_string(), "sess-1".to_string());
        state.last_ok_backend = Some("claude".to_string());

        let json = serde_json::to_string(&state).expect("serialize");
        let back: TaskState = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, state);
    }
}
