//! Handoff files: the human-readable summary of the latest step per task.
//!
//! Rewritten after every backend invocation so a different backend (or a
//! human) picking up the task always sees the latest assistant message and
//! worktree state. Verification results are appended between rewrites.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use tracing::debug;

use crate::core::types::{Phase, Task, truncate_chars};
use crate::io::git::GitSnapshot;
use crate::io::verify::CheckFailure;

/// Everything one rewrite needs to know about the step just taken.
#[derive(Debug)]
pub struct HandoffStep<'a> {
    pub task: &'a Task,
    pub phase: Phase,
    /// Step label for the header, e.g. "main", "fix2", "after1".
    pub step_name: &'a str,
    pub backend: &'a str,
    pub ok: bool,
    pub exit_code: i32,
    pub log_path: Option<&'a Path>,
    pub assistant_text: &'a str,
}

pub struct HandoffWriter {
    dir: PathBuf,
    excerpt_chars: usize,
}

impl HandoffWriter {
    pub fn new(dir: impl Into<PathBuf>, excerpt_chars: usize) -> Self {
        Self {
            dir: dir.into(),
            excerpt_chars,
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.md"))
    }

    /// Replace the task's handoff with a summary of the given step.
    pub fn write_step(&self, step: &HandoffStep<'_>, snapshot: &GitSnapshot) -> Result<PathBuf> {
        let path = self.path_for(&step.task.id);
        let updated = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let title = if step.task.title.trim().is_empty() {
            "(none)"
        } else {
            step.task.title.trim()
        };
        let status = if step.ok { "success" } else { "failed" };
        let log = step
            .log_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string());
        let excerpt = truncate_chars(step.assistant_text.trim(), self.excerpt_chars);
        let excerpt = if excerpt.is_empty() {
            "(no message)"
        } else {
            excerpt.as_str()
        }
        .to_string();

        let body = format!(
            "# Handoff: {id}\n\
             \n\
             - Title: {title}\n\
             - Phase: {phase} ({step_name})\n\
             - Backend: {backend}\n\
             - Status: {status} (exit={exit_code})\n\
             - Log: {log}\n\
             - Branch: {branch}\n\
             - Updated: {updated}\n\
             \n\
             ## Latest agent message (truncated)\n\
             {excerpt}\n\
             \n\
             ## Git status (porcelain)\n\
             {git_status}\n\
             \n\
             ## Git diff --stat\n\
             {diffstat}\n",
            id = step.task.id,
            phase = step.phase,
            step_name = step.step_name,
            backend = step.backend,
            exit_code = step.exit_code,
            branch = snapshot.branch,
            git_status = snapshot.status,
            diffstat = snapshot.diffstat,
        );

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create handoff dir {}", self.dir.display()))?;
        fs::write(&path, body).with_context(|| format!("write handoff {}", path.display()))?;
        debug!(path = %path.display(), "handoff rewritten");
        Ok(path)
    }

    /// Append the failing checks so the fix prompt's pointer to the handoff
    /// carries the transcripts.
    pub fn append_verify_failures(
        &self,
        task_id: &str,
        failures: &[CheckFailure],
    ) -> Result<()> {
        let mut section = String::from("\n## Verification failures\n");
        for failure in failures {
            section.push_str(&format!(
                "\n### {name}\nCommand: `{command}`\n```\n{output}\n```\n",
                name = failure.name,
                command = failure.command,
                output = failure.output.trim_end(),
            ));
        }
        self.append(task_id, &section)
    }

    pub fn append_verify_pass(&self, task_id: &str) -> Result<()> {
        self.append(task_id, "\n## Verification\nAll checks passed.\n")
    }

    fn append(&self, task_id: &str, section: &str) -> Result<()> {
        let path = self.path_for(task_id);
        let mut body = fs::read_to_string(&path).unwrap_or_default();
        body.push_str(section);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create handoff dir {}", self.dir.display()))?;
        fs::write(&path, body).with_context(|| format!("append handoff {}", path.display()))?;
        Ok(())
    }
}
