//! Git adapter for handoff snapshots and optional per-task commits.
//!
//! Snapshot queries are tolerant: a missing `git` binary or a non-repo
//! target degrades to placeholder text instead of failing the run.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Human-readable worktree summary embedded in handoff files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSnapshot {
    pub branch: String,
    /// `git status --porcelain=v1`, or "(clean)".
    pub status: String,
    /// `git diff --stat`, or "(no diff)".
    pub diffstat: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Best-effort worktree summary; never fails.
    #[instrument(skip_all)]
    pub fn snapshot(&self) -> GitSnapshot {
        let branch = self
            .try_capture(&["rev-parse", "--abbrev-ref", "HEAD"])
            .unwrap_or_else(|| "(unknown)".to_string());
        let status = self
            .try_capture(&["status", "--porcelain=v1"])
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "(clean)".to_string());
        let diffstat = self
            .try_capture(&["diff", "--stat"])
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "(no diff)".to_string());
        GitSnapshot {
            branch,
            status,
            diffstat,
        }
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn try_capture(&self, args: &[&str]) -> Option<String> {
        let output = self.run(args).ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
