//! Verification checks: named shell commands run after a task's main work.
//!
//! Checks run in configured order and all of them run even after a failure,
//! so the fix prompt can list every broken check at once.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// One named verification command from config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyCheck {
    pub name: String,
    /// Shell command line; an empty command marks the check disabled.
    #[serde(default)]
    pub command: String,
}

/// A failed check with its captured output, fed into the fix prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckFailure {
    pub name: String,
    pub command: String,
    pub output: String,
}

/// Seam for the run loop; tests substitute a scripted implementation.
pub trait VerifyRunner {
    fn has_checks(&self) -> bool;
    fn run_checks(&self, repo: &Path) -> Result<Vec<CheckFailure>>;
}

/// Runs each check through `bash -lc` in the target repository.
pub struct ShellVerifyRunner {
    checks: Vec<VerifyCheck>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ShellVerifyRunner {
    pub fn new(checks: Vec<VerifyCheck>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            checks,
            timeout,
            output_limit_bytes,
        }
    }
}

impl VerifyRunner for ShellVerifyRunner {
    fn has_checks(&self) -> bool {
        self.checks.iter().any(|c| !c.command.trim().is_empty())
    }

    #[instrument(skip_all, fields(repo = %repo.display()))]
    fn run_checks(&self, repo: &Path) -> Result<Vec<CheckFailure>> {
        let mut failures = Vec::new();
        for check in &self.checks {
            if check.command.trim().is_empty() {
                debug!(name = %check.name, "check has no command, skipped");
                continue;
            }
            match run_check(check, repo, self.timeout, self.output_limit_bytes)? {
                None => info!(name = %check.name, "check passed"),
                Some(failure) => {
                    warn!(name = %failure.name, "check failed");
                    failures.push(failure);
                }
            }
        }
        Ok(failures)
    }
}

fn run_check(
    check: &VerifyCheck,
    repo: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<Option<CheckFailure>> {
    let mut child = Command::new("bash")
        .arg("-lc")
        .arg(&check.command)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn check '{}'", check.name))?;

    let status = match child
        .wait_timeout(timeout)
        .with_context(|| format!("wait for check '{}'", check.name))?
    {
        Some(status) => status,
        None => {
            child
                .kill()
                .with_context(|| format!("kill timed-out check '{}'", check.name))?;
            child.wait().context("reap timed-out check")?;
            return Ok(Some(CheckFailure {
                name: check.name.clone(),
                command: check.command.clone(),
                output: format!("check timed out after {}s", timeout.as_secs()),
            }));
        }
    };

    let output = child
        .wait_with_output()
        .with_context(|| format!("collect output of check '{}'", check.name))?;
    if status.success() {
        return Ok(None);
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim_end());
    }
    let combined = tail_bytes(&combined, output_limit_bytes);

    Ok(Some(CheckFailure {
        name: check.name.clone(),
        command: check.command.clone(),
        output: combined,
    }))
}

/// Keep the tail of the output; the end of a failing check is usually the
/// informative part.
fn tail_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("[{} bytes truncated]\n{}", start, &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(checks: Vec<(&str, &str)>) -> ShellVerifyRunner {
        ShellVerifyRunner::new(
            checks
                .into_iter()
                .map(|(name, command)| VerifyCheck {
                    name: name.to_string(),
                    command: command.to_string(),
                })
                .collect(),
            Duration::from_secs(10),
            10_000,
        )
    }

    #[test]
    fn passing_checks_yield_no_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner(vec![("true", "true")]);
        let failures = runner.run_checks(temp.path()).expect("run");
        assert!(failures.is_empty());
    }

    #[test]
    fn all_checks_run_even_after_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner(vec![
            ("first", "echo broken >&2; exit 1"),
            ("second", "exit 2"),
        ]);
        let failures = runner.run_checks(temp.path()).expect("run");
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].name, "first");
        assert!(failures[0].output.contains("broken"));
        assert_eq!(failures[1].name, "second");
    }

    #[test]
    fn empty_command_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner(vec![("disabled", "  "), ("real", "exit 1")]);
        assert!(runner.has_checks());
        let failures = runner.run_checks(temp.path()).expect("run");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "real");
    }

    #[test]
    fn no_checks_reported_when_all_disabled() {
        let runner = runner(vec![("disabled", "")]);
        assert!(!runner.has_checks());
    }

    #[test]
    fn tail_bytes_keeps_the_end() {
        let out = tail_bytes("aaaabbbb", 4);
        assert!(out.ends_with("bbbb"));
        assert!(out.contains("truncated"));
    }
}
