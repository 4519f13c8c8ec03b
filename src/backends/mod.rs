//! Agent backend adapters.
//!
//! Each backend wraps one external agent CLI behind [`AgentBackend`]: build
//! the command line for a prompt, run it with bounded capture, and map the
//! process result into a uniform [`RunResult`]. The run loop never sees
//! backend-specific wire formats.

pub mod claude;
pub mod codex;
pub mod gemini;

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;

use crate::core::types::{InputError, RunResult};

pub const CODEX: &str = "codex";
pub const CLAUDE: &str = "claude";
pub const GEMINI: &str = "gemini";

/// One step of agent work: a prompt, an optional resume token, and where to
/// write the raw log.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    /// Opaque session token from a previous [`RunResult`] of the same
    /// backend and task. Shape is backend-private.
    pub resume_token: Option<String>,
    pub log_path: PathBuf,
    /// Where the backend (or the adapter) leaves the final assistant
    /// message as plain text.
    pub last_message_path: PathBuf,
}

/// Adapter seam for one external agent CLI.
pub trait AgentBackend {
    fn name(&self) -> &str;

    /// Cheap availability check (binary present and answering).
    fn probe(&self) -> Result<()>;

    /// Run one prompt to completion. Agent-level failure is an `Ok` result
    /// with `ok == false`; `Err` is reserved for runner-side faults.
    fn invoke(&self, request: &InvokeRequest) -> Result<RunResult>;
}

/// Ordered set of constructed backends, looked up by canonical name.
pub struct BackendRegistry {
    backends: Vec<Box<dyn AgentBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn register(&mut self, backend: Box<dyn AgentBackend>) {
        self.backends.push(backend);
    }

    pub fn get(&self, name: &str) -> Result<&dyn AgentBackend> {
        self.backends
            .iter()
            .map(Box::as_ref)
            .find(|b| b.name() == name)
            .ok_or_else(|| anyhow!("no backend registered under '{name}'"))
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a user-supplied backend name or alias to its canonical name.
pub fn normalize_backend(name: &str) -> Result<String> {
    let canonical = match name.trim().to_ascii_lowercase().as_str() {
        "codex" | "openai" | "oai" => CODEX,
        "claude" | "claude-code" | "anthropic" => CLAUDE,
        "gemini" | "google" => GEMINI,
        other => {
            return Err(InputError(format!(
                "unknown backend '{other}' (expected codex, claude, or gemini)"
            ))
            .into());
        }
    };
    Ok(canonical.to_string())
}

/// A backend whose CLI is missing or unresponsive.
///
/// Carried through anyhow and downcast at the top level to pick the
/// availability exit code.
#[derive(Debug)]
pub struct BackendUnavailable {
    pub backend: String,
    pub detail: String,
}

impl fmt::Display for BackendUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend '{}' unavailable: {}", self.backend, self.detail)
    }
}

impl Error for BackendUnavailable {}

/// Shared probe: the given invocation must exit zero within the budget.
pub(crate) fn probe_binary(backend: &str, bin: &str, args: &[&str]) -> Result<()> {
    let spawned = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let rendered = format!("{bin} {}", args.join(" "));
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackendUnavailable {
                backend: backend.to_string(),
                detail: format!("binary '{bin}' not found"),
            }
            .into());
        }
        Err(err) => return Err(err).with_context(|| format!("spawn {rendered}")),
    };

    let status = match child
        .wait_timeout(Duration::from_secs(30))
        .with_context(|| format!("wait for {rendered}"))?
    {
        Some(status) => status,
        None => {
            child.kill().context("kill probe")?;
            child.wait().context("reap probe")?;
            return Err(BackendUnavailable {
                backend: backend.to_string(),
                detail: format!("'{rendered}' timed out"),
            }
            .into());
        }
    };

    if !status.success() {
        return Err(BackendUnavailable {
            backend: backend.to_string(),
            detail: format!("'{rendered}' exited with {}", status.code().unwrap_or(-1)),
        }
        .into());
    }
    Ok(())
}
