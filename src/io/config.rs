//! Runner configuration: a TOML file merged with CLI flags into one
//! explicit [`RunConfig`] value threaded through every component.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::verify::VerifyCheck;

/// Directory under the target repository holding all runner-owned files.
pub const STATE_DIRNAME: &str = ".agentrun";

/// Human-edited configuration (TOML).
///
/// Missing fields default to sensible values; the file itself is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Fix attempts per backend before falling through the chain.
    pub retries: u32,

    /// Seconds between pause-marker polls.
    pub pause_poll_secs: u64,

    /// Byte ceiling for captured backend output (oldest lines dropped).
    pub output_limit_bytes: usize,

    /// Truncate the assistant excerpt in handoff files to this many chars.
    pub assistant_excerpt_chars: usize,

    /// Wall-clock budget per verification check.
    pub check_timeout_secs: u64,

    /// Re-run verification (and the fix loop) after the follow-up prompts.
    pub verify_after_followups: bool,

    /// Optional directory of `.md`/`.txt` follow-up prompts, in name order.
    pub after_dir: Option<PathBuf>,

    pub verify: VerifyConfig,
    pub codex: CodexConfig,
    pub claude: ClaudeConfig,
    pub gemini: GeminiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VerifyConfig {
    /// Ordered, named checks. A check with an empty command is skipped.
    pub checks: Vec<VerifyCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CodexConfig {
    pub model: Option<String>,
    /// Extra flags appended verbatim to every invocation.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClaudeConfig {
    pub model: Option<String>,
    /// Tool allow-list used outside yolo/full-auto postures.
    pub allowed_tools: Option<String>,
    /// Extra flags appended verbatim to every invocation.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GeminiConfig {
    pub model: Option<String>,
    /// Extra flags appended verbatim to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            pause_poll_secs: 5,
            output_limit_bytes: 5_000_000,
            assistant_excerpt_chars: 4_000,
            check_timeout_secs: 30 * 60,
            verify_after_followups: false,
            after_dir: None,
            verify: VerifyConfig::default(),
            codex: CodexConfig::default(),
            claude: ClaudeConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl FileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pause_poll_secs == 0 {
            return Err(anyhow!("pause_poll_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.check_timeout_secs == 0 {
            return Err(anyhow!("check_timeout_secs must be > 0"));
        }
        for check in &self.verify.checks {
            if check.name.trim().is_empty() {
                return Err(anyhow!("verify check with empty name"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FileConfig::default()`.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        let cfg = FileConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FileConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FileConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Automation/approval posture passed down to every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Autonomy {
    /// Edits auto-approved, everything else gated.
    AutoEdit,
    /// Sandboxed full automation.
    #[default]
    FullAuto,
    /// No sandbox, no approval gates.
    Yolo,
}

/// Fully resolved run parameters, constructed once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Target repository root backends operate on.
    pub repo: PathBuf,
    /// `.agentrun` directory under the repo.
    pub state_dir: PathBuf,
    pub primary: String,
    /// Deduplicated fallback chain, primary excluded.
    pub fallbacks: Vec<String>,
    pub autonomy: Autonomy,
    /// Extra directories exposed to backends.
    pub include_dirs: Vec<PathBuf>,
    /// Stream backend output lines to stdout while running.
    pub verbose: bool,
    /// Commit repository changes after each non-failed task.
    pub commit: bool,
    pub file: FileConfig,
}

impl RunConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn handoff_dir(&self) -> PathBuf {
        self.state_dir.join("handoff")
    }

    pub fn task_log_dir(&self, task_id: &str) -> PathBuf {
        self.state_dir.join("tasks").join(task_id)
    }
}
