//! Codex CLI adapter (process-exit variant).
//!
//! Success is judged purely by the process exit code. The final assistant
//! message is written by the CLI itself via `--output-last-message`; resume
//! continues the most recent conversation, so the token is the fixed marker
//! `"last"`.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::backends::{AgentBackend, CODEX, InvokeRequest, probe_binary};
use crate::core::types::{RunResult, truncate_chars};
use crate::io::config::{Autonomy, RunConfig};
use crate::io::process::run_streaming;

/// Fixed resume token: codex continues its latest conversation.
const RESUME_LAST: &str = "last";

pub struct CodexBackend {
    repo: PathBuf,
    autonomy: Autonomy,
    include_dirs: Vec<PathBuf>,
    model: Option<String>,
    extra_args: Vec<String>,
    output_limit_bytes: usize,
    verbose: bool,
}

impl CodexBackend {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            repo: cfg.repo.clone(),
            autonomy: cfg.autonomy,
            include_dirs: cfg.include_dirs.clone(),
            model: cfg.file.codex.model.clone(),
            extra_args: cfg.file.codex.extra_args.clone(),
            output_limit_bytes: cfg.file.output_limit_bytes,
            verbose: cfg.verbose,
        }
    }

    fn command(&self, request: &InvokeRequest) -> Command {
        let mut cmd = Command::new("codex");
        cmd.arg("exec");
        cmd.arg("--cd").arg(&self.repo);
        for dir in &self.include_dirs {
            cmd.arg("--add-dir").arg(dir);
        }
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        match self.autonomy {
            Autonomy::Yolo => {
                cmd.arg("--yolo");
            }
            Autonomy::AutoEdit | Autonomy::FullAuto => {
                cmd.args(["--sandbox", "workspace-write", "--ask-for-approval", "never"]);
            }
        }
        cmd.args(["--color", "never"]);
        cmd.arg("--output-last-message").arg(&request.last_message_path);
        cmd.args(&self.extra_args);
        if request.resume_token.is_some() {
            cmd.args(["resume", "--last", "-"]);
        } else {
            cmd.arg("-");
        }
        cmd
    }
}

impl AgentBackend for CodexBackend {
    fn name(&self) -> &str {
        CODEX
    }

    fn probe(&self) -> Result<()> {
        probe_binary(CODEX, "codex", &["login", "status"])
    }

    #[instrument(skip_all, fields(backend = CODEX))]
    fn invoke(&self, request: &InvokeRequest) -> Result<RunResult> {
        let cmd = self.command(request);

        let mut echo = |line: &str| println!("{line}");
        let output = run_streaming(
            cmd,
            Some(request.prompt.as_bytes()),
            self.output_limit_bytes,
            &request.log_path,
            self.verbose.then_some(&mut echo as &mut dyn FnMut(&str)),
        )?;

        let ok = output.success();
        let assistant_text = match fs::read_to_string(&request.last_message_path) {
            Ok(text) => text.trim().to_string(),
            Err(_) => output.combined.trim().to_string(),
        };
        debug!(ok, exit_code = output.exit_code, "codex finished");

        let error_summary = if ok {
            None
        } else {
            Some(truncate_chars(output.combined.trim(), 700))
        };
        Ok(RunResult {
            backend: CODEX.to_string(),
            ok,
            exit_code: output.exit_code,
            raw_output: output.combined,
            assistant_text,
            resume_token: ok.then(|| RESUME_LAST.to_string()),
            error_summary,
            drop_resume_token: false,
        })
    }
}
