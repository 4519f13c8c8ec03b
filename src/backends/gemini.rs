//! Gemini CLI adapter (streamed-event variant).
//!
//! Output is newline-delimited JSON events consumed as they arrive: `init`
//! carries the session id, assistant `message` events accumulate the final
//! text, `tool_use`/`tool_result` are progress only, and any `error` event
//! or a non-"success" terminal status fails the call regardless of the
//! process exit code. Lines that do not parse are progress noise and are
//! ignored.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::backends::{AgentBackend, GEMINI, InvokeRequest, probe_binary};
use crate::core::types::{RunResult, truncate_chars};
use crate::io::config::{Autonomy, RunConfig};
use crate::io::process::run_streaming;

const ERROR_SUMMARY_CHARS: usize = 700;

pub struct GeminiBackend {
    repo: PathBuf,
    autonomy: Autonomy,
    include_dirs: Vec<PathBuf>,
    model: Option<String>,
    extra_args: Vec<String>,
    output_limit_bytes: usize,
    verbose: bool,
}

impl GeminiBackend {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            repo: cfg.repo.clone(),
            autonomy: cfg.autonomy,
            include_dirs: cfg.include_dirs.clone(),
            model: cfg.file.gemini.model.clone(),
            extra_args: cfg.file.gemini.extra_args.clone(),
            output_limit_bytes: cfg.file.output_limit_bytes,
            verbose: cfg.verbose,
        }
    }

    fn command(&self, request: &InvokeRequest) -> Command {
        let mut cmd = Command::new("gemini");
        cmd.args(["--output-format", "stream-json"]);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        let approval = match self.autonomy {
            Autonomy::AutoEdit => "auto_edit",
            Autonomy::FullAuto | Autonomy::Yolo => "yolo",
        };
        cmd.args(["--approval-mode", approval]);
        for dir in &self.include_dirs {
            cmd.arg("--include-directories").arg(dir);
        }
        cmd.args(&self.extra_args);
        if let Some(session) = &request.resume_token {
            cmd.arg("--resume").arg(session);
        }
        cmd.arg(&request.prompt);
        cmd.current_dir(&self.repo);
        cmd
    }
}

impl AgentBackend for GeminiBackend {
    fn name(&self) -> &str {
        GEMINI
    }

    fn probe(&self) -> Result<()> {
        probe_binary(GEMINI, "gemini", &["--version"])
            .or_else(|_| probe_binary(GEMINI, "gemini", &["--help"]))
    }

    #[instrument(skip_all, fields(backend = GEMINI))]
    fn invoke(&self, request: &InvokeRequest) -> Result<RunResult> {
        let cmd = self.command(request);

        let mut summary = StreamSummary::default();
        let verbose = self.verbose;
        let mut on_line = |line: &str| {
            if verbose {
                println!("{line}");
            }
            summary.observe(line);
        };
        let output = run_streaming(
            cmd,
            None,
            self.output_limit_bytes,
            &request.log_path,
            Some(&mut on_line),
        )?;

        let ok = summary.ok(output.exit_code);
        // A stale session makes the CLI reject the whole invocation; forget
        // the token so the retry starts a fresh conversation.
        let drop_resume_token = !ok
            && request.resume_token.is_some()
            && output.combined.contains("INVALID_ARGUMENT");
        if drop_resume_token {
            warn!("resume token rejected (INVALID_ARGUMENT), dropping it");
        }
        debug!(
            ok,
            exit_code = output.exit_code,
            session = ?summary.session_id,
            errors = summary.errors.len(),
            "gemini finished"
        );

        fs::write(
            &request.last_message_path,
            format!("{}\n", summary.assistant_text().trim()),
        )
        .with_context(|| {
            format!(
                "write last message {}",
                request.last_message_path.display()
            )
        })?;

        Ok(summary.into_result(output.exit_code, output.combined, drop_resume_token))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Init {
        session_id: Option<String>,
    },
    Message {
        role: Option<String>,
        content: Option<String>,
    },
    ToolUse {
        tool_name: Option<String>,
    },
    ToolResult {
        status: Option<String>,
    },
    Error {
        message: Option<String>,
    },
    Result {
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Pure accumulator over the event stream; one instance per invocation.
#[derive(Debug, Default)]
struct StreamSummary {
    session_id: Option<String>,
    assistant_chunks: Vec<String>,
    errors: Vec<String>,
    result_status: Option<String>,
}

impl StreamSummary {
    fn observe(&mut self, line: &str) {
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            return;
        };
        match event {
            StreamEvent::Init { session_id } => {
                if let Some(sid) = session_id {
                    debug!(session_id = %sid, "stream opened");
                    self.session_id = Some(sid);
                }
            }
            StreamEvent::Message { role, content } => {
                if role.as_deref() == Some("assistant") {
                    self.assistant_chunks.push(content.unwrap_or_default());
                }
            }
            StreamEvent::ToolUse { tool_name } => {
                debug!(tool = tool_name.as_deref().unwrap_or("?"), "tool_use");
            }
            StreamEvent::ToolResult { status } => {
                debug!(status = status.as_deref().unwrap_or("?"), "tool_result");
            }
            StreamEvent::Error { message } => {
                let message = message.unwrap_or_else(|| line.to_string());
                warn!(message = %message, "error event");
                self.errors.push(message);
            }
            StreamEvent::Result { status } => {
                self.result_status = status.map(|s| s.to_ascii_lowercase());
            }
            StreamEvent::Unknown => {}
        }
    }

    fn ok(&self, exit_code: i32) -> bool {
        exit_code == 0
            && self.errors.is_empty()
            && self
                .result_status
                .as_deref()
                .is_none_or(|status| status == "success")
    }

    fn assistant_text(&self) -> String {
        self.assistant_chunks.concat().trim().to_string()
    }

    fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(truncate_chars(&self.errors.join("; "), ERROR_SUMMARY_CHARS))
    }

    /// Fold the accumulated stream into the uniform result.
    fn into_result(self, exit_code: i32, raw_output: String, drop_resume_token: bool) -> RunResult {
        let ok = self.ok(exit_code);
        let assistant_text = self.assistant_text();
        let error_summary = self.error_summary();
        RunResult {
            backend: GEMINI.to_string(),
            ok,
            exit_code,
            raw_output,
            assistant_text,
            resume_token: self.session_id,
            error_summary,
            drop_resume_token,
        }
    }
}
