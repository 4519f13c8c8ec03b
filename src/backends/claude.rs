//! Claude CLI adapter (JSON-result variant).
//!
//! The CLI prints one JSON object at the end of its output. `is_error` or
//! `subtype == "error"` marks the call failed even when the process exits
//! zero. A payload that cannot be parsed alongside a zero exit is still a
//! success; the raw output then stands in for the assistant message.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::backends::{AgentBackend, CLAUDE, InvokeRequest, probe_binary};
use crate::core::types::{RunResult, truncate_chars};
use crate::io::config::{Autonomy, RunConfig};
use crate::io::process::run_streaming;

const DEFAULT_ALLOWED_TOOLS: &str = "Read,Edit,Grep,Glob";
const ERROR_SUMMARY_CHARS: usize = 500;

pub struct ClaudeBackend {
    repo: PathBuf,
    autonomy: Autonomy,
    include_dirs: Vec<PathBuf>,
    model: Option<String>,
    allowed_tools: Option<String>,
    extra_args: Vec<String>,
    output_limit_bytes: usize,
    verbose: bool,
}

impl ClaudeBackend {
    pub fn new(cfg: &RunConfig) -> Self {
        Self {
            repo: cfg.repo.clone(),
            autonomy: cfg.autonomy,
            include_dirs: cfg.include_dirs.clone(),
            model: cfg.file.claude.model.clone(),
            allowed_tools: cfg.file.claude.allowed_tools.clone(),
            extra_args: cfg.file.claude.extra_args.clone(),
            output_limit_bytes: cfg.file.output_limit_bytes,
            verbose: cfg.verbose,
        }
    }

    fn command(&self, request: &InvokeRequest) -> Command {
        let mut cmd = Command::new("claude");
        cmd.args(["-p", "--output-format", "json"]);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        for dir in &self.include_dirs {
            cmd.arg("--add-dir").arg(dir);
        }
        match self.autonomy {
            Autonomy::Yolo | Autonomy::FullAuto => {
                cmd.arg("--dangerously-skip-permissions");
            }
            Autonomy::AutoEdit => {
                let allowed = self
                    .allowed_tools
                    .as_deref()
                    .unwrap_or(DEFAULT_ALLOWED_TOOLS);
                cmd.args(["--allowedTools", allowed, "--permission-mode", "acceptEdits"]);
            }
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

impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &str {
        CLAUDE
    }

    fn probe(&self) -> Result<()> {
        probe_binary(CLAUDE, "claude", &["--version"])
    }

    #[instrument(skip_all, fields(backend = CLAUDE))]
    fn invoke(&self, request: &InvokeRequest) -> Result<RunResult> {
        let cmd = self.command(request);

        let mut echo = |line: &str| println!("{line}");
        let output = run_streaming(
            cmd,
            None,
            self.output_limit_bytes,
            &request.log_path,
            self.verbose.then_some(&mut echo as &mut dyn FnMut(&str)),
        )?;

        let interpreted = interpret_output(output.exit_code, &output.combined);
        debug!(
            ok = interpreted.ok,
            exit_code = output.exit_code,
            session = ?interpreted.session_id,
            "claude finished"
        );
        if !interpreted.parsed && output.exit_code == 0 {
            warn!("no JSON payload found in claude output, treating exit 0 as success");
        }

        fs::write(
            &request.last_message_path,
            format!("{}\n", interpreted.assistant_text.trim()),
        )
        .with_context(|| {
            format!(
                "write last message {}",
                request.last_message_path.display()
            )
        })?;

        Ok(RunResult {
            backend: CLAUDE.to_string(),
            ok: interpreted.ok,
            exit_code: output.exit_code,
            raw_output: output.combined,
            assistant_text: interpreted.assistant_text,
            resume_token: interpreted.session_id,
            error_summary: interpreted.error_summary,
            drop_resume_token: false,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClaudePayload {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    subtype: Option<String>,
}

#[derive(Debug)]
struct Interpreted {
    ok: bool,
    parsed: bool,
    assistant_text: String,
    session_id: Option<String>,
    error_summary: Option<String>,
}

fn interpret_output(exit_code: i32, raw: &str) -> Interpreted {
    let mut out = Interpreted {
        ok: exit_code == 0,
        parsed: false,
        assistant_text: raw.trim().to_string(),
        session_id: None,
        error_summary: None,
    };

    let Some(payload) = trailing_json_object(raw) else {
        return out;
    };
    out.parsed = true;
    if let Some(result) = payload.result.filter(|r| !r.trim().is_empty()) {
        out.assistant_text = result.trim().to_string();
    }
    out.session_id = payload.session_id;
    if payload.is_error == Some(true) || payload.subtype.as_deref() == Some("error") {
        out.ok = false;
        out.error_summary = Some(truncate_chars(&out.assistant_text, ERROR_SUMMARY_CHARS));
    }
    out
}

/// Parse the last JSON object in the output, scanning `{` candidates from
/// the end so trailing tool noise after the payload does not defeat it.
fn trailing_json_object(raw: &str) -> Option<ClaudePayload> {
    let trimmed = raw.trim_end();
    for (idx, ch) in trimmed.char_indices().rev() {
        if ch != '{' {
            continue;
        }
        if let Ok(payload) = serde_json::from_str::<ClaudePayload>(&trimmed[idx..]) {
            return Some(payload);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::FileConfig;
    use crate::io::process::render_command;

    fn backend(autonomy: Autonomy) -> ClaudeBackend {
        let temp = std::env::temp_dir();
        let cfg = RunConfig {
            repo: temp.join("repo"),
            state_dir: temp.join("repo/.agentrun"),
            primary: "claude".to_string(),
            fallbacks: vec![],
            autonomy,
            include_dirs: vec![],
            verbose: false,
            commit: false,
            file: FileConfig::default(),
        };
        ClaudeBackend::new(&cfg)
    }

    fn request(resume: Option<&str>) -> InvokeRequest {
        let temp = std::env::temp_dir();
        InvokeRequest {
            prompt: "fix the tests".to_string(),
            resume_token: resume.map(str::to_string),
            log_path: temp.join("step.log"),
            last_message_path: temp.join("step.msg"),
        }
    }

    #[test]
    fn full_auto_skips_permissions() {
        let rendered = render_command(&backend(Autonomy::FullAuto).command(&request(None)));
        assert!(rendered.starts_with("claude -p --output-format json"));
        assert!(rendered.contains("--dangerously-skip-permissions"));
        assert!(rendered.ends_with("fix the tests"));
    }

    #[test]
    fn auto_edit_uses_the_tool_allow_list() {
        let rendered = render_command(&backend(Autonomy::AutoEdit).command(&request(None)));
        assert!(rendered.contains("--allowedTools Read,Edit,Grep,Glob"));
        assert!(rendered.contains("--permission-mode acceptEdits"));
        assert!(!rendered.contains("--dangerously-skip-permissions"));
    }

    #[test]
    fn config_extra_args_come_before_the_prompt() {
        let mut backend = backend(Autonomy::FullAuto);
        backend.extra_args = vec!["--fallback-model".to_string(), "sonnet".to_string()];
        let rendered = render_command(&backend.command(&request(None)));
        assert!(rendered.contains("--fallback-model sonnet"));
        assert!(rendered.ends_with("fix the tests"));
    }

    #[test]
    fn resume_session_is_passed_through() {
        let rendered =
            render_command(&backend(Autonomy::FullAuto).command(&request(Some("sess-9"))));
        assert!(rendered.contains("--resume sess-9"));
    }

    #[test]
    fn success_payload_yields_result_and_session() {
        let raw = r#"{"type":"result","subtype":"success","is_error":false,"result":"All done.","session_id":"abc-123"}"#;
        let out = interpret_output(0, raw);
        assert!(out.ok);
        assert_eq!(out.assistant_text, "All done.");
        assert_eq!(out.session_id.as_deref(), Some("abc-123"));
        assert!(out.error_summary.is_none());
    }

    #[test]
    fn error_payload_fails_despite_exit_zero() {
        let raw = r#"{"is_error":true,"result":"Credit balance too low","session_id":"abc"}"#;
        let out = interpret_output(0, raw);
        assert!(!out.ok);
        assert_eq!(
            out.error_summary.as_deref(),
            Some("Credit balance too low")
        );
    }

    #[test]
    fn error_subtype_fails_despite_exit_zero() {
        let raw = r#"{"subtype":"error","result":"hit max turns"}"#;
        let out = interpret_output(0, raw);
        assert!(!out.ok);
    }

    #[test]
    fn unparseable_output_with_exit_zero_is_still_success() {
        let out = interpret_output(0, "plain text, no json here");
        assert!(out.ok);
        assert!(!out.parsed);
        assert_eq!(out.assistant_text, "plain text, no json here");
    }

    #[test]
    fn payload_is_found_behind_leading_noise() {
        let raw = "some progress line\nanother {not json\n{\"result\":\"ok then\",\"session_id\":\"s1\"}";
        let out = interpret_output(0, raw);
        assert!(out.parsed);
        assert_eq!(out.assistant_text, "ok then");
        assert_eq!(out.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn nonzero_exit_fails_without_payload() {
        let out = interpret_output(2, "boom");
        assert!(!out.ok);
    }
}
