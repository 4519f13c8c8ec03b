//! Test-only helpers: scripted backends and verifiers plus a temp
//! workspace, for driving the run loop without real agent CLIs.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::backends::{AgentBackend, InvokeRequest};
use crate::core::types::{RunResult, Task};
use crate::io::config::{Autonomy, FileConfig, RunConfig, STATE_DIRNAME};
use crate::io::verify::{CheckFailure, VerifyRunner};

/// Create a deterministic task with default fields.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        spec: format!("{id} spec"),
        backend_override: None,
    }
}

pub fn ok_result(backend: &str, text: &str) -> RunResult {
    RunResult {
        backend: backend.to_string(),
        ok: true,
        exit_code: 0,
        raw_output: text.to_string(),
        assistant_text: text.to_string(),
        resume_token: None,
        error_summary: None,
        drop_resume_token: false,
    }
}

pub fn ok_with_session(backend: &str, token: &str) -> RunResult {
    RunResult {
        resume_token: Some(token.to_string()),
        ..ok_result(backend, "done")
    }
}

pub fn fail_result(backend: &str, exit_code: i32) -> RunResult {
    RunResult {
        backend: backend.to_string(),
        ok: false,
        exit_code,
        raw_output: String::new(),
        assistant_text: String::new(),
        resume_token: None,
        error_summary: Some("scripted failure".to_string()),
        drop_resume_token: false,
    }
}

/// One observed invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub resume_token: Option<String>,
}

/// Backend returning pre-scripted results in order. Clones share state, so
/// a test can keep one handle and register another.
#[derive(Clone)]
pub struct ScriptedBackend {
    name: String,
    inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
    results: Mutex<VecDeque<RunResult>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, results: Vec<RunResult>) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(ScriptedInner {
                results: Mutex::new(results.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.calls.lock().expect("calls lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.inner.results.lock().expect("results lock").len()
    }
}

impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn invoke(&self, request: &InvokeRequest) -> Result<RunResult> {
        self.inner
            .calls
            .lock()
            .expect("calls lock")
            .push(RecordedCall {
                prompt: request.prompt.clone(),
                resume_token: request.resume_token.clone(),
            });
        let result = self
            .inner
            .results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or_else(|| panic!("backend '{}' ran out of scripted results", self.name));
        Ok(result)
    }
}

/// Verifier returning pre-scripted failure sets; once the script is
/// exhausted every further round passes.
pub struct ScriptedVerify {
    enabled: bool,
    rounds: Mutex<VecDeque<Vec<CheckFailure>>>,
    runs: Mutex<usize>,
}

impl ScriptedVerify {
    pub fn disabled() -> Self {
        Self::new(false, Vec::new())
    }

    pub fn new(enabled: bool, rounds: Vec<Vec<CheckFailure>>) -> Self {
        Self {
            enabled,
            rounds: Mutex::new(rounds.into_iter().collect()),
            runs: Mutex::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock().expect("runs lock")
    }
}

impl VerifyRunner for ScriptedVerify {
    fn has_checks(&self) -> bool {
        self.enabled
    }

    fn run_checks(&self, _repo: &Path) -> Result<Vec<CheckFailure>> {
        *self.runs.lock().expect("runs lock") += 1;
        Ok(self
            .rounds
            .lock()
            .expect("rounds lock")
            .pop_front()
            .unwrap_or_default())
    }
}

pub fn check_failure(name: &str) -> CheckFailure {
    CheckFailure {
        name: name.to_string(),
        command: format!("run {name}"),
        output: format!("{name} failed"),
    }
}

/// Temp repo plus the resolved run configuration pointing at it.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        std::fs::create_dir_all(temp.path().join("repo")).expect("create repo dir");
        Self { temp }
    }

    pub fn repo(&self) -> std::path::PathBuf {
        self.temp.path().join("repo")
    }

    pub fn run_config(&self, primary: &str, fallbacks: &[&str]) -> RunConfig {
        let repo = self.repo();
        RunConfig {
            state_dir: repo.join(STATE_DIRNAME),
            repo,
            primary: primary.to_string(),
            fallbacks: fallbacks.iter().map(|f| f.to_string()).collect(),
            autonomy: Autonomy::FullAuto,
            include_dirs: Vec::new(),
            verbose: false,
            commit: false,
            file: FileConfig::default(),
        }
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
