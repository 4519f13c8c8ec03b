//! End-to-end tests of the run loop with scripted backends and verifiers.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use agentrun::backends::BackendRegistry;
use agentrun::core::types::{Cursor, Phase, TaskStatus};
use agentrun::io::config::RunConfig;
use agentrun::io::control::{ControlFiles, PAUSE_FILE, STOP_FILE};
use agentrun::io::followups::Followup;
use agentrun::io::git::Git;
use agentrun::io::handoff::HandoffWriter;
use agentrun::io::prompt::PromptBuilder;
use agentrun::io::state::StateStore;
use agentrun::io::verify::VerifyRunner;
use agentrun::run::{Orchestrator, RunOutcome, RunStop};
use agentrun::test_support::{
    ScriptedBackend, ScriptedVerify, TestWorkspace, check_failure, fail_result, ok_result,
    ok_with_session, task,
};

fn followup(text: &str) -> Followup {
    Followup {
        label: format!("inline:{text}"),
        text: text.to_string(),
    }
}

fn registry_of(backends: &[&ScriptedBackend]) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for backend in backends {
        registry.register(Box::new((*backend).clone()));
    }
    registry
}

fn drive(
    cfg: &RunConfig,
    registry: &BackendRegistry,
    verifier: &dyn VerifyRunner,
    store: &mut StateStore,
    tasks: &[agentrun::core::types::Task],
    followups: &[Followup],
) -> RunOutcome {
    let controls = ControlFiles::new(&cfg.state_dir, Duration::from_millis(25));
    let handoff = HandoffWriter::new(cfg.handoff_dir(), cfg.file.assistant_excerpt_chars);
    let prompts = PromptBuilder::new();
    let git = Git::new(&cfg.repo);
    let orchestrator =
        Orchestrator::new(cfg, registry, verifier, &controls, &handoff, &prompts, &git);
    orchestrator
        .run(tasks, followups, store)
        .expect("run loop")
}

#[test]
fn fallback_failure_then_success_records_both_attempts() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &["claude"]);
    let codex = ScriptedBackend::new("codex", vec![fail_result("codex", 1)]);
    let claude = ScriptedBackend::new("claude", vec![ok_result("claude", "done")]);
    let registry = registry_of(&[&codex, &claude]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &[]);

    assert_eq!(outcome.stop, RunStop::Complete);
    assert_eq!(outcome.tasks_completed, 1);
    assert_eq!(outcome.tasks_failed, 0);

    let state = store.task("T1").expect("task state");
    assert_eq!(state.status, TaskStatus::Done);
    assert_eq!(state.history.len(), 2);
    assert_eq!(state.history[0].backend, "codex");
    assert!(!state.history[0].ok);
    assert_eq!(state.history[1].backend, "claude");
    assert!(state.history[1].ok);
    assert_eq!(state.last_ok_backend.as_deref(), Some("claude"));
}

#[test]
fn all_backends_failing_marks_task_failed_and_continues() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &["claude"]);
    let codex = ScriptedBackend::new(
        "codex",
        vec![
            fail_result("codex", 1),
            ok_result("codex", "second task done"),
            ok_result("codex", "followup done"),
        ],
    );
    let claude = ScriptedBackend::new("claude", vec![fail_result("claude", 1)]);
    let registry = registry_of(&[&codex, &claude]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1"), task("T2")];
    // Follow-ups run only for tasks whose implementation succeeded.
    let followups = vec![followup("polish the result")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    assert_eq!(outcome.tasks_failed, 1);
    assert_eq!(outcome.tasks_completed, 1);
    assert_eq!(store.task("T1").expect("t1").status, TaskStatus::Failed);
    assert_eq!(store.task("T2").expect("t2").status, TaskStatus::Done);
    // T1 main (failed), T2 main, T2 follow-up. No follow-up for T1.
    assert_eq!(codex.calls().len(), 3);
    assert_eq!(codex.remaining(), 0);
}

#[test]
fn verification_failure_is_fixed_once_then_passes() {
    let ws = TestWorkspace::new();
    let mut cfg = ws.run_config("codex", &[]);
    cfg.file.retries = 2;
    let codex = ScriptedBackend::new(
        "codex",
        vec![ok_result("codex", "implemented"), ok_result("codex", "fixed")],
    );
    let registry = registry_of(&[&codex]);
    // First round fails, second round (after the fix) passes.
    let verifier = ScriptedVerify::new(true, vec![vec![check_failure("test")], vec![]]);
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &[]);

    assert_eq!(outcome.tasks_completed, 1);
    assert_eq!(verifier.runs(), 2);
    let calls = codex.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].prompt.contains("verification checks below failed")
        || calls[1].prompt.contains("Check: test"));
    assert_eq!(store.task("T1").expect("t1").status, TaskStatus::Done);
}

#[test]
fn fix_budget_exhaustion_fails_the_task() {
    let ws = TestWorkspace::new();
    let mut cfg = ws.run_config("codex", &["claude"]);
    cfg.file.retries = 1;
    let codex = ScriptedBackend::new(
        "codex",
        vec![ok_result("codex", "implemented"), ok_result("codex", "fix try")],
    );
    let claude = ScriptedBackend::new("claude", vec![ok_result("claude", "fix try")]);
    let registry = registry_of(&[&codex, &claude]);
    // Never passes.
    let verifier = ScriptedVerify::new(
        true,
        vec![
            vec![check_failure("test")],
            vec![check_failure("test")],
            vec![check_failure("test")],
        ],
    );
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &[]);

    assert_eq!(outcome.tasks_failed, 1);
    assert_eq!(store.task("T1").expect("t1").status, TaskStatus::Failed);
    // One fix attempt per backend, then exhaustion.
    assert_eq!(codex.calls().len(), 2);
    assert_eq!(claude.calls().len(), 1);
}

#[test]
fn failed_followup_does_not_abort_remaining_followups() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &[]);
    let codex = ScriptedBackend::new(
        "codex",
        vec![
            ok_result("codex", "main done"),
            fail_result("codex", 1),
            ok_result("codex", "second followup done"),
        ],
    );
    let registry = registry_of(&[&codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let followups = vec![followup("first"), followup("second")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    assert_eq!(outcome.tasks_completed, 1);
    let state = store.task("T1").expect("t1");
    assert_eq!(state.status, TaskStatus::Done);
    let after_records: Vec<_> = state
        .history
        .iter()
        .filter(|r| r.phase == Phase::After)
        .collect();
    assert_eq!(after_records.len(), 2);
    assert_eq!(after_records[0].after_index, Some(0));
    assert!(!after_records[0].ok);
    assert_eq!(after_records[1].after_index, Some(1));
    assert!(after_records[1].ok);
}

#[test]
fn session_token_is_replayed_only_against_its_backend() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("claude", &["codex"]);
    let claude = ScriptedBackend::new(
        "claude",
        vec![
            ok_with_session("claude", "sess-1"),
            ok_with_session("claude", "sess-2"),
        ],
    );
    let codex = ScriptedBackend::new("codex", vec![]);
    let registry = registry_of(&[&claude, &codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let followups = vec![followup("continue")];
    drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    let calls = claude.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].resume_token, None);
    assert_eq!(calls[1].resume_token.as_deref(), Some("sess-1"));
    assert!(codex.calls().is_empty());
    assert_eq!(
        store
            .task("T1")
            .expect("t1")
            .sessions
            .get("claude")
            .map(String::as_str),
        Some("sess-2")
    );
}

#[test]
fn dropped_resume_token_is_forgotten() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("gemini", &[]);
    let mut rejected = fail_result("gemini", 1);
    rejected.drop_resume_token = true;
    let gemini = ScriptedBackend::new(
        "gemini",
        vec![
            ok_with_session("gemini", "stale"),
            rejected,
            ok_result("gemini", "fresh run"),
        ],
    );
    let registry = registry_of(&[&gemini]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let followups = vec![followup("first"), followup("second")];
    drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    let calls = gemini.calls();
    assert_eq!(calls.len(), 3);
    // Follow-up one replays the stale token and is rejected.
    assert_eq!(calls[1].resume_token.as_deref(), Some("stale"));
    // Follow-up two starts cold because the token was dropped.
    assert_eq!(calls[2].resume_token, None);
}

#[test]
fn stop_marker_ends_the_run_between_tasks() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &[]);
    let codex = ScriptedBackend::new("codex", vec![ok_result("codex", "t1 done")]);
    let registry = registry_of(&[&codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    // Stop marker present before the run even starts task one.
    fs::create_dir_all(&cfg.state_dir).expect("state dir");
    fs::write(cfg.state_dir.join(STOP_FILE), "").expect("write stop");

    let tasks = vec![task("T1"), task("T2")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &[]);

    assert_eq!(outcome.stop, RunStop::Stopped);
    assert_eq!(outcome.tasks_completed, 0);
    // Nothing ran; the cursor still points at the first task.
    assert!(codex.calls().is_empty());
    assert_eq!(store.cursor(), Cursor::default());
}

#[test]
fn pause_marker_delays_the_run_until_removed() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &[]);
    let codex = ScriptedBackend::new("codex", vec![ok_result("codex", "done")]);
    let registry = registry_of(&[&codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    fs::create_dir_all(&cfg.state_dir).expect("state dir");
    let pause = cfg.state_dir.join(PAUSE_FILE);
    fs::write(&pause, "").expect("write pause");
    let remover = thread::spawn({
        let pause = pause.clone();
        move || {
            thread::sleep(Duration::from_millis(120));
            fs::remove_file(pause).expect("remove pause");
        }
    });

    let tasks = vec![task("T1")];
    let started = Instant::now();
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &[]);
    remover.join().expect("join remover");

    assert_eq!(outcome.stop, RunStop::Complete);
    assert_eq!(outcome.tasks_completed, 1);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn resume_mid_after_skips_main_and_earlier_followups() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &[]);
    // Only the second follow-up is scripted; touching MAIN or the first
    // follow-up would exhaust the script and panic.
    let codex = ScriptedBackend::new("codex", vec![ok_result("codex", "resumed")]);
    let registry = registry_of(&[&codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");
    store.set_cursor(Cursor {
        task_index: 0,
        phase: Phase::After,
        after_index: 1,
    });
    store.persist().expect("persist");

    let tasks = vec![task("T1")];
    let followups = vec![followup("first"), followup("second")];
    let outcome = drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    assert_eq!(outcome.tasks_completed, 1);
    let calls = codex.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].prompt.contains("second"));
    assert_eq!(store.cursor(), Cursor::at_task(1));
}

#[test]
fn placeholders_are_substituted_per_task() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &[]);
    let codex = ScriptedBackend::new(
        "codex",
        vec![ok_result("codex", "main"), ok_result("codex", "after")],
    );
    let registry = registry_of(&[&codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let mut t = task("T2-1");
    t.title = String::new();
    let tasks = vec![t];
    let followups = vec![followup("Prepare {TASK_ID_NEXT} after {TASK_ID}")];
    drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    let calls = codex.calls();
    assert!(calls[1].prompt.contains("Prepare T2-2 after T2-1"));
}

#[test]
fn handoff_is_rewritten_after_each_step() {
    let ws = TestWorkspace::new();
    let cfg = ws.run_config("codex", &[]);
    let codex = ScriptedBackend::new(
        "codex",
        vec![ok_result("codex", "main message"), ok_result("codex", "after message")],
    );
    let registry = registry_of(&[&codex]);
    let verifier = ScriptedVerify::disabled();
    let mut store = StateStore::open(cfg.state_path()).expect("open state");

    let tasks = vec![task("T1")];
    let followups = vec![followup("polish")];
    drive(&cfg, &registry, &verifier, &mut store, &tasks, &followups);

    let handoff = fs::read_to_string(cfg.handoff_dir().join("T1.md")).expect("read handoff");
    assert!(handoff.contains("after message"));
    assert!(!handoff.contains("main message"));
}
