//! Sequential multi-backend coding-agent orchestrator.
//!
//! Drives a CSV task list through external agent CLIs (codex, claude,
//! gemini) with backend fallback, a verify/fix loop, follow-up prompts,
//! pause/stop control files, and crash-safe resumable state under
//! `.agentrun/` in the target repository.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use agentrun::backends::{
    BackendRegistry, BackendUnavailable, claude::ClaudeBackend,
    codex::CodexBackend, gemini::GeminiBackend, normalize_backend,
};
use agentrun::core::types::{Cursor, InputError, Task};
use agentrun::exit_codes;
use agentrun::io::config::{
    Autonomy, FileConfig, RunConfig, STATE_DIRNAME, load_config,
};
use agentrun::io::control::ControlFiles;
use agentrun::io::followups::load_followups;
use agentrun::io::git::Git;
use agentrun::io::handoff::HandoffWriter;
use agentrun::io::prompt::PromptBuilder;
use agentrun::io::state::StateStore;
use agentrun::io::tasks::load_tasks;
use agentrun::io::verify::ShellVerifyRunner;
use agentrun::run::{Orchestrator, RunStop};

#[derive(Parser)]
#[command(
    name = "agentrun",
    version,
    about = "Sequential multi-backend coding agent orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the task list, resuming from the persisted cursor on demand.
    Run(Box<RunArgs>),
    /// Validate the task file and report the resolved plan.
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the CSV task file.
    #[arg(long)]
    tasks: PathBuf,

    /// Target repository root.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Primary backend: codex, claude, or gemini.
    #[arg(long, default_value = "codex")]
    backend: String,

    /// Comma-separated fallback backends.
    #[arg(long, default_value = "claude,gemini")]
    fallback: String,

    /// Automation/approval posture.
    #[arg(long, value_enum, default_value_t = Autonomy::FullAuto)]
    autonomy: Autonomy,

    /// Codex model override.
    #[arg(long)]
    model_codex: Option<String>,

    /// Claude model override.
    #[arg(long)]
    model_claude: Option<String>,

    /// Gemini model override.
    #[arg(long)]
    model_gemini: Option<String>,

    /// Comma-separated extra directories exposed to backends.
    #[arg(long, default_value = "")]
    include_dirs: String,

    /// File of follow-up prompts, blank-line separated.
    #[arg(long)]
    after_file: Option<PathBuf>,

    /// Inline follow-up prompt (repeatable).
    #[arg(long = "after")]
    after: Vec<String>,

    /// Resume from the persisted cursor.
    #[arg(long)]
    resume: bool,

    /// Start from a specific task id (overrides --resume).
    #[arg(long)]
    start_task: Option<String>,

    /// Commit repository changes after each non-failed task.
    #[arg(long)]
    commit: bool,

    /// Fail immediately when the primary backend probe fails.
    #[arg(long)]
    strict: bool,

    /// Config file path (default: <repo>/.agentrun/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream backend output to stdout while running.
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Args)]
struct CheckArgs {
    /// Path to the CSV task file.
    #[arg(long)]
    tasks: PathBuf,

    /// Target repository root.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Primary backend.
    #[arg(long, default_value = "codex")]
    backend: String,

    /// Comma-separated fallback backends.
    #[arg(long, default_value = "claude,gemini")]
    fallback: String,

    /// Config file path (default: <repo>/.agentrun/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    agentrun::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("agentrun: {err:#}");
            classify_error(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(*args),
        Command::Check(args) => cmd_check(args),
    }
}

fn classify_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<BackendUnavailable>().is_some() {
        exit_codes::UNAVAILABLE
    } else {
        // Input, config, and internal errors all land here.
        exit_codes::INVALID
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let cfg = resolve_run_config(
        &args.repo,
        &args.backend,
        &args.fallback,
        args.config.as_deref(),
        |file| {
            file.codex.model = args.model_codex.clone().or(file.codex.model.take());
            file.claude.model = args.model_claude.clone().or(file.claude.model.take());
            file.gemini.model = args.model_gemini.clone().or(file.gemini.model.take());
        },
        args.autonomy,
        &args.include_dirs,
        args.verbose,
        args.commit,
    )?;

    let tasks = load_tasks(&args.tasks)?;
    if tasks.is_empty() {
        info!("no tasks found, nothing to do");
        return Ok(exit_codes::OK);
    }
    let followups = load_followups(
        args.after_file.as_deref(),
        cfg.file.after_dir.as_deref(),
        &args.after,
    )?;

    fs::create_dir_all(cfg.handoff_dir())
        .with_context(|| format!("create {}", cfg.handoff_dir().display()))?;
    fs::create_dir_all(cfg.state_dir.join("tasks"))
        .with_context(|| format!("create {}", cfg.state_dir.join("tasks").display()))?;

    let (registry, cfg) = probe_backends(cfg, args.strict)?;

    let mut store = StateStore::open(cfg.state_path())?;
    position_cursor(&mut store, &tasks, args.resume, args.start_task.as_deref())?;

    let controls = ControlFiles::new(
        &cfg.state_dir,
        Duration::from_secs(cfg.file.pause_poll_secs),
    );
    let verifier = ShellVerifyRunner::new(
        cfg.file.verify.checks.clone(),
        Duration::from_secs(cfg.file.check_timeout_secs),
        cfg.file.output_limit_bytes,
    );
    let handoff = HandoffWriter::new(cfg.handoff_dir(), cfg.file.assistant_excerpt_chars);
    let prompts = PromptBuilder::new();
    let git = Git::new(&cfg.repo);

    let orchestrator = Orchestrator::new(
        &cfg, &registry, &verifier, &controls, &handoff, &prompts, &git,
    );
    let outcome = orchestrator.run(&tasks, &followups, &mut store)?;

    info!(
        completed = outcome.tasks_completed,
        failed = outcome.tasks_failed,
        stopped = outcome.stop == RunStop::Stopped,
        "run finished"
    );
    match outcome.stop {
        RunStop::Stopped => Ok(exit_codes::OK),
        RunStop::Complete if outcome.tasks_failed > 0 => Ok(exit_codes::TASKS_FAILED),
        RunStop::Complete => Ok(exit_codes::OK),
    }
}

fn cmd_check(args: CheckArgs) -> Result<i32> {
    let cfg = resolve_run_config(
        &args.repo,
        &args.backend,
        &args.fallback,
        args.config.as_deref(),
        |_| {},
        Autonomy::FullAuto,
        "",
        false,
        false,
    )?;

    let tasks = load_tasks(&args.tasks)?;
    println!("tasks: {}", tasks.len());
    for task in &tasks {
        let backend = task.backend_override.as_deref().unwrap_or("(chain)");
        println!("  {} [{}] {}", task.id, backend, task.title);
    }
    println!("primary: {}", cfg.primary);
    println!("fallbacks: {}", cfg.fallbacks.join(", "));

    let registry = build_registry(&cfg);
    for name in registry.names() {
        let available = match registry.get(name)?.probe() {
            Ok(()) => "available".to_string(),
            Err(err) => format!("unavailable ({err:#})"),
        };
        println!("backend {name}: {available}");
    }
    Ok(exit_codes::OK)
}

#[allow(clippy::too_many_arguments)]
fn resolve_run_config(
    repo: &Path,
    backend: &str,
    fallback: &str,
    config: Option<&Path>,
    apply_models: impl FnOnce(&mut FileConfig),
    autonomy: Autonomy,
    include_dirs: &str,
    verbose: bool,
    commit: bool,
) -> Result<RunConfig> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("resolve repo root {}", repo.display()))?;
    let state_dir = repo.join(STATE_DIRNAME);

    let primary = normalize_backend(backend)?;
    let mut fallbacks = Vec::new();
    for name in split_csv_list(fallback) {
        let name = normalize_backend(&name)?;
        if name != primary && !fallbacks.contains(&name) {
            fallbacks.push(name);
        }
    }

    let config_path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| state_dir.join("config.toml"));
    let mut file = load_config(&config_path)?;
    apply_models(&mut file);

    let include_dirs = split_csv_list(include_dirs)
        .into_iter()
        .map(PathBuf::from)
        .collect();

    Ok(RunConfig {
        repo,
        state_dir,
        primary,
        fallbacks,
        autonomy,
        include_dirs,
        verbose,
        commit,
        file,
    })
}

fn build_registry(cfg: &RunConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Box::new(CodexBackend::new(cfg)));
    registry.register(Box::new(ClaudeBackend::new(cfg)));
    registry.register(Box::new(GeminiBackend::new(cfg)));
    registry
}

/// Probe the chain. An unavailable fallback is dropped with a warning; an
/// unavailable primary is fatal only under `--strict`, otherwise it stays
/// in the chain and each attempt records its exit-127 failure.
fn probe_backends(mut cfg: RunConfig, strict: bool) -> Result<(BackendRegistry, RunConfig)> {
    let registry = build_registry(&cfg);

    if let Err(err) = registry.get(&cfg.primary)?.probe() {
        if strict {
            return Err(err);
        }
        warn!(backend = %cfg.primary, err = %err, "primary backend unavailable, relying on fallbacks");
    }
    let mut kept = Vec::new();
    for name in &cfg.fallbacks {
        match registry.get(name)?.probe() {
            Ok(()) => kept.push(name.clone()),
            Err(err) => {
                warn!(backend = %name, err = %err, "dropping unavailable fallback");
            }
        }
    }
    cfg.fallbacks = kept;
    Ok((registry, cfg))
}

fn position_cursor(
    store: &mut StateStore,
    tasks: &[Task],
    resume: bool,
    start_task: Option<&str>,
) -> Result<()> {
    if let Some(target) = start_task {
        let index = tasks
            .iter()
            .position(|t| t.id == target)
            .ok_or_else(|| InputError(format!("start-task '{target}' not found in task file")))?;
        store.set_cursor(Cursor::at_task(index));
        store.persist()?;
    } else if !resume {
        store.set_cursor(Cursor::default());
        store.persist()?;
    }
    Ok(())
}

fn split_csv_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
