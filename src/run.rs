//! The run loop: drives each task through MAIN, the verify/fix loop, and
//! the AFTER follow-ups, persisting the cursor around every step.
//!
//! All side effects go through the seams handed to [`Orchestrator::new`],
//! so tests drive the whole state machine with scripted backends and
//! verifiers.

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat, Utc};
use tracing::{info, instrument, warn};

use crate::backends::{BackendRegistry, InvokeRequest};
use crate::core::order::{after_order, fix_order, main_order};
use crate::core::taskid::apply_placeholders;
use crate::core::types::{Phase, RunResult, StepRecord, Task, TaskStatus};
use crate::io::config::RunConfig;
use crate::io::control::{ControlDecision, ControlFiles};
use crate::io::followups::Followup;
use crate::io::git::Git;
use crate::io::handoff::{HandoffStep, HandoffWriter};
use crate::io::prompt::PromptBuilder;
use crate::io::state::StateStore;
use crate::io::verify::VerifyRunner;

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// Every task was processed.
    Complete,
    /// A stop marker ended the run at a checkpoint; state is persisted and
    /// the cursor points at the next unit of work.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub stop: RunStop,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
}

/// Per-task result inside the loop.
enum TaskFlow {
    Stopped,
    Advanced { failed: bool },
}

/// Fix-loop result.
enum FixOutcome {
    Verified,
    Stopped,
    Exhausted,
}

pub struct Orchestrator<'a> {
    cfg: &'a RunConfig,
    registry: &'a BackendRegistry,
    verifier: &'a dyn VerifyRunner,
    controls: &'a ControlFiles,
    handoff: &'a HandoffWriter,
    prompts: &'a PromptBuilder,
    git: &'a Git,
}

impl<'a> Orchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &'a RunConfig,
        registry: &'a BackendRegistry,
        verifier: &'a dyn VerifyRunner,
        controls: &'a ControlFiles,
        handoff: &'a HandoffWriter,
        prompts: &'a PromptBuilder,
        git: &'a Git,
    ) -> Self {
        Self {
            cfg,
            registry,
            verifier,
            controls,
            handoff,
            prompts,
            git,
        }
    }

    /// Process tasks from the persisted cursor to the end of the list.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub fn run(
        &self,
        tasks: &[Task],
        followups: &[Followup],
        store: &mut StateStore,
    ) -> Result<RunOutcome> {
        let mut completed = 0usize;
        let mut failed = 0usize;

        while store.cursor().task_index < tasks.len() {
            if self.controls.checkpoint() == ControlDecision::Stop {
                return Ok(self.outcome(RunStop::Stopped, completed, failed));
            }
            let task = &tasks[store.cursor().task_index];
            info!(task = %task.id, cursor = ?store.cursor(), "starting task");

            match self.run_task(task, followups, store)? {
                TaskFlow::Stopped => {
                    return Ok(self.outcome(RunStop::Stopped, completed, failed));
                }
                TaskFlow::Advanced { failed: task_failed } => {
                    if task_failed {
                        failed += 1;
                    } else {
                        completed += 1;
                    }
                }
            }
        }

        Ok(self.outcome(RunStop::Complete, completed, failed))
    }

    fn outcome(&self, stop: RunStop, tasks_completed: usize, tasks_failed: usize) -> RunOutcome {
        RunOutcome {
            stop,
            tasks_completed,
            tasks_failed,
        }
    }

    #[instrument(skip_all, fields(task = %task.id))]
    fn run_task(
        &self,
        task: &Task,
        followups: &[Followup],
        store: &mut StateStore,
    ) -> Result<TaskFlow> {
        let mut task_failed = false;

        if store.cursor().phase == Phase::Main {
            match self.run_main(task, store)? {
                MainFlow::Stopped => return Ok(TaskFlow::Stopped),
                MainFlow::Failed => {
                    // Record the failure and move on; follow-ups are skipped.
                    self.advance_to_next_task(task, store, TaskStatus::Failed)?;
                    return Ok(TaskFlow::Advanced { failed: true });
                }
                MainFlow::Ok => {}
            }
        }

        // AFTER phase, resumable mid-list.
        while store.cursor().phase == Phase::After
            && store.cursor().after_index < followups.len()
        {
            if self.controls.checkpoint() == ControlDecision::Stop {
                return Ok(TaskFlow::Stopped);
            }
            let index = store.cursor().after_index;
            let followup = &followups[index];
            self.run_followup(task, followup, index, store)?;
            store.set_cursor(store.cursor().advance_after());
            store.persist()?;
        }

        if self.cfg.file.verify_after_followups
            && !followups.is_empty()
            && self.verifier.has_checks()
        {
            if self.controls.checkpoint() == ControlDecision::Stop {
                return Ok(TaskFlow::Stopped);
            }
            let preferred = store
                .task(&task.id)
                .and_then(|t| t.last_ok_backend.clone())
                .unwrap_or_else(|| self.cfg.primary.clone());
            match self.verify_and_fix(task, &preferred, store)? {
                FixOutcome::Stopped => return Ok(TaskFlow::Stopped),
                FixOutcome::Exhausted => task_failed = true,
                FixOutcome::Verified => {}
            }
        }

        if self.cfg.commit && !task_failed {
            self.commit_task(task)?;
        }

        let status = if task_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Done
        };
        self.advance_to_next_task(task, store, status)?;
        Ok(TaskFlow::Advanced {
            failed: task_failed,
        })
    }

    fn run_main(&self, task: &Task, store: &mut StateStore) -> Result<MainFlow> {
        let order = main_order(
            task.backend_override.as_deref(),
            &self.cfg.primary,
            &self.cfg.fallbacks,
        );
        let prompt = self
            .prompts
            .main_prompt(task, &self.handoff.path_for(&task.id))?;

        let mut active: Option<String> = None;
        for backend in &order {
            if self.controls.checkpoint() == ControlDecision::Stop {
                return Ok(MainFlow::Stopped);
            }
            let result = self.invoke(task, backend, Phase::Main, None, "main", &prompt, store)?;
            if result.ok {
                active = Some(backend.clone());
                break;
            }
            warn!(task = %task.id, backend = %backend, "main attempt failed");
        }

        let Some(active) = active else {
            warn!(task = %task.id, "all backends failed the implementation step");
            return Ok(MainFlow::Failed);
        };

        if self.verifier.has_checks() {
            match self.verify_and_fix(task, &active, store)? {
                FixOutcome::Stopped => return Ok(MainFlow::Stopped),
                FixOutcome::Exhausted => return Ok(MainFlow::Failed),
                FixOutcome::Verified => {}
            }
        }

        store.task_mut(&task.id).status = TaskStatus::MainOk;
        store.set_cursor(store.cursor().enter_after());
        store.persist()?;
        Ok(MainFlow::Ok)
    }

    /// Run the configured checks; on failure, drive the fix loop through the
    /// chain with a per-backend retry budget, re-verifying after every
    /// successful fix attempt.
    fn verify_and_fix(
        &self,
        task: &Task,
        preferred: &str,
        store: &mut StateStore,
    ) -> Result<FixOutcome> {
        if self.controls.checkpoint() == ControlDecision::Stop {
            return Ok(FixOutcome::Stopped);
        }
        let mut failures = self.verifier.run_checks(&self.cfg.repo)?;
        if failures.is_empty() {
            self.handoff.append_verify_pass(&task.id)?;
            return Ok(FixOutcome::Verified);
        }
        info!(task = %task.id, count = failures.len(), "verification failed, entering fix loop");
        self.handoff.append_verify_failures(&task.id, &failures)?;

        let order = fix_order(
            preferred,
            &main_order(
                task.backend_override.as_deref(),
                &self.cfg.primary,
                &self.cfg.fallbacks,
            ),
        );
        let mut fix_step = 0usize;
        for backend in &order {
            for _ in 0..self.cfg.file.retries {
                if self.controls.checkpoint() == ControlDecision::Stop {
                    return Ok(FixOutcome::Stopped);
                }
                fix_step += 1;
                let prompt = self.prompts.fix_prompt(
                    &task.id,
                    &self.handoff.path_for(&task.id),
                    &failures,
                )?;
                let step_name = format!("fix{fix_step}");
                let result = self.invoke(
                    task,
                    backend,
                    Phase::Main,
                    None,
                    &step_name,
                    &prompt,
                    store,
                )?;
                if !result.ok {
                    continue;
                }
                failures = self.verifier.run_checks(&self.cfg.repo)?;
                if failures.is_empty() {
                    self.handoff.append_verify_pass(&task.id)?;
                    return Ok(FixOutcome::Verified);
                }
                self.handoff.append_verify_failures(&task.id, &failures)?;
            }
        }
        warn!(task = %task.id, "fix budget exhausted, checks still failing");
        Ok(FixOutcome::Exhausted)
    }

    /// One follow-up prompt. A failure across all backends is recorded but
    /// never aborts the remaining follow-ups.
    fn run_followup(
        &self,
        task: &Task,
        followup: &Followup,
        index: usize,
        store: &mut StateStore,
    ) -> Result<()> {
        let text = apply_placeholders(&followup.text, &task.id);
        let prompt =
            self.prompts
                .followup_prompt(&task.id, &self.handoff.path_for(&task.id), &text)?;
        let step_name = format!("after{}", index + 1);

        let last_ok = store
            .task(&task.id)
            .and_then(|t| t.last_ok_backend.clone());
        let order = after_order(last_ok.as_deref(), &self.cfg.primary, &self.cfg.fallbacks);

        for backend in &order {
            let result = self.invoke(
                task,
                backend,
                Phase::After,
                Some(index),
                &step_name,
                &prompt,
                store,
            )?;
            if result.ok {
                return Ok(());
            }
            warn!(task = %task.id, backend = %backend, label = %followup.label, "follow-up attempt failed");
        }
        warn!(task = %task.id, label = %followup.label, "follow-up failed with all backends, continuing");
        Ok(())
    }

    /// Invoke one backend and record everything the step produced: the
    /// history entry, session-token updates, the persisted state, and the
    /// rewritten handoff.
    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        task: &Task,
        backend_name: &str,
        phase: Phase,
        after_index: Option<usize>,
        step_name: &str,
        prompt: &str,
        store: &mut StateStore,
    ) -> Result<RunResult> {
        let backend = self.registry.get(backend_name)?;
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let log_dir = self.cfg.task_log_dir(&task.id);
        let base = format!("{stamp}.{backend_name}.{phase}.{step_name}");
        let request = InvokeRequest {
            prompt: prompt.to_string(),
            resume_token: store
                .task(&task.id)
                .and_then(|t| t.sessions.get(backend_name).cloned()),
            log_path: log_dir.join(format!("{base}.log")),
            last_message_path: log_dir.join(format!("{base}.last.txt")),
        };
        info!(task = %task.id, backend = %backend_name, step = %step_name, "invoking backend");
        let result = backend.invoke(&request)?;

        let state = store.task_mut(&task.id);
        state.history.push(StepRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            phase,
            after_index,
            backend: backend_name.to_string(),
            ok: result.ok,
            exit_code: result.exit_code,
            log: Some(request.log_path.display().to_string()),
        });
        if result.drop_resume_token {
            state.sessions.remove(backend_name);
        } else if let Some(token) = &result.resume_token {
            state.sessions.insert(backend_name.to_string(), token.clone());
        }
        if result.ok {
            state.last_ok_backend = Some(backend_name.to_string());
        }
        store.persist()?;

        let step = HandoffStep {
            task,
            phase,
            step_name,
            backend: backend_name,
            ok: result.ok,
            exit_code: result.exit_code,
            log_path: Some(&request.log_path),
            assistant_text: &result.assistant_text,
        };
        self.handoff
            .write_step(&step, &self.git.snapshot())
            .context("rewrite handoff")?;

        Ok(result)
    }

    fn commit_task(&self, task: &Task) -> Result<()> {
        self.git.add_all()?;
        let title = task.title.trim();
        let message = if title.is_empty() {
            format!("{}: implement task", task.id)
        } else {
            format!("{}: {}", task.id, title)
        };
        if self.git.commit_staged(&message)? {
            info!(task = %task.id, "committed task changes");
        }
        Ok(())
    }

    fn advance_to_next_task(
        &self,
        task: &Task,
        store: &mut StateStore,
        status: TaskStatus,
    ) -> Result<()> {
        store.task_mut(&task.id).status = status;
        store.set_cursor(store.cursor().next_task());
        store.persist()?;
        Ok(())
    }
}

enum MainFlow {
    Ok,
    Failed,
    Stopped,
}
