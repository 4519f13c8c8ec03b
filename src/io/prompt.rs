//! Prompt construction for the three step kinds: implement, fix, follow-up.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::Task;
use crate::io::verify::CheckFailure;

const MAIN_TEMPLATE: &str = include_str!("prompts/main.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const FOLLOWUP_TEMPLATE: &str = include_str!("prompts/followup.md");

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("main", MAIN_TEMPLATE)
            .expect("main template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        env.add_template("followup", FOLLOWUP_TEMPLATE)
            .expect("followup template should be valid");
        Self { env }
    }

    /// Implementation prompt for a task's MAIN step.
    pub fn main_prompt(&self, task: &Task, handoff: &Path) -> Result<String> {
        let template = self.env.get_template("main")?;
        let rendered = template
            .render(context! {
                task_id => task.id,
                title => (!task.title.trim().is_empty()).then(|| task.title.trim()),
                handoff => handoff.display().to_string(),
                spec => task.spec.trim(),
            })
            .context("render main prompt")?;
        Ok(ensure_trailing_newline(rendered))
    }

    /// Fix prompt carrying the failed verification checks.
    pub fn fix_prompt(
        &self,
        task_id: &str,
        handoff: &Path,
        failures: &[CheckFailure],
    ) -> Result<String> {
        let template = self.env.get_template("fix")?;
        let rendered = template
            .render(context! {
                task_id => task_id,
                handoff => handoff.display().to_string(),
                failures => failures,
            })
            .context("render fix prompt")?;
        Ok(ensure_trailing_newline(rendered))
    }

    /// Follow-up prompt wrapping one instruction from the AFTER list.
    pub fn followup_prompt(
        &self,
        task_id: &str,
        handoff: &Path,
        instructions: &str,
    ) -> Result<String> {
        let template = self.env.get_template("followup")?;
        let rendered = template
            .render(context! {
                task_id => task_id,
                handoff => handoff.display().to_string(),
                instructions => instructions.trim(),
            })
            .context("render followup prompt")?;
        Ok(ensure_trailing_newline(rendered))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_trailing_newline(mut s: String) -> String {
    let trimmed_len = s.trim_end().len();
    s.truncate(trimmed_len);
    s.push('\n');
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task() -> Task {
        Task {
            id: "T3".to_string(),
            title: "Add parser".to_string(),
            spec: "Parse the thing.".to_string(),
            backend_override: None,
        }
    }

    #[test]
    fn main_prompt_names_task_handoff_and_spec() {
        let handoff = PathBuf::from(".agentrun/handoff/T3.md");
        let prompt = PromptBuilder::new()
            .main_prompt(&task(), &handoff)
            .expect("render");
        assert!(prompt.contains("TASK: T3 - Add parser"));
        assert!(prompt.contains(".agentrun/handoff/T3.md"));
        assert!(prompt.contains("Parse the thing."));
        assert!(prompt.ends_with('\n'));
    }

    #[test]
    fn empty_title_is_omitted() {
        let mut task = task();
        task.title = String::new();
        let prompt = PromptBuilder::new()
            .main_prompt(&task, Path::new("h.md"))
            .expect("render");
        assert!(prompt.contains("TASK: T3\n"));
    }

    #[test]
    fn fix_prompt_lists_every_failure() {
        let failures = vec![
            CheckFailure {
                name: "lint".to_string(),
                command: "cargo clippy".to_string(),
                output: "warning: unused".to_string(),
            },
            CheckFailure {
                name: "test".to_string(),
                command: "cargo test".to_string(),
                output: "2 failed".to_string(),
            },
        ];
        let prompt = PromptBuilder::new()
            .fix_prompt("T3", Path::new("h.md"), &failures)
            .expect("render");
        assert!(prompt.contains("Check: lint"));
        assert!(prompt.contains("cargo clippy"));
        assert!(prompt.contains("warning: unused"));
        assert!(prompt.contains("Check: test"));
        assert!(prompt.contains("2 failed"));
    }

    #[test]
    fn followup_prompt_embeds_the_instruction() {
        let prompt = PromptBuilder::new()
            .followup_prompt("T3", Path::new("h.md"), "Update the changelog.\n")
            .expect("render");
        assert!(prompt.contains("Follow-up for TASK T3"));
        assert!(prompt.contains("Update the changelog."));
    }
}
