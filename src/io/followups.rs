//! Follow-up prompt loading.
//!
//! Three sources, concatenated in this order: blank-line-separated blocks
//! from `--after-file`, `.md`/`.txt` files from the configured `after_dir`
//! in name order, then literal `--after` values. `{TASK_ID}` and
//! `{TASK_ID_NEXT}` placeholders are substituted per task at prompt time,
//! not at load time.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

static BLOCK_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid block split regex"));

/// One follow-up instruction with a label for logs and step records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Followup {
    pub label: String,
    pub text: String,
}

pub fn load_followups(
    after_file: Option<&Path>,
    after_dir: Option<&Path>,
    after_values: &[String],
) -> Result<Vec<Followup>> {
    let mut followups = Vec::new();

    if let Some(path) = after_file {
        let raw =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        for (i, block) in BLOCK_SPLIT_RE
            .split(&raw)
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .enumerate()
        {
            followups.push(Followup {
                label: format!("{}#{}", file_label(path), i + 1),
                text: block.to_string(),
            });
        }
    }

    if let Some(dir) = after_dir {
        for path in prompt_files(dir)? {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            followups.push(Followup {
                label: file_label(&path),
                text,
            });
        }
    }

    for (i, value) in after_values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .enumerate()
    {
        followups.push(Followup {
            label: format!("inline#{}", i + 1),
            text: value.to_string(),
        });
    }

    debug!(count = followups.len(), "follow-up prompts loaded");
    Ok(followups)
}

/// `.md`/`.txt` files of a directory, sorted by file name.
fn prompt_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("md") | Some("txt") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
