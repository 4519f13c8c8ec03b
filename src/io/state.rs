//! Durable run state: the cursor plus all per-task history and sessions.
//!
//! Every mutation is followed by an atomic replace (temp file + rename), so
//! an external kill loses at most the in-flight step. On resume the cursor
//! and per-task session tokens are restored verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{Cursor, TaskState};

/// The persisted state document (`.agentrun/state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StateDoc {
    pub cursor: Cursor,
    pub tasks: BTreeMap<String, TaskState>,
    pub updated_at: Option<String>,
}

/// Owner of the state document; the run loop is the sole mutator.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    doc: StateDoc,
}

impl StateStore {
    /// Load state from disk. Missing file yields a fresh document; a corrupt
    /// file is copied aside and replaced with a fresh document rather than
    /// aborting a resumable run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(doc) => doc,
                Err(err) => {
                    let backup = path.with_extension(format!(
                        "corrupt-{}.json",
                        Local::now().format("%Y%m%d-%H%M%S")
                    ));
                    warn!(err = %err, backup = %backup.display(), "state file corrupt, starting fresh");
                    fs::copy(&path, &backup)
                        .with_context(|| format!("back up corrupt state to {}", backup.display()))?;
                    StateDoc::default()
                }
            }
        } else {
            StateDoc::default()
        };
        debug!(path = %path.display(), cursor = ?doc.cursor, "state loaded");
        Ok(Self { path, doc })
    }

    pub fn cursor(&self) -> Cursor {
        self.doc.cursor
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.doc.cursor = cursor;
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskState> {
        self.doc.tasks.get(task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> &mut TaskState {
        self.doc.tasks.entry(task_id.to_string()).or_default()
    }

    pub fn doc(&self) -> &StateDoc {
        &self.doc
    }

    /// Atomically write the document (temp file + rename).
    pub fn persist(&mut self) -> Result<()> {
        self.doc.updated_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut buf = serde_json::to_string_pretty(&self.doc).context("serialize state")?;
        buf.push('\n');
        let parent = self
            .path
            .parent()
            .with_context(|| format!("state path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace state {}", self.path.display()))?;
        Ok(())
    }
}
