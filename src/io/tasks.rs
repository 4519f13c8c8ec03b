//! Task list loading from a header-bearing CSV file.
//!
//! Column resolution is case-insensitive with aliases: id/task_id/task,
//! title/name, spec/prompt/details/description/body, engine/model/agent/
//! backend. Missing spec text falls back to a `key: value` serialization of
//! the remaining row fields; a missing id falls back to a positional
//! `row<N>` identifier. Malformed or duplicate ids abort the run.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::backends::normalize_backend;
use crate::core::types::{InputError, Task};

const ID_ALIASES: [&str; 3] = ["id", "task_id", "task"];
const TITLE_ALIASES: [&str; 2] = ["title", "name"];
const SPEC_ALIASES: [&str; 5] = ["spec", "prompt", "details", "description", "body"];
const BACKEND_ALIASES: [&str; 4] = ["engine", "model", "agent", "backend"];

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid id regex"));

/// Load the ordered task list. All input problems are fatal [`InputError`]s.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    // Tolerate a UTF-8 BOM from spreadsheet exports.
    let raw = raw.trim_start_matches('\u{feff}');

    let mut reader = csv::Reader::from_reader(raw.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("read headers {}", path.display()))?
        .clone();
    if headers.is_empty() {
        return Err(InputError(format!("{}: task file has no header row", path.display())).into());
    }

    let id_col = detect_column(&headers, &ID_ALIASES);
    let title_col = detect_column(&headers, &TITLE_ALIASES);
    let spec_col = detect_column(&headers, &SPEC_ALIASES);
    let backend_col = detect_column(&headers, &BACKEND_ALIASES);
    debug!(?id_col, ?title_col, ?spec_col, ?backend_col, "resolved task columns");

    let mut tasks = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    for (row_num, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("read row {} of {}", row_num + 1, path.display()))?;

        let raw_id = id_col.and_then(|i| record.get(i)).unwrap_or("").trim();
        let id = if raw_id.is_empty() {
            format!("row{}", row_num + 1)
        } else {
            raw_id.to_string()
        };
        if !ID_RE.is_match(&id) {
            return Err(InputError(format!("row {}: malformed task id '{id}'", row_num + 1)).into());
        }
        if !seen_ids.insert(id.clone()) {
            return Err(InputError(format!("row {}: duplicate task id '{id}'", row_num + 1)).into());
        }

        let title = title_col
            .and_then(|i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string();

        let mut spec = spec_col
            .and_then(|i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string();
        if spec.is_empty() {
            spec = serialize_row(&headers, &record, &[id_col, title_col, backend_col]);
        }
        if spec.is_empty() {
            return Err(InputError(format!("{id}: no spec text found (row {})", row_num + 1)).into());
        }

        let backend_override = backend_col
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                normalize_backend(s).map_err(|err| {
                    InputError(format!("{id}: bad backend override: {err}"))
                })
            })
            .transpose()?;

        tasks.push(Task {
            id,
            title,
            spec,
            backend_override,
        });
    }

    Ok(tasks)
}

/// Case-insensitive header lookup over the alias list, first match wins.
fn detect_column(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    for candidate in candidates {
        for (i, header) in headers.iter().enumerate() {
            if header.trim().eq_ignore_ascii_case(candidate) {
                return Some(i);
            }
        }
    }
    None
}

/// `key: value` lines of the row fields not already consumed as metadata.
fn serialize_row(
    headers: &csv::StringRecord,
    record: &csv::StringRecord,
    consumed: &[Option<usize>],
) -> String {
    let mut parts = Vec::new();
    for (i, header) in headers.iter().enumerate() {
        if consumed.contains(&Some(i)) {
            continue;
        }
        let value = record.get(i).unwrap_or("").trim();
        if !value.is_empty() {
            parts.push(format!("{}: {}", header.trim(), value));
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.csv");
        let mut file = fs::File::create(&path).expect("create csv");
        file.write_all(contents.as_bytes()).expect("write csv");
        (temp, path)
    }

    #[test]
    fn resolves_aliased_headers_case_insensitively() {
        let (_temp, path) = write_csv("Task_ID,Name,Description,Agent\nT1,First,Do the thing,claude\n");
        let tasks = load_tasks(&path).expect("load");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "T1");
        assert_eq!(tasks[0].title, "First");
        assert_eq!(tasks[0].spec, "Do the thing");
        assert_eq!(tasks[0].backend_override.as_deref(), Some("claude"));
    }

    #[test]
    fn missing_spec_falls_back_to_row_serialization() {
        let (_temp, path) = write_csv("id,title,component,notes\nT1,First,parser,handle BOM\n");
        let tasks = load_tasks(&path).expect("load");
        assert_eq!(tasks[0].spec, "component: parser\nnotes: handle BOM");
    }

    #[test]
    fn missing_id_uses_positional_fallback() {
        let (_temp, path) = write_csv("spec\nfirst task\nsecond task\n");
        let tasks = load_tasks(&path).expect("load");
        assert_eq!(tasks[0].id, "row1");
        assert_eq!(tasks[1].id, "row2");
    }

    #[test]
    fn duplicate_id_is_fatal() {
        let (_temp, path) = write_csv("id,spec\nT1,a\nT1,b\n");
        let err = load_tasks(&path).unwrap_err();
        assert!(err.downcast_ref::<InputError>().is_some());
        assert!(err.to_string().contains("duplicate task id"));
    }

    #[test]
    fn malformed_id_is_fatal() {
        let (_temp, path) = write_csv("id,spec\nbad id!,a\n");
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("malformed task id"));
    }

    #[test]
    fn empty_row_without_spec_is_fatal() {
        let (_temp, path) = write_csv("id,spec\nT1,\n");
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("no spec text"));
    }

    #[test]
    fn bom_in_header_is_tolerated() {
        let (_temp, path) = write_csv("\u{feff}id,spec\nT1,do it\n");
        let tasks = load_tasks(&path).expect("load");
        assert_eq!(tasks[0].id, "T1");
    }

    #[test]
    fn unknown_backend_override_is_fatal() {
        let (_temp, path) = write_csv("id,spec,engine\nT1,do it,cursor\n");
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("bad backend override"));
    }
}
