//! Structured task-id arithmetic and prompt placeholders.
//!
//! Task files commonly use ids like `T2`, `T2-3`, or `M02-T2-3`. Follow-up
//! prompts may reference `{TASK_ID}` and `{TASK_ID_NEXT}`; the latter needs
//! the "next" id in the series, preserving zero padding.

use std::sync::LazyLock;

use regex::Regex;

static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:M(?P<m>\d+)-)?T(?P<t>\d+)(?:-(?P<sub>\d+))?$").expect("valid task id regex")
});

/// Parsed structured task id, retaining digit widths for re-formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTaskId {
    pub module_num: Option<u32>,
    pub module_width: usize,
    pub task_num: u32,
    pub task_width: usize,
    pub sub_num: Option<u32>,
    pub sub_width: usize,
}

impl ParsedTaskId {
    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(m) = self.module_num {
            out.push_str(&format!("M{m:0width$}-", width = self.module_width));
        }
        out.push_str(&format!("T{n:0width$}", n = self.task_num, width = self.task_width));
        if let Some(sub) = self.sub_num {
            out.push_str(&format!("-{sub:0width$}", width = self.sub_width));
        }
        out
    }

    /// The next id in the series: increment the sub number when present,
    /// otherwise the task number.
    pub fn next(&self) -> ParsedTaskId {
        let mut next = *self;
        match next.sub_num {
            Some(sub) => next.sub_num = Some(sub + 1),
            None => next.task_num += 1,
        }
        next
    }
}

/// Parse a structured id; returns `None` for free-form ids.
pub fn parse_task_id(task_id: &str) -> Option<ParsedTaskId> {
    let caps = TASK_ID_RE.captures(task_id.trim())?;
    let m = caps.name("m");
    let t = caps.name("t").expect("t group always present on match");
    let sub = caps.name("sub");
    Some(ParsedTaskId {
        module_num: m.and_then(|g| g.as_str().parse().ok()),
        module_width: m.map_or(0, |g| g.as_str().len()),
        task_num: t.as_str().parse().ok()?,
        task_width: t.as_str().len(),
        sub_num: sub.and_then(|g| g.as_str().parse().ok()),
        sub_width: sub.map_or(0, |g| g.as_str().len()),
    })
}

/// Next id in the series, or the id unchanged when it is free-form.
pub fn next_task_id(task_id: &str) -> String {
    match parse_task_id(task_id) {
        Some(parsed) => parsed.next().format(),
        None => task_id.to_string(),
    }
}

/// Substitute `{TASK_ID}` and `{TASK_ID_NEXT}` in follow-up prompt text.
pub fn apply_placeholders(text: &str, task_id: &str) -> String {
    text.replace("{TASK_ID}", task_id)
        .replace("{TASK_ID_NEXT}", &next_task_id(task_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_task_sub() {
        let parsed = parse_task_id("M02-T2-3").expect("parse");
        assert_eq!(parsed.module_num, Some(2));
        assert_eq!(parsed.module_width, 2);
        assert_eq!(parsed.task_num, 2);
        assert_eq!(parsed.sub_num, Some(3));
        assert_eq!(parsed.format(), "M02-T2-3");
    }

    #[test]
    fn next_increments_sub_before_task() {
        assert_eq!(next_task_id("T2-3"), "T2-4");
        assert_eq!(next_task_id("T2"), "T3");
        assert_eq!(next_task_id("M02-T09"), "M02-T10");
    }

    #[test]
    fn preserves_zero_padding() {
        assert_eq!(next_task_id("T09"), "T10");
        assert_eq!(next_task_id("T009"), "T010");
    }

    #[test]
    fn free_form_ids_pass_through() {
        assert_eq!(next_task_id("cleanup-pass"), "cleanup-pass");
    }

    #[test]
    fn placeholders_are_substituted() {
        let out = apply_placeholders("finish {TASK_ID}, prepare {TASK_ID_NEXT}", "T2-1");
        assert_eq!(out, "finish T2-1, prepare T2-2");
    }
}
