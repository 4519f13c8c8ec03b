//! Backend try-order construction for the MAIN and AFTER phases.

/// Try order for the implementation step: task-level override first (when
/// present), else the configured primary, followed by the deduplicated
/// fallback chain.
pub fn main_order(
    override_backend: Option<&str>,
    primary: &str,
    fallbacks: &[String],
) -> Vec<String> {
    let first = override_backend.unwrap_or(primary);
    dedup_chain(first, fallbacks)
}

/// Try order for fix attempts after `active` succeeded the implementation:
/// the succeeding backend first, then the rest of the MAIN order.
pub fn fix_order(active: &str, main: &[String]) -> Vec<String> {
    let mut out = vec![active.to_string()];
    for name in main {
        if name != active {
            out.push(name.clone());
        }
    }
    out
}

/// Try order for a follow-up prompt: the last backend that succeeded for
/// this task, else the primary, followed by the remaining fallback chain.
pub fn after_order(last_ok: Option<&str>, primary: &str, fallbacks: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(last) = last_ok {
        out.push(last.to_string());
    }
    if !out.iter().any(|n| n == primary) {
        out.push(primary.to_string());
    }
    for name in fallbacks {
        if !out.iter().any(|n| n == name) {
            out.push(name.clone());
        }
    }
    out
}

fn dedup_chain(first: &str, fallbacks: &[String]) -> Vec<String> {
    let mut out = vec![first.to_string()];
    for name in fallbacks {
        if !out.iter().any(|n| n == name) {
            out.push(name.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn main_order_uses_primary_then_fallbacks() {
        let order = main_order(None, "codex", &chain(&["claude", "gemini"]));
        assert_eq!(order, chain(&["codex", "claude", "gemini"]));
    }

    #[test]
    fn main_order_override_comes_first_and_dedups() {
        let order = main_order(Some("claude"), "codex", &chain(&["claude", "gemini"]));
        assert_eq!(order, chain(&["claude", "gemini"]));
    }

    #[test]
    fn fix_order_rotates_active_to_front() {
        let main = chain(&["codex", "claude", "gemini"]);
        assert_eq!(fix_order("claude", &main), chain(&["claude", "codex", "gemini"]));
    }

    #[test]
    fn after_order_prefers_last_ok_then_primary() {
        let order = after_order(Some("gemini"), "codex", &chain(&["claude", "gemini"]));
        assert_eq!(order, chain(&["gemini", "codex", "claude"]));
    }

    #[test]
    fn after_order_without_last_ok_starts_at_primary() {
        let order = after_order(None, "codex", &chain(&["claude"]));
        assert_eq!(order, chain(&["codex", "claude"]));
    }
}
