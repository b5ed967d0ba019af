//! Unified diff generation for mutating tools.
//!
//! Line-based LCS diff via `similar`; every approved write shows the user
//! this diff, and the additions/removals counters feed snapshot statistics.

use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub additions: usize,
    pub removals: usize,
}

/// Unified diff with `---`/`+++` headers plus change counters.
pub fn generate(display_path: &str, old: &str, new: &str) -> (String, DiffStats) {
    let diff = TextDiff::from_lines(old, new);

    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.additions += 1,
            ChangeTag::Delete => stats.removals += 1,
            ChangeTag::Equal => {}
        }
    }

    let mut body = String::new();
    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        body.push_str(&hunk.to_string());
    }

    if body.is_empty() {
        return (String::new(), stats);
    }

    (
        format!("--- {display_path}\n+++ {display_path}\n{body}"),
        stats,
    )
}
