//! Three-way merge engine and line-level diff helpers.
//!
//! Uses the `diffy` crate for line-based three-way merges between a base,
//! "ours" (the human's version) and "theirs" (the agent's version) of a file.
//! The human side is always "ours" so conflict markers read the same way
//! everywhere they are shown.

use diffy::{ConflictStyle, DiffOptions, Line, MergeOptions};
use tracing::debug;

use crate::models::LineRange;

pub const MARKER_OURS: &str = "<<<<<<<";
pub const MARKER_SEP: &str = "=======";
pub const MARKER_THEIRS: &str = ">>>>>>>";
const MARKER_BASE: &str = "|||||||";

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    /// Whether the merge completed without conflicts.
    pub has_conflicts: bool,
    /// Conflicting regions within the merged content.
    pub conflict_hunks: Vec<ConflictHunk>,
}

/// One conflicting region, split into the human and agent sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictHunk {
    /// First line (1-indexed) of the marker block in the merged output.
    pub start_line: usize,
    /// Last line (1-indexed) of the marker block in the merged output.
    pub end_line: usize,
    pub human: Vec<String>,
    pub agent: Vec<String>,
}

/// Added/modified/removed line counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

impl std::ops::AddAssign for LineStats {
    fn add_assign(&mut self, rhs: Self) {
        self.added += rhs.added;
        self.modified += rhs.modified;
        self.removed += rhs.removed;
    }
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `human` and `agent`, both derived from `base`.
    ///
    /// Always returns merged content. On conflict the standard `<<<<<<<` /
    /// `=======` / `>>>>>>>` markers are inserted with the human side first.
    pub fn three_way_merge(base: &str, human: &str, agent: &str) -> MergeResult {
        if human == base || human == agent {
            debug!("human side unchanged or identical, agent wins cleanly");
            return clean(agent);
        }
        if agent == base {
            debug!("agent side unchanged, human wins cleanly");
            return clean(human);
        }

        let mut opts = MergeOptions::new();
        opts.set_conflict_style(ConflictStyle::Merge);
        match opts.merge(base, human, agent) {
            Ok(merged) => {
                debug!("clean three-way merge");
                clean(&merged)
            }
            Err(conflicted) => {
                let hunks = parse_conflict_hunks(&conflicted);
                debug!(hunks = hunks.len(), "three-way merge produced conflicts");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_hunks: hunks,
                }
            }
        }
    }
}

fn clean(content: &str) -> MergeResult {
    MergeResult {
        merged_content: content.to_string(),
        has_conflicts: false,
        conflict_hunks: Vec::new(),
    }
}

/// `true` if any line starts with a conflict marker.
pub fn has_conflict_markers(text: &str) -> bool {
    text.lines().any(|line| {
        line.starts_with(MARKER_OURS) || line.starts_with(MARKER_SEP) || line.starts_with(MARKER_THEIRS)
    })
}

/// Split marker blocks into their human ("ours") and agent ("theirs") sides.
/// A diff3 base section, if present, is dropped.
pub fn parse_conflict_hunks(text: &str) -> Vec<ConflictHunk> {
    enum Side {
        Outside,
        Human,
        Base,
        Agent,
    }

    let mut hunks = Vec::new();
    let mut side = Side::Outside;
    let mut current: Option<ConflictHunk> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.starts_with(MARKER_OURS) {
            side = Side::Human;
            current = Some(ConflictHunk {
                start_line: line_no,
                end_line: line_no,
                human: Vec::new(),
                agent: Vec::new(),
            });
            continue;
        }
        match side {
            Side::Outside => {}
            _ if line.starts_with(MARKER_BASE) => side = Side::Base,
            _ if line.starts_with(MARKER_SEP) => side = Side::Agent,
            _ if line.starts_with(MARKER_THEIRS) => {
                if let Some(mut hunk) = current.take() {
                    hunk.end_line = line_no;
                    hunks.push(hunk);
                }
                side = Side::Outside;
            }
            Side::Human => {
                if let Some(h) = current.as_mut() {
                    h.human.push(line.to_string());
                }
            }
            Side::Base => {}
            Side::Agent => {
                if let Some(h) = current.as_mut() {
                    h.agent.push(line.to_string());
                }
            }
        }
    }
    hunks
}

fn zero_context_patch<'a>(before: &'a str, after: &'a str) -> diffy::Patch<'a, str> {
    let mut opts = DiffOptions::new();
    opts.set_context_len(0);
    opts.create_patch(before, after)
}

/// Lines of `before` touched on the way to `after`, as inclusive 1-based
/// ranges. A pure insertion is the point `[n, n]` it follows.
pub fn changed_line_ranges(before: &str, after: &str) -> Vec<LineRange> {
    if before == after {
        return Vec::new();
    }
    let patch = zero_context_patch(before, after);
    patch
        .hunks()
        .iter()
        .map(|hunk| {
            let range = hunk.old_range();
            if range.len() == 0 {
                LineRange::new(range.start(), range.start())
            } else {
                LineRange::new(range.start(), range.start() + range.len() - 1)
            }
        })
        .collect()
}

/// Count added, modified and removed lines. Within each hunk, paired
/// deletions and insertions count as modifications.
pub fn line_stats(before: &str, after: &str) -> LineStats {
    let mut stats = LineStats::default();
    if before == after {
        return stats;
    }
    let patch = zero_context_patch(before, after);
    for hunk in patch.hunks() {
        let (mut deleted, mut inserted) = (0usize, 0usize);
        for line in hunk.lines() {
            match line {
                Line::Delete(_) => deleted += 1,
                Line::Insert(_) => inserted += 1,
                Line::Context(_) => {}
            }
        }
        let paired = deleted.min(inserted);
        stats.modified += paired;
        stats.added += inserted - paired;
        stats.removed += deleted - paired;
    }
    stats
}

/// Non-blank lines inserted on the way from `base` to `other`, trimmed.
pub fn inserted_lines(base: &str, other: &str) -> Vec<String> {
    if base == other {
        return Vec::new();
    }
    let patch = zero_context_patch(base, other);
    let mut lines = Vec::new();
    for hunk in patch.hunks() {
        for line in hunk.lines() {
            if let Line::Insert(text) = line {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
        }
    }
    lines
}

/// Non-blank lines of `base` that `other` removed and does not contain
/// anywhere else, trimmed. A line that was only moved is not reported.
pub fn deleted_lines(base: &str, other: &str) -> Vec<String> {
    if base == other {
        return Vec::new();
    }
    let remaining: std::collections::HashSet<&str> = other.lines().map(str::trim).collect();
    let patch = zero_context_patch(base, other);
    let mut lines = Vec::new();
    for hunk in patch.hunks() {
        for line in hunk.lines() {
            if let Line::Delete(text) = line {
                let trimmed = text.trim();
                if !trimmed.is_empty() && !remaining.contains(trimmed) {
                    lines.push(trimmed.to_string());
                }
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = Merger::three_way_merge(base, base, base);
        assert!(!result.has_conflicts);
        assert!(result.conflict_hunks.is_empty());
    }

    #[test]
    fn test_only_one_side_changed() {
        let base = "line1\nline2\nline3\n";
        let changed = "line1\nmodified\nline3\n";
        assert_eq!(Merger::three_way_merge(base, changed, base).merged_content, changed);
        assert_eq!(Merger::three_way_merge(base, base, changed).merged_content, changed);
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "aaa\nbbb\nccc\nddd\neee\n";
        let human = "AAA\nbbb\nccc\nddd\neee\n";
        let agent = "aaa\nbbb\nccc\nddd\nEEE\n";
        let result = Merger::three_way_merge(base, human, agent);
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "AAA\nbbb\nccc\nddd\nEEE\n");
    }

    #[test]
    fn test_conflicting_changes_put_human_first() {
        let base = "line1\noriginal\nline3\n";
        let human = "line1\nhuman_version\nline3\n";
        let agent = "line1\nagent_version\nline3\n";
        let result = Merger::three_way_merge(base, human, agent);
        assert!(result.has_conflicts);
        assert!(has_conflict_markers(&result.merged_content));
        assert_eq!(result.conflict_hunks.len(), 1);
        assert_eq!(result.conflict_hunks[0].human, vec!["human_version"]);
        assert_eq!(result.conflict_hunks[0].agent, vec!["agent_version"]);
    }

    #[test]
    fn test_parse_diff3_hunks() {
        let text = "a\n<<<<<<< ours\nmine\n||||||| original\nold\n=======\nyours\n>>>>>>> theirs\nz\n";
        let hunks = parse_conflict_hunks(text);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].start_line, 2);
        assert_eq!(hunks[0].end_line, 8);
        assert_eq!(hunks[0].human, vec!["mine"]);
        assert_eq!(hunks[0].agent, vec!["yours"]);
    }

    #[test]
    fn test_changed_line_ranges() {
        let before = "1\n2\n3\n4\n5\n6\n7\n8\n";
        let after = "1\n2\nthree\nfour\n5\n6\n7\n8\n";
        assert_eq!(changed_line_ranges(before, after), vec![LineRange::new(3, 4)]);
        assert!(changed_line_ranges(before, before).is_empty());

        let removed = "1\n2\n3\n4\n5\n6\n8\n";
        assert_eq!(changed_line_ranges(before, removed), vec![LineRange::new(7, 7)]);
    }

    #[test]
    fn test_line_stats() {
        let before = "a\nb\nc\n";
        let after = "a\nB\nc\nd\ne\n";
        let stats = line_stats(before, after);
        assert_eq!(stats.modified, 1);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.removed, 0);

        let stats = line_stats("a\nb\nc\n", "a\n");
        assert_eq!(stats, LineStats { added: 0, modified: 0, removed: 2 });
    }

    #[test]
    fn test_inserted_lines() {
        let base = "def f():\n    pass\n";
        let human = "import os\n\ndef f():\n    pass\n";
        assert_eq!(inserted_lines(base, human), vec!["import os"]);
    }

    #[test]
    fn test_deleted_lines_ignore_moves() {
        let base = "import os\nimport sys\n\ndef f():\n    pass\n";
        let human = "import sys\n\ndef f():\n    pass\nimport os\n";
        assert!(deleted_lines(base, human).is_empty());

        let human = "import sys\n\ndef f():\n    pass\n";
        assert_eq!(deleted_lines(base, human), vec!["import os"]);
        assert!(deleted_lines(base, base).is_empty());
    }
}
