//! Conflict detection logic.
//!
//! Given the human's and the agent's change events since a common sync point,
//! the detector classifies how badly they collide. It is a pure function of
//! the two event sets: line ranges travel inside the events.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::ChangeEvent;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How severely a human change and an agent change collide.
///
/// Variants are declared least severe first so `Ord` ranks them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// Unrelated files.
    None,
    /// Different files that are likely related (same directory, similar name).
    RelatedFile,
    /// The same file, disjoint line ranges.
    SameFile,
    /// The same file, overlapping line ranges (or ranges unknown).
    OverlappingRange,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::RelatedFile => write!(f, "related-file"),
            Self::SameFile => write!(f, "same-file"),
            Self::OverlappingRange => write!(f, "overlapping-range"),
        }
    }
}

/// Recommended way to integrate the two changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    AutoMerge,
    Selective,
    Manual,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoMerge => write!(f, "auto-merge"),
            Self::Selective => write!(f, "selective"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl Severity {
    /// The strategy recommended for this severity.
    pub fn strategy(self) -> Strategy {
        match self {
            Self::None => Strategy::AutoMerge,
            Self::RelatedFile | Self::SameFile => Strategy::Selective,
            Self::OverlappingRange => Strategy::Manual,
        }
    }
}

/// A classified collision between one human change and one agent change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    /// The agent-side file.
    pub file_path: String,
    pub human_change: ChangeEvent,
    pub agent_change: ChangeEvent,
    pub severity: Severity,
    pub recommended_strategy: Strategy,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Classifies overlap between human and agent change sets.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    related_name_threshold: f64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl ConflictDetector {
    pub fn new(related_name_threshold: f64) -> Self {
        Self {
            related_name_threshold,
        }
    }

    /// Classify one pair of events.
    pub fn classify(&self, human: &ChangeEvent, agent: &ChangeEvent) -> (Severity, Strategy) {
        let severity = self.severity(human, agent);
        (severity, severity.strategy())
    }

    fn severity(&self, human: &ChangeEvent, agent: &ChangeEvent) -> Severity {
        if human.file_path == agent.file_path {
            // Both sides landed on identical content: nothing to reconcile.
            if human.content_hash_after == agent.content_hash_after {
                return Severity::None;
            }
            if human.line_ranges.is_empty() || agent.line_ranges.is_empty() {
                return Severity::OverlappingRange;
            }
            let overlapping = human
                .line_ranges
                .iter()
                .any(|h| agent.line_ranges.iter().any(|a| h.overlaps(a)));
            return if overlapping {
                Severity::OverlappingRange
            } else {
                Severity::SameFile
            };
        }

        if parent_dir(&human.file_path) == parent_dir(&agent.file_path)
            || name_similarity(file_stem(&human.file_path), file_stem(&agent.file_path))
                >= self.related_name_threshold
        {
            return Severity::RelatedFile;
        }
        Severity::None
    }

    /// Detect conflicts between two event sets.
    ///
    /// Returns at most one record per agent file: the most severe pairing.
    /// Pairs classified `none` are omitted.
    pub fn detect(&self, human: &[ChangeEvent], agent: &[ChangeEvent]) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = Vec::new();

        for agent_change in agent {
            let worst = human
                .iter()
                .map(|h| (self.severity(h, agent_change), h))
                .filter(|(severity, _)| *severity != Severity::None)
                .max_by_key(|(severity, _)| *severity);
            let Some((severity, human_change)) = worst else {
                continue;
            };

            if let Some(existing) = records
                .iter_mut()
                .find(|r| r.file_path == agent_change.file_path)
            {
                if severity > existing.severity {
                    existing.severity = severity;
                    existing.recommended_strategy = severity.strategy();
                    existing.human_change = human_change.clone();
                    existing.agent_change = agent_change.clone();
                }
                continue;
            }

            debug!(
                file = %agent_change.file_path,
                human_file = %human_change.file_path,
                %severity,
                "conflict classified"
            );
            records.push(ConflictRecord {
                id: Uuid::new_v4().to_string(),
                file_path: agent_change.file_path.clone(),
                human_change: human_change.clone(),
                agent_change: agent_change.clone(),
                severity,
                recommended_strategy: severity.strategy(),
            });
        }

        if !records.is_empty() {
            info!(
                count = records.len(),
                overall = %Self::overall(&records),
                "conflicts detected"
            );
        }
        records
    }

    /// The most severe classification in a set of records.
    pub fn overall(records: &[ConflictRecord]) -> Severity {
        records
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(Severity::None)
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Normalized Levenshtein similarity in `[0, 1]`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    1.0 - prev[b.len()] as f64 / longest as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, ChangeKind, LineRange};

    fn event(path: &str, actor: Actor, after: &str, ranges: Vec<LineRange>) -> ChangeEvent {
        ChangeEvent::new(
            path,
            ChangeKind::Modify,
            Some("base".into()),
            Some(after.into()),
            actor,
        )
        .with_ranges(ranges)
    }

    #[test]
    fn test_overlapping_ranges_need_manual() {
        let d = ConflictDetector::default();
        let human = event("src/f.py", Actor::Human, "h", vec![LineRange::new(1, 5)]);
        let agent = event("src/f.py", Actor::Agent, "a", vec![LineRange::new(3, 8)]);
        assert_eq!(
            d.classify(&human, &agent),
            (Severity::OverlappingRange, Strategy::Manual)
        );
    }

    #[test]
    fn test_disjoint_ranges_are_same_file() {
        let d = ConflictDetector::default();
        let human = event("src/f.py", Actor::Human, "h", vec![LineRange::new(1, 2)]);
        let agent = event("src/f.py", Actor::Agent, "a", vec![LineRange::new(10, 12)]);
        assert_eq!(
            d.classify(&human, &agent),
            (Severity::SameFile, Strategy::Selective)
        );
    }

    #[test]
    fn test_missing_ranges_are_treated_as_overlapping() {
        let d = ConflictDetector::default();
        let human = event("f.bin", Actor::Human, "h", vec![]);
        let agent = event("f.bin", Actor::Agent, "a", vec![LineRange::new(1, 1)]);
        assert_eq!(d.classify(&human, &agent).0, Severity::OverlappingRange);
    }

    #[test]
    fn test_identical_results_do_not_conflict() {
        let d = ConflictDetector::default();
        let human = event("f.py", Actor::Human, "same", vec![LineRange::new(1, 1)]);
        let agent = event("f.py", Actor::Agent, "same", vec![LineRange::new(1, 1)]);
        assert_eq!(d.classify(&human, &agent).0, Severity::None);
    }

    #[test]
    fn test_related_files() {
        let d = ConflictDetector::default();
        let human = event("src/auth/login.py", Actor::Human, "h", vec![]);
        let agent = event("src/auth/token.py", Actor::Agent, "a", vec![]);
        assert_eq!(
            d.classify(&human, &agent),
            (Severity::RelatedFile, Strategy::Selective)
        );

        let human = event("lib/config.py", Actor::Human, "h", vec![]);
        let agent = event("tests/configs.py", Actor::Agent, "a", vec![]);
        assert_eq!(d.classify(&human, &agent).0, Severity::RelatedFile);

        let human = event("lib/config.py", Actor::Human, "h", vec![]);
        let agent = event("web/router.ts", Actor::Agent, "a", vec![]);
        assert_eq!(
            d.classify(&human, &agent),
            (Severity::None, Strategy::AutoMerge)
        );
    }

    #[test]
    fn test_detect_keeps_most_severe_per_agent_file() {
        let d = ConflictDetector::default();
        let human = vec![
            event("src/a.py", Actor::Human, "h1", vec![LineRange::new(1, 1)]),
            event("src/b.py", Actor::Human, "h2", vec![LineRange::new(5, 5)]),
        ];
        let agent = vec![
            event("src/b.py", Actor::Agent, "a1", vec![LineRange::new(5, 6)]),
            event("other/z.rs", Actor::Agent, "a2", vec![]),
        ];
        let records = d.detect(&human, &agent);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_path, "src/b.py");
        assert_eq!(records[0].human_change.file_path, "src/b.py");
        assert_eq!(records[0].severity, Severity::OverlappingRange);
        assert_eq!(ConflictDetector::overall(&records), Severity::OverlappingRange);
        assert_eq!(ConflictDetector::overall(&[]), Severity::None);
    }

    #[test]
    fn test_name_similarity() {
        assert_eq!(name_similarity("config", "config"), 1.0);
        assert!(name_similarity("config", "configs") >= 0.8);
        assert!(name_similarity("auth", "router") < 0.5);
        assert_eq!(file_stem("a/b/.env"), ".env");
        assert_eq!(file_stem("a/b/main.rs"), "main");
    }

    #[test]
    fn test_severity_display_and_order() {
        assert_eq!(Severity::OverlappingRange.to_string(), "overlapping-range");
        assert!(Severity::SameFile > Severity::RelatedFile);
        assert_eq!(Strategy::AutoMerge.to_string(), "auto-merge");
    }
}
