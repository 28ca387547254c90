//! Path policy for the dual-tree synchronizer.
//!
//! Provides [`FilePolicy`] which encapsulates `max_file_size` and
//! `ignore_patterns` from [`SyncConfig`](crate::config::SyncConfig) and
//! decides which files take part in mirroring.
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Any path component is an always-excluded directory | `Ignored` |
//! | Path is at or below an excluded path (the data directory) | `Ignored` |
//! | Path matches an ignore pattern | `Ignored` |
//! | Size exceeds `max_file_size` (when > 0) | `Oversize` |
//! | None of the above | `Allow` |

use tracing::{debug, warn};

use crate::config::{SyncConfig, DATA_DIR_NAME};

/// Directory names never mirrored, whatever the configuration says.
const ALWAYS_EXCLUDED_DIRS: &[&str] = &[".git", DATA_DIR_NAME];

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a file against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePolicyDecision {
    /// File passes all checks.
    Allow,
    /// File matches an ignore pattern or lives in an excluded directory.
    Ignored { pattern: String },
    /// File exceeds the configured `max_file_size`.
    Oversize { size: u64, limit: u64 },
}

impl FilePolicyDecision {
    /// `true` if the file should be synced.
    pub fn should_sync(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Short human-readable label for audit/logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ignored { .. } => "ignored",
            Self::Oversize { .. } => "oversize",
        }
    }
}

// ---------------------------------------------------------------------------
// FilePolicy
// ---------------------------------------------------------------------------

/// Evaluates candidate files against size limits and ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct FilePolicy {
    /// Maximum allowed file size in bytes. 0 = no limit.
    max_file_size: u64,
    /// Glob patterns to exclude. Matched against the *relative* path.
    ignore_patterns: Vec<String>,
    /// Relative paths excluded with everything below them.
    excluded_paths: Vec<String>,
}

impl FilePolicy {
    /// Create a new `FilePolicy` from config values.
    pub fn new(max_file_size: u64, ignore_patterns: Vec<String>) -> Self {
        Self {
            max_file_size,
            ignore_patterns,
            excluded_paths: Vec::new(),
        }
    }

    /// Also exclude `rel_path` and everything below it.
    pub fn with_excluded_path(mut self, rel_path: impl Into<String>) -> Self {
        let path = rel_path.into().replace('\\', "/").trim_matches('/').to_string();
        if !path.is_empty() && !self.excluded_paths.contains(&path) {
            self.excluded_paths.push(path);
        }
        self
    }

    /// Should the walker descend into the directory at `rel_dir`?
    pub fn is_dir_excluded(&self, rel_dir: &str) -> bool {
        let name = rel_dir.rsplit('/').next().unwrap_or(rel_dir);
        ALWAYS_EXCLUDED_DIRS.contains(&name) || self.excluded_prefix(rel_dir).is_some()
    }

    fn excluded_prefix(&self, rel_path: &str) -> Option<&str> {
        self.excluded_paths
            .iter()
            .find(|p| {
                rel_path == p.as_str()
                    || rel_path
                        .strip_prefix(p.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|p| p.as_str())
    }

    /// Evaluate a file by its relative path and size.
    ///
    /// `rel_path` is the file's path relative to the tree root (forward-slash
    /// separated). `size` is the file size in bytes.
    pub fn evaluate(&self, rel_path: &str, size: u64) -> FilePolicyDecision {
        // 1. Excluded directories anywhere in the path.
        if let Some(dir) = rel_path
            .split('/')
            .find(|component| ALWAYS_EXCLUDED_DIRS.contains(component))
            .or_else(|| self.excluded_prefix(rel_path))
        {
            return FilePolicyDecision::Ignored {
                pattern: dir.to_string(),
            };
        }

        // 2. Ignore patterns.
        if let Some(pattern) = self.matching_pattern(rel_path) {
            debug!(path = rel_path, pattern, "file matches ignore pattern");
            return FilePolicyDecision::Ignored {
                pattern: pattern.to_string(),
            };
        }

        // 3. max_file_size (0 = unlimited).
        if self.max_file_size > 0 && size > self.max_file_size {
            warn!(
                path = rel_path,
                size,
                limit = self.max_file_size,
                "file exceeds max_file_size, skipping"
            );
            return FilePolicyDecision::Oversize {
                size,
                limit: self.max_file_size,
            };
        }

        FilePolicyDecision::Allow
    }

    /// Evaluate a path by name only (for files that may not exist on disk).
    pub fn is_path_ignored(&self, rel_path: &str) -> bool {
        matches!(
            self.evaluate(rel_path, 0),
            FilePolicyDecision::Ignored { .. }
        )
    }

    fn matching_pattern(&self, rel_path: &str) -> Option<&str> {
        let path = rel_path.replace('\\', "/");
        let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
        self.ignore_patterns
            .iter()
            .find(|pattern| {
                let pat = pattern.replace('\\', "/");
                // Bare patterns like `*.log` apply to the file name at any depth.
                glob_match::glob_match(&pat, &path)
                    || (!pat.contains('/') && glob_match::glob_match(&pat, &file_name))
            })
            .map(|p| p.as_str())
    }
}

impl From<&SyncConfig> for FilePolicy {
    fn from(config: &SyncConfig) -> Self {
        Self::new(config.max_file_size, config.ignore_patterns.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_when_no_constraints() {
        let policy = FilePolicy::new(0, vec![]);
        let decision = policy.evaluate("src/main.rs", 1024);
        assert_eq!(decision, FilePolicyDecision::Allow);
        assert!(decision.should_sync());
        assert_eq!(decision.label(), "allow");
    }

    #[test]
    fn test_always_excluded_dirs() {
        let policy = FilePolicy::new(0, vec![]);
        assert!(policy.is_path_ignored(".git/HEAD"));
        assert!(policy.is_path_ignored(".shadowsync/repo/file.py"));
        assert!(policy.is_path_ignored("vendor/.git/config"));
        assert!(!policy.is_path_ignored("src/git.rs"));
    }

    #[test]
    fn test_excluded_path_covers_subtree_only() {
        let policy = FilePolicy::new(0, vec![]).with_excluded_path("tools/shadow-data/");
        assert!(policy.is_path_ignored("tools/shadow-data/repo/a.py"));
        assert!(policy.is_dir_excluded("tools/shadow-data"));
        assert!(!policy.is_path_ignored("tools/shadow-data.md"));
        assert!(!policy.is_path_ignored("tools/other/a.py"));
        assert!(!policy.is_dir_excluded("tools"));
        assert!(policy.is_dir_excluded("vendor/.git"));
    }

    #[test]
    fn test_oversize_blocks_file() {
        let policy = FilePolicy::new(1000, vec![]);
        let decision = policy.evaluate("bigfile.bin", 2000);
        assert_eq!(
            decision,
            FilePolicyDecision::Oversize {
                size: 2000,
                limit: 1000
            }
        );
        assert!(!decision.should_sync());
        assert_eq!(policy.evaluate("exact.txt", 1000), FilePolicyDecision::Allow);
    }

    #[test]
    fn test_bare_pattern_matches_at_any_depth() {
        let policy = FilePolicy::new(0, vec!["*.log".into()]);
        assert!(policy.is_path_ignored("app.log"));
        assert!(policy.is_path_ignored("logs/deep/app.log"));
        assert!(!policy.is_path_ignored("app.txt"));
    }

    #[test]
    fn test_double_star_patterns() {
        let policy = FilePolicy::new(0, vec!["build/**".into(), "**/node_modules/**".into()]);
        assert!(policy.is_path_ignored("build/out/main.o"));
        assert!(policy.is_path_ignored("web/node_modules/react/index.js"));
        assert!(!policy.is_path_ignored("src/build.rs"));
    }

    #[test]
    fn test_from_sync_config() {
        let config = SyncConfig::default();
        let policy = FilePolicy::from(&config);
        assert!(policy.is_path_ignored("pkg/__pycache__/mod.cpython-311.pyc"));
        assert!(!policy.is_path_ignored("pkg/mod.py"));
    }
}
