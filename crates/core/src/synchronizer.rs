//! Dual-tree synchronizer.
//!
//! Keeps the shadow working tree content-identical to the primary tree and
//! records [`ChangeEvent`]s for every delta it mirrors. Decisions are made on
//! content digests only. Every file is replaced with copy-then-rename, so a
//! failed pass leaves each file either fully old or fully new.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::conflict::merger::changed_line_ranges;
use crate::db::Database;
use crate::errors::SyncError;
use crate::file_policy::FilePolicy;
use crate::fsutil;
use crate::hasher;
use crate::models::{Actor, ChangeEvent, ChangeKind, Digest};

/// Relative path -> content digest for every synced file in a tree.
pub type TreeSnapshot = BTreeMap<String, Digest>;

/// What a session knew about a path before the agent's latest write.
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    /// Digest of the last version the session recorded (or the base version).
    pub digest: Option<Digest>,
    /// Text of the session's base version, used for line ranges.
    pub text: Option<String>,
}

/// Mirrors the primary tree into the shadow tree.
#[derive(Debug, Clone)]
pub struct DualTreeSynchronizer {
    primary_root: PathBuf,
    shadow_root: PathBuf,
    policy: FilePolicy,
}

impl DualTreeSynchronizer {
    pub fn new(primary_root: PathBuf, shadow_root: PathBuf, policy: FilePolicy) -> Self {
        Self {
            primary_root,
            shadow_root,
            policy,
        }
    }

    pub fn primary_root(&self) -> &Path {
        &self.primary_root
    }

    pub fn shadow_root(&self) -> &Path {
        &self.shadow_root
    }

    /// Fingerprint every synced file under `root`.
    pub fn snapshot(&self, root: &Path) -> Result<TreeSnapshot, SyncError> {
        let mut snapshot = TreeSnapshot::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                match entry.path().strip_prefix(root) {
                    Ok(rel) => !self.policy.is_dir_excluded(&fsutil::to_slash(rel)),
                    Err(_) => true,
                }
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                SyncError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| SyncError::OutsideTree(entry.path().display().to_string()))?;
            let rel = fsutil::to_slash(rel);
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let decision = self.policy.evaluate(&rel, size);
            if !decision.should_sync() {
                trace!(path = %rel, decision = decision.label(), "not mirrored");
                continue;
            }
            match hasher::fingerprint_file(entry.path()) {
                Ok(Some(digest)) => {
                    snapshot.insert(rel, digest);
                }
                // Deleted between the walk and the read.
                Ok(None) => {}
                Err(e) => return Err(SyncError::io(rel, e)),
            }
        }
        Ok(snapshot)
    }

    /// Paths whose content differs between the two trees (present on one
    /// side only counts as different).
    pub fn detect_divergence(&self) -> Result<BTreeSet<String>, SyncError> {
        let primary = self.snapshot(&self.primary_root)?;
        let shadow = self.snapshot(&self.shadow_root)?;
        Ok(diverging_paths(&primary, &shadow))
    }

    /// Copy every divergent path not in `owned` from the primary tree into
    /// the shadow tree and return one event per mirrored path.
    ///
    /// A path whose current primary content is exactly what an earlier
    /// [`apply_to_primary`](Self::apply_to_primary) wrote is attributed to the
    /// agent; everything else is a human change.
    pub fn sync_primary_to_shadow(
        &self,
        db: &Database,
        owned: &BTreeSet<String>,
    ) -> Result<Vec<ChangeEvent>, SyncError> {
        let primary = self.snapshot(&self.primary_root)?;
        let shadow = self.snapshot(&self.shadow_root)?;
        let divergent = diverging_paths(&primary, &shadow);

        let mut events = Vec::new();
        for path in divergent {
            if owned.contains(&path) {
                debug!(path = %path, "skipping path owned by an active session");
                continue;
            }
            let before = shadow.get(&path).cloned();
            let after = primary.get(&path).cloned();
            let Some(kind) = ChangeKind::classify(before.as_deref(), after.as_deref()) else {
                continue;
            };

            let actor = match db.get_file_state(&path)? {
                Some(state) if state.last_actor == Actor::Agent && state.digest == after => {
                    Actor::Agent
                }
                _ => Actor::Human,
            };

            let ranges = if kind == ChangeKind::Modify {
                self.text_ranges(&self.shadow_root.join(&path), &self.primary_root.join(&path))?
            } else {
                Vec::new()
            };

            self.mirror_one(&path, after.is_some())?;
            db.upsert_file_state(&path, after.as_deref(), actor, None)?;

            debug!(path = %path, %kind, %actor, "mirrored into shadow tree");
            events.push(ChangeEvent::new(path, kind, before, after, actor).with_ranges(ranges));
        }

        if !events.is_empty() {
            info!(count = events.len(), "primary tree mirrored into shadow tree");
        }
        Ok(events)
    }

    /// Record agent changes for `changed_paths` inside a session worktree.
    ///
    /// Paths may be absolute (inside the worktree or the primary tree) or
    /// relative. Only true content changes against the baseline produce an
    /// event. Nothing is ever copied into the primary tree.
    pub fn sync_shadow_to_agent(
        &self,
        worktree: &Path,
        changed_paths: &[String],
        baselines: &BTreeMap<String, Baseline>,
    ) -> Result<Vec<ChangeEvent>, SyncError> {
        let mut events = Vec::new();
        let mut seen = BTreeSet::new();
        for raw in changed_paths {
            let path = self.relativize(worktree, raw)?;
            if !seen.insert(path.clone()) {
                continue;
            }
            if self.policy.is_path_ignored(&path) {
                debug!(path = %path, "agent wrote an ignored path, not recording");
                continue;
            }

            let full = worktree.join(&path);
            let after = hasher::fingerprint_file(&full).map_err(|e| SyncError::io(&path, e))?;
            let baseline = baselines.get(&path).cloned().unwrap_or_default();
            let Some(kind) = ChangeKind::classify(baseline.digest.as_deref(), after.as_deref())
            else {
                debug!(path = %path, "no content change");
                continue;
            };

            let ranges = match (&baseline.text, kind) {
                (Some(base), ChangeKind::Modify) => {
                    match fsutil::read_text(&full).map_err(|e| SyncError::io(&path, e))? {
                        Some(current) => changed_line_ranges(base, &current),
                        None => Vec::new(),
                    }
                }
                _ => Vec::new(),
            };
            events.push(
                ChangeEvent::new(path, kind, baseline.digest, after, Actor::Agent)
                    .with_ranges(ranges),
            );
        }
        Ok(events)
    }

    /// Write agent-authored content into the primary tree, and mirror it into
    /// the shadow tree so the two stay identical. `None` deletes the file.
    ///
    /// This is only ever called on an explicit human request.
    pub fn apply_to_primary(
        &self,
        db: &Database,
        path: &str,
        content: Option<&[u8]>,
        session_id: &str,
    ) -> Result<ChangeEvent, SyncError> {
        let primary_path = self.primary_root.join(path);
        let shadow_path = self.shadow_root.join(path);
        let before =
            hasher::fingerprint_file(&primary_path).map_err(|e| SyncError::io(path, e))?;

        let after = match content {
            Some(bytes) => {
                fsutil::atomic_write(&primary_path, bytes).map_err(|e| SyncError::io(path, e))?;
                fsutil::atomic_write(&shadow_path, bytes).map_err(|e| SyncError::io(path, e))?;
                Some(hasher::fingerprint(bytes))
            }
            None => {
                fsutil::remove_file_if_exists(&self.primary_root, &primary_path)
                    .map_err(|e| SyncError::io(path, e))?;
                fsutil::remove_file_if_exists(&self.shadow_root, &shadow_path)
                    .map_err(|e| SyncError::io(path, e))?;
                None
            }
        };
        db.upsert_file_state(path, after.as_deref(), Actor::Agent, Some(session_id))?;

        let kind = ChangeKind::classify(before.as_deref(), after.as_deref())
            .unwrap_or(ChangeKind::Modify);
        info!(path, %kind, session_id, "applied agent change to primary tree");
        Ok(ChangeEvent::new(path, kind, before, after, Actor::Agent))
    }

    /// Copy primary paths into a session worktree (interrupted-session sync).
    pub fn copy_into_worktree(&self, worktree: &Path, paths: &[String]) -> Result<(), SyncError> {
        for path in paths {
            let src = self.primary_root.join(path);
            let dst = worktree.join(path);
            if src.is_file() {
                fsutil::atomic_copy(&src, &dst).map_err(|e| SyncError::io(path, e))?;
            } else {
                fsutil::remove_file_if_exists(worktree, &dst).map_err(|e| SyncError::io(path, e))?;
            }
        }
        Ok(())
    }

    /// Turn a tool-reported path into a tree-relative, slash-separated path.
    pub fn relativize(&self, worktree: &Path, raw: &str) -> Result<String, SyncError> {
        let candidate = Path::new(raw);
        let rel = if candidate.is_absolute() {
            candidate
                .strip_prefix(worktree)
                .or_else(|_| candidate.strip_prefix(&self.primary_root))
                .map_err(|_| SyncError::OutsideTree(raw.to_string()))?
                .to_path_buf()
        } else {
            candidate.to_path_buf()
        };
        let rel = fsutil::to_slash(&rel);
        if rel.is_empty() || rel.split('/').any(|c| c == "..") {
            return Err(SyncError::OutsideTree(raw.to_string()));
        }
        Ok(rel)
    }

    fn mirror_one(&self, path: &str, exists_in_primary: bool) -> Result<(), SyncError> {
        let dst = self.shadow_root.join(path);
        if exists_in_primary {
            fsutil::atomic_copy(&self.primary_root.join(path), &dst)
                .map_err(|e| SyncError::io(path, e))
        } else {
            fsutil::remove_file_if_exists(&self.shadow_root, &dst)
                .map_err(|e| SyncError::io(path, e))
        }
    }

    fn text_ranges(
        &self,
        before: &Path,
        after: &Path,
    ) -> Result<Vec<crate::models::LineRange>, SyncError> {
        let old = fsutil::read_text(before).map_err(|e| SyncError::io(before.display().to_string(), e))?;
        let new = fsutil::read_text(after).map_err(|e| SyncError::io(after.display().to_string(), e))?;
        match (old, new) {
            (Some(old), Some(new)) => Ok(changed_line_ranges(&old, &new)),
            _ => {
                warn!(path = %after.display(), "binary content, recording whole-file change");
                Ok(Vec::new())
            }
        }
    }
}

/// Paths whose digests differ between two snapshots.
pub fn diverging_paths(a: &TreeSnapshot, b: &TreeSnapshot) -> BTreeSet<String> {
    a.keys()
        .chain(b.keys())
        .filter(|path| a.get(*path) != b.get(*path))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Trees {
        _primary: tempfile::TempDir,
        _shadow: tempfile::TempDir,
        sync: DualTreeSynchronizer,
        db: Database,
    }

    fn trees(patterns: Vec<String>) -> Trees {
        let primary = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let sync = DualTreeSynchronizer::new(
            primary.path().to_path_buf(),
            shadow.path().to_path_buf(),
            FilePolicy::new(0, patterns),
        );
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        Trees {
            _primary: primary,
            _shadow: shadow,
            sync,
            db,
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        fsutil::atomic_write(&root.join(rel), content.as_bytes()).unwrap();
    }

    #[test]
    fn test_divergence_uses_content_not_timestamps() {
        let t = trees(vec![]);
        write(t.sync.primary_root(), "a.py", "x = 1\n");
        write(t.sync.shadow_root(), "a.py", "x = 1\n");
        assert!(t.sync.detect_divergence().unwrap().is_empty());

        write(t.sync.primary_root(), "b.py", "y = 2\n");
        write(t.sync.shadow_root(), "c.py", "z = 3\n");
        let divergent = t.sync.detect_divergence().unwrap();
        assert_eq!(
            divergent.into_iter().collect::<Vec<_>>(),
            vec!["b.py".to_string(), "c.py".to_string()]
        );
    }

    #[test]
    fn test_sync_classifies_and_is_idempotent() {
        let t = trees(vec![]);
        write(t.sync.shadow_root(), "old.py", "gone\n");
        write(t.sync.shadow_root(), "mod.py", "a\nb\nc\n");
        write(t.sync.primary_root(), "mod.py", "a\nB\nc\n");
        write(t.sync.primary_root(), "src/new.py", "new\n");

        let events = t.sync.sync_primary_to_shadow(&t.db, &BTreeSet::new()).unwrap();
        let kinds: Vec<(String, ChangeKind)> =
            events.iter().map(|e| (e.file_path.clone(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("mod.py".to_string(), ChangeKind::Modify),
                ("old.py".to_string(), ChangeKind::Delete),
                ("src/new.py".to_string(), ChangeKind::Create),
            ]
        );
        assert!(events.iter().all(|e| e.actor == Actor::Human));
        assert_eq!(events[0].line_ranges, vec![crate::models::LineRange::new(2, 2)]);

        assert!(t.sync.detect_divergence().unwrap().is_empty());
        assert!(!t.sync.shadow_root().join("old.py").exists());
        let again = t.sync.sync_primary_to_shadow(&t.db, &BTreeSet::new()).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_owned_paths_are_left_alone() {
        let t = trees(vec![]);
        write(t.sync.primary_root(), "agent.py", "human\n");
        write(t.sync.primary_root(), "free.py", "human\n");
        let owned: BTreeSet<String> = ["agent.py".to_string()].into();
        let events = t.sync.sync_primary_to_shadow(&t.db, &owned).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].file_path, "free.py");
        let left: Vec<String> = t.sync.detect_divergence().unwrap().into_iter().collect();
        assert_eq!(left, vec!["agent.py".to_string()]);
    }

    #[test]
    fn test_ignored_and_git_paths_are_skipped() {
        let t = trees(vec!["*.log".into()]);
        write(t.sync.primary_root(), "debug.log", "noise");
        write(t.sync.primary_root(), ".git/HEAD", "ref: refs/heads/main");
        write(t.sync.primary_root(), ".shadowsync/config.toml", "");
        let snapshot = t.sync.snapshot(t.sync.primary_root()).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_sync_shadow_to_agent_records_only_real_changes() {
        let t = trees(vec![]);
        let wt = tempfile::tempdir().unwrap();
        write(wt.path(), "auth.py", "def login():\n    return True\n");
        write(wt.path(), "same.py", "same\n");

        let mut baselines = BTreeMap::new();
        baselines.insert(
            "auth.py".to_string(),
            Baseline {
                digest: Some(hasher::fingerprint(b"def login():\n    pass\n")),
                text: Some("def login():\n    pass\n".into()),
            },
        );
        baselines.insert(
            "same.py".to_string(),
            Baseline {
                digest: Some(hasher::fingerprint(b"same\n")),
                text: Some("same\n".into()),
            },
        );

        let abs = wt.path().join("auth.py").display().to_string();
        let events = t
            .sync
            .sync_shadow_to_agent(
                wt.path(),
                &[abs, "same.py".into(), "auth.py".into()],
                &baselines,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].file_path, "auth.py");
        assert_eq!(events[0].kind, ChangeKind::Modify);
        assert_eq!(events[0].actor, Actor::Agent);
        assert_eq!(events[0].line_ranges, vec![crate::models::LineRange::new(2, 2)]);
        assert!(!t.sync.primary_root().join("auth.py").exists());
    }

    #[test]
    fn test_relativize_rejects_escapes() {
        let t = trees(vec![]);
        let wt = tempfile::tempdir().unwrap();
        assert!(matches!(
            t.sync.relativize(wt.path(), "/etc/passwd"),
            Err(SyncError::OutsideTree(_))
        ));
        assert!(t.sync.relativize(wt.path(), "../x.py").is_err());
        let inside_primary = t.sync.primary_root().join("pkg/mod.py");
        assert_eq!(
            t.sync
                .relativize(wt.path(), &inside_primary.display().to_string())
                .unwrap(),
            "pkg/mod.py"
        );
    }

    #[test]
    fn test_applied_agent_content_is_attributed_to_agent() {
        let t = trees(vec![]);
        let event = t
            .sync
            .apply_to_primary(&t.db, "gen.py", Some(b"generated\n"), "s-1")
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Create);
        assert_eq!(
            fs::read_to_string(t.sync.shadow_root().join("gen.py")).unwrap(),
            "generated\n"
        );
        assert!(t.sync.detect_divergence().unwrap().is_empty());

        // The human later edits the applied file: attribution flips back.
        write(t.sync.primary_root(), "gen.py", "edited\n");
        let events = t.sync.sync_primary_to_shadow(&t.db, &BTreeSet::new()).unwrap();
        assert_eq!(events[0].actor, Actor::Human);
    }
}
