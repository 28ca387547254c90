//! Commit mapper: bidirectional primary <-> shadow commit relationships.
//!
//! The durable store is the shadow repository itself: every shadow commit
//! carries a [`ShadowAnnotation`] note naming its primary commit. The SQLite
//! `commit_map` table is a projection of those notes for indexed lookups and
//! can be rebuilt from the log at any time with
//! [`CommitMapper::rebuild_from_log`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::errors::{GitError, MappingError};
use crate::git::GitClient;
use crate::models::{CommitMapping, ShadowAnnotation};

/// A shadow commit whose primary commit cannot be established from the log,
/// or whose index row disagrees with its note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInconsistency {
    pub shadow_sha: String,
    pub detail: String,
}

impl From<MappingInconsistency> for MappingError {
    fn from(value: MappingInconsistency) -> Self {
        MappingError::Inconsistency {
            shadow_sha: value.shadow_sha,
            detail: value.detail,
        }
    }
}

pub struct CommitMapper {
    db: Arc<Database>,
    author_name: String,
    author_email: String,
}

impl CommitMapper {
    pub fn new(db: Arc<Database>, author_name: &str, author_email: &str) -> Self {
        Self {
            db,
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
        }
    }

    /// Annotate `shadow_sha` with its primary commit and index the pair.
    ///
    /// The note is written first; a crash between the two steps leaves an
    /// index miss that [`find_primary_commit`](Self::find_primary_commit)
    /// repairs. Recording the same pair twice is a no-op; a second, different
    /// primary commit for one shadow commit is refused.
    pub fn record_mapping(
        &self,
        git: &GitClient,
        annotation: &ShadowAnnotation,
        shadow_sha: &str,
    ) -> Result<CommitMapping, MappingError> {
        let primary = annotation.primary_commit.as_str();

        if let Some(existing) = self.db.get_mapping_for_shadow(shadow_sha)? {
            if existing.primary_commit_id == primary {
                debug!(shadow = shadow_sha, "mapping already recorded");
                return Ok(existing);
            }
            return Err(MappingError::ConflictingPrimary {
                shadow_sha: shadow_sha.to_string(),
                existing: existing.primary_commit_id,
                requested: primary.to_string(),
            });
        }
        if let Some(noted) = self.read_annotation(git, shadow_sha)? {
            if noted.primary_commit != primary {
                return Err(MappingError::ConflictingPrimary {
                    shadow_sha: shadow_sha.to_string(),
                    existing: noted.primary_commit,
                    requested: primary.to_string(),
                });
            }
        }

        let json = serde_json::to_string_pretty(annotation).map_err(|e| GitError::InvalidNote {
            sha: shadow_sha.to_string(),
            detail: e.to_string(),
        })?;
        git.write_note(shadow_sha, &json, &self.author_name, &self.author_email)?;

        let mapping = CommitMapping {
            primary_commit_id: primary.to_string(),
            shadow_commit_id: shadow_sha.to_string(),
            session_id: annotation.session_id.clone(),
            created_at: annotation.created_at,
        };
        self.db.insert_commit_mapping(&mapping)?;
        info!(
            primary,
            shadow = shadow_sha,
            session = annotation.session_id.as_deref().unwrap_or("-"),
            "recorded commit mapping"
        );
        Ok(mapping)
    }

    /// Shadow commits recorded against a primary commit, oldest first.
    pub fn find_shadow_commits(&self, primary_sha: &str) -> Result<Vec<String>, MappingError> {
        Ok(self.db.list_shadow_for_primary(primary_sha)?)
    }

    /// The primary commit a shadow commit maps to.
    ///
    /// Answered from the index; on a miss the note is read and the index is
    /// repaired.
    pub fn find_primary_commit(
        &self,
        git: &GitClient,
        shadow_sha: &str,
    ) -> Result<Option<String>, MappingError> {
        if let Some(mapping) = self.db.get_mapping_for_shadow(shadow_sha)? {
            return Ok(Some(mapping.primary_commit_id));
        }
        let Some(annotation) = self.read_annotation(git, shadow_sha)? else {
            return Ok(None);
        };
        if annotation.primary_commit.is_empty() {
            return Ok(None);
        }
        warn!(shadow = shadow_sha, "index miss, repairing from note");
        self.db.insert_commit_mapping(&CommitMapping {
            primary_commit_id: annotation.primary_commit.clone(),
            shadow_commit_id: shadow_sha.to_string(),
            session_id: annotation.session_id.clone(),
            created_at: annotation.created_at,
        })?;
        Ok(Some(annotation.primary_commit))
    }

    /// Every shadow commit created while the primary tree was at one of
    /// `primary_range` (an ordered primary commit sequence). Results follow
    /// the primary order, then creation order.
    pub fn find_shadow_commits_between(
        &self,
        primary_range: &[String],
    ) -> Result<Vec<CommitMapping>, MappingError> {
        let position: HashMap<&str, usize> = primary_range
            .iter()
            .enumerate()
            .map(|(i, sha)| (sha.as_str(), i))
            .collect();
        let mut mappings = self.db.list_mappings_for_primaries(primary_range)?;
        // Stable sort keeps creation order within one primary commit.
        mappings.sort_by_key(|m| {
            position
                .get(m.primary_commit_id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });
        Ok(mappings)
    }

    /// Decode the annotation note on a shadow commit.
    pub fn read_annotation(
        &self,
        git: &GitClient,
        shadow_sha: &str,
    ) -> Result<Option<ShadowAnnotation>, MappingError> {
        let Some(raw) = git.read_note(shadow_sha)? else {
            return Ok(None);
        };
        let annotation = serde_json::from_str(&raw).map_err(|e| GitError::InvalidNote {
            sha: shadow_sha.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Some(annotation))
    }

    /// Rebuild the whole index from the notes on every shadow branch.
    ///
    /// Commits without a readable note are skipped (and reported by
    /// [`verify`](Self::verify)). Safe to re-run.
    pub fn rebuild_from_log(&self, git: &GitClient) -> Result<usize, MappingError> {
        let mut mappings = Vec::new();
        for sha in git.all_branch_commits()? {
            match self.read_annotation(git, &sha) {
                Ok(Some(annotation)) if !annotation.primary_commit.is_empty() => {
                    mappings.push(CommitMapping {
                        primary_commit_id: annotation.primary_commit,
                        shadow_commit_id: sha,
                        session_id: annotation.session_id,
                        created_at: annotation.created_at,
                    });
                }
                Ok(_) => debug!(shadow = %sha, "no usable annotation, skipping"),
                Err(e) => warn!(shadow = %sha, error = %e, "unreadable annotation, skipping"),
            }
        }
        let count = self.db.replace_commit_map(&mappings)?;
        let _ = self
            .db
            .set_state("last_index_rebuild_at", &Utc::now().to_rfc3339());
        info!(count, "rebuilt commit index from shadow log");
        Ok(count)
    }

    /// Report shadow commits whose note is missing, unreadable, names no
    /// primary commit, or disagrees with the index.
    pub fn verify(&self, git: &GitClient) -> Result<Vec<MappingInconsistency>, MappingError> {
        let mut problems = Vec::new();
        for sha in git.all_branch_commits()? {
            let annotation = match self.read_annotation(git, &sha) {
                Ok(Some(a)) => a,
                Ok(None) => {
                    problems.push(MappingInconsistency {
                        shadow_sha: sha,
                        detail: "missing annotation note".into(),
                    });
                    continue;
                }
                Err(e) => {
                    problems.push(MappingInconsistency {
                        shadow_sha: sha,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            if annotation.primary_commit.is_empty() {
                problems.push(MappingInconsistency {
                    shadow_sha: sha,
                    detail: "annotation names no primary commit".into(),
                });
                continue;
            }
            match self.db.get_mapping_for_shadow(&sha)? {
                Some(m) if m.primary_commit_id == annotation.primary_commit => {}
                Some(m) => problems.push(MappingInconsistency {
                    shadow_sha: sha,
                    detail: format!(
                        "index maps to {} but note says {}",
                        m.primary_commit_id, annotation.primary_commit
                    ),
                }),
                None => problems.push(MappingInconsistency {
                    shadow_sha: sha,
                    detail: "missing from index".into(),
                }),
            }
        }
        if !problems.is_empty() {
            warn!(count = problems.len(), "commit mapping inconsistencies found");
        }
        Ok(problems)
    }
}
