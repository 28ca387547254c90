//! Typed query helpers for every table in the shadowsync database.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    Actor, AuditEntry, ChangeEvent, ChangeKind, CommitMapping, LineRange, PendingResolution,
    PendingStatus, ReasoningEvent, ResolutionOutcome, ResolutionOutcomeRecord, Session,
    SessionState,
};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `file_state` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStateEntry {
    pub path: String,
    pub digest: Option<String>,
    pub last_actor: Actor,
    pub session_id: Option<String>,
    pub updated_at: String,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub session_id: Option<String>,
    pub commit_sha: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// A row from the `session_applies` table.
#[derive(Debug, Clone)]
pub struct SessionApply {
    pub session_id: String,
    pub applied_at: DateTime<Utc>,
    pub reverted_at: Option<DateTime<Utc>>,
    pub revert_commit: Option<String>,
}

/// A row from the `applied_files` table: one agent write into the primary
/// tree and the content it replaced (`None` = the file did not exist).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFile {
    pub session_id: String,
    pub file_path: String,
    pub content_before: Option<Vec<u8>>,
    pub digest_after: Option<String>,
    pub shadow_commit: String,
}

// ---------------------------------------------------------------------------
// Column decoding helpers
// ---------------------------------------------------------------------------

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown enum value '{0}'")]
struct UnknownValue(String);

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, UnknownValue(raw)))
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

const SESSION_COLUMNS: &str = "session_id, state, start_time, end_time, primary_commit_at_start,
     primary_commit_current, shadow_base_commit, worktree_path, branch_name, shadow_commit,
     reasoning";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let reasoning: Vec<ReasoningEvent> = json_col(row, 10)?;
    Ok(Session {
        session_id: row.get(0)?,
        state: enum_col(row, 1, SessionState::from_str_val)?,
        start_time: ts_col(row, 2)?,
        end_time: opt_ts_col(row, 3)?,
        primary_commit_at_start: row.get(4)?,
        primary_commit_current: row.get(5)?,
        shadow_base_commit: row.get(6)?,
        worktree_path: row.get(7)?,
        branch_name: row.get(8)?,
        shadow_commit: row.get(9)?,
        change_events: Vec::new(),
        reasoning_events: reasoning,
    })
}

const PENDING_COLUMNS: &str = "id, session_id, file_path, severity, status, outcome,
     base_content, human_content, agent_content, proposed_content, created_at, resolved_at";

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingResolution> {
    let status: String = row.get(4)?;
    let outcome: Option<String> = row.get(5)?;
    Ok(PendingResolution {
        id: row.get(0)?,
        session_id: row.get(1)?,
        file_path: row.get(2)?,
        severity: row.get(3)?,
        status: PendingStatus::from_str_val(&status),
        outcome: outcome.as_deref().and_then(ResolutionOutcome::from_str_val),
        base_content: row.get(6)?,
        human_content: row.get(7)?,
        agent_content: row.get(8)?,
        proposed_content: row.get(9)?,
        created_at: ts_col(row, 10)?,
        resolved_at: opt_ts_col(row, 11)?,
    })
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<CommitMapping> {
    Ok(CommitMapping {
        primary_commit_id: row.get(0)?,
        shadow_commit_id: row.get(1)?,
        session_id: row.get(2)?,
        created_at: ts_col(row, 3)?,
    })
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- commit_map ---------------------------------------------------------

    /// Insert a commit-map row. Fails on a duplicate shadow commit.
    pub fn insert_commit_mapping(&self, mapping: &CommitMapping) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO commit_map (primary_commit, shadow_commit, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                mapping.primary_commit_id,
                mapping.shadow_commit_id,
                mapping.session_id,
                mapping.created_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            id,
            primary = %mapping.primary_commit_id,
            shadow = %mapping.shadow_commit_id,
            "inserted commit_map entry"
        );
        Ok(id)
    }

    /// Look up the mapping row for a shadow commit.
    pub fn get_mapping_for_shadow(
        &self,
        shadow_commit: &str,
    ) -> Result<Option<CommitMapping>, DatabaseError> {
        let conn = self.conn();
        let mapping = conn
            .query_row(
                "SELECT primary_commit, shadow_commit, session_id, created_at
                 FROM commit_map WHERE shadow_commit = ?1",
                params![shadow_commit],
                mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    /// Shadow commits mapped to one primary commit, in creation order.
    pub fn list_shadow_for_primary(&self, primary_commit: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT shadow_commit FROM commit_map WHERE primary_commit = ?1 ORDER BY id")?;
        let shas = stmt
            .query_map(params![primary_commit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(shas)
    }

    /// All mappings for a set of primary commits, in creation order.
    pub fn list_mappings_for_primaries(
        &self,
        primary_commits: &[String],
    ) -> Result<Vec<CommitMapping>, DatabaseError> {
        if primary_commits.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; primary_commits.len()].join(", ");
        let sql = format!(
            "SELECT primary_commit, shadow_commit, session_id, created_at
             FROM commit_map WHERE primary_commit IN ({}) ORDER BY id",
            placeholders
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mappings = stmt
            .query_map(params_from_iter(primary_commits.iter()), mapping_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mappings)
    }

    /// Every mapping row, in creation order.
    pub fn list_commit_map(&self) -> Result<Vec<CommitMapping>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT primary_commit, shadow_commit, session_id, created_at
             FROM commit_map ORDER BY id",
        )?;
        let mappings = stmt
            .query_map([], mapping_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mappings)
    }

    /// Atomically replace the whole commit-map projection.
    pub fn replace_commit_map(&self, mappings: &[CommitMapping]) -> Result<usize, DatabaseError> {
        self.transaction(|conn| {
            conn.execute("DELETE FROM commit_map", [])?;
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO commit_map (primary_commit, shadow_commit, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut inserted = 0;
            for m in mappings {
                inserted += stmt.execute(params![
                    m.primary_commit_id,
                    m.shadow_commit_id,
                    m.session_id,
                    m.created_at.to_rfc3339()
                ])?;
            }
            Ok(inserted)
        })
    }

    /// Count commit-map rows.
    pub fn count_commit_map(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM commit_map", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- sessions -----------------------------------------------------------

    /// Insert a new session row (events are stored separately).
    pub fn insert_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (session_id, state, start_time, end_time, primary_commit_at_start,
                 primary_commit_current, shadow_base_commit, worktree_path, branch_name,
                 shadow_commit, reasoning, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.session_id,
                session.state.to_string(),
                session.start_time.to_rfc3339(),
                session.end_time.map(|t| t.to_rfc3339()),
                session.primary_commit_at_start,
                session.primary_commit_current,
                session.shadow_base_commit,
                session.worktree_path,
                session.branch_name,
                session.shadow_commit,
                to_json(&session.reasoning_events),
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(session_id = %session.session_id, "inserted session");
        Ok(())
    }

    /// Persist the mutable fields of a session.
    pub fn update_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET state = ?2, end_time = ?3, primary_commit_current = ?4,
                 shadow_commit = ?5, reasoning = ?6, updated_at = ?7
             WHERE session_id = ?1",
            params![
                session.session_id,
                session.state.to_string(),
                session.end_time.map(|t| t.to_rfc3339()),
                session.primary_commit_current,
                session.shadow_commit,
                to_json(&session.reasoning_events),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session".into(),
                id: session.session_id.clone(),
            });
        }
        Ok(())
    }

    /// Load a session with its events.
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, DatabaseError> {
        let session = {
            let conn = self.conn();
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()?
        };
        match session {
            Some(mut s) => {
                s.change_events = self.list_session_events(session_id)?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    /// Load every session in one of the given states, oldest first.
    pub fn list_sessions_in_states(
        &self,
        states: &[SessionState],
    ) -> Result<Vec<Session>, DatabaseError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM sessions WHERE state IN ({}) ORDER BY start_time, session_id",
            SESSION_COLUMNS, placeholders
        );
        let names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let mut sessions = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(names.iter()), session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for s in &mut sessions {
            s.change_events = self.list_session_events(&s.session_id)?;
        }
        Ok(sessions)
    }

    /// Load every session, newest first, without events.
    pub fn list_sessions(&self, limit: u32) -> Result<Vec<Session>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY start_time DESC LIMIT ?1",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![limit], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // -- session_events -----------------------------------------------------

    /// Append a change event to a session.
    pub fn insert_session_event(
        &self,
        session_id: &str,
        event: &ChangeEvent,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO session_events (session_id, file_path, kind, actor, hash_before,
                 hash_after, line_ranges, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                event.file_path,
                event.kind.to_string(),
                event.actor.to_string(),
                event.content_hash_before,
                event.content_hash_after,
                to_json(&event.line_ranges),
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events of a session, in record order.
    pub fn list_session_events(&self, session_id: &str) -> Result<Vec<ChangeEvent>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT file_path, kind, actor, hash_before, hash_after, line_ranges, recorded_at
             FROM session_events WHERE session_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![session_id], |row| {
                let ranges: Vec<LineRange> = json_col(row, 5)?;
                Ok(ChangeEvent {
                    file_path: row.get(0)?,
                    kind: enum_col(row, 1, ChangeKind::from_str_val)?,
                    actor: enum_col(row, 2, Actor::from_str_val)?,
                    content_hash_before: row.get(3)?,
                    content_hash_after: row.get(4)?,
                    line_ranges: ranges,
                    timestamp: ts_col(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // -- file_state ---------------------------------------------------------

    /// Record the last mutator and digest of a path.
    pub fn upsert_file_state(
        &self,
        path: &str,
        digest: Option<&str>,
        actor: Actor,
        session_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO file_state (path, digest, last_actor, session_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET digest = excluded.digest,
                 last_actor = excluded.last_actor, session_id = excluded.session_id,
                 updated_at = excluded.updated_at",
            params![path, digest, actor.to_string(), session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Look up the last known mutator of a path.
    pub fn get_file_state(&self, path: &str) -> Result<Option<FileStateEntry>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT path, digest, last_actor, session_id, updated_at
                 FROM file_state WHERE path = ?1",
                params![path],
                |row| {
                    Ok(FileStateEntry {
                        path: row.get(0)?,
                        digest: row.get(1)?,
                        last_actor: enum_col(row, 2, Actor::from_str_val)?,
                        session_id: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    // -- conflicts ----------------------------------------------------------

    /// Persist a pending resolution.
    pub fn insert_pending_resolution(&self, pending: &PendingResolution) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO conflicts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                PENDING_COLUMNS
            ),
            params![
                pending.id,
                pending.session_id,
                pending.file_path,
                pending.severity,
                pending.status.to_string(),
                pending.outcome.map(|o| o.to_string()),
                pending.base_content,
                pending.human_content,
                pending.agent_content,
                pending.proposed_content,
                pending.created_at.to_rfc3339(),
                pending.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!(id = %pending.id, path = %pending.file_path, status = %pending.status, "staged resolution");
        Ok(())
    }

    /// Look up a pending resolution by id.
    pub fn get_pending_resolution(&self, id: &str) -> Result<Option<PendingResolution>, DatabaseError> {
        let conn = self.conn();
        let pending = conn
            .query_row(
                &format!("SELECT {} FROM conflicts WHERE id = ?1", PENDING_COLUMNS),
                params![id],
                pending_from_row,
            )
            .optional()?;
        Ok(pending)
    }

    /// Resolutions still awaiting a human (`proposed` or `manual`), oldest first.
    pub fn list_open_resolutions(&self) -> Result<Vec<PendingResolution>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conflicts WHERE status IN ('proposed', 'manual') ORDER BY created_at, id",
            PENDING_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], pending_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every resolution staged for a session.
    pub fn list_resolutions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<PendingResolution>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conflicts WHERE session_id = ?1 ORDER BY created_at, id",
            PENDING_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![session_id], pending_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark a pending resolution as accepted or rejected.
    pub fn settle_pending_resolution(&self, id: &str, status: PendingStatus) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE conflicts SET status = ?2, resolved_at = ?3 WHERE id = ?1",
            params![id, status.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conflict".into(),
                id: id.into(),
            });
        }
        debug!(id, %status, "settled resolution");
        Ok(())
    }

    /// Count resolutions awaiting a human.
    pub fn count_open_resolutions(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE status IN ('proposed', 'manual')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Settle every open resolution of a session as rejected. Returns the
    /// ids it settled.
    pub fn reject_open_resolutions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let ids = {
            let mut stmt = conn.prepare(
                "SELECT id FROM conflicts
                 WHERE session_id = ?1 AND status IN ('proposed', 'manual') ORDER BY created_at, id",
            )?;
            let ids = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        conn.execute(
            "UPDATE conflicts SET status = 'rejected', resolved_at = ?2
             WHERE session_id = ?1 AND status IN ('proposed', 'manual')",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(ids)
    }

    // -- session_applies / applied_files ------------------------------------

    /// Look up the apply record of a session.
    pub fn get_session_apply(&self, session_id: &str) -> Result<Option<SessionApply>, DatabaseError> {
        let conn = self.conn();
        let apply = conn
            .query_row(
                "SELECT session_id, applied_at, reverted_at, revert_commit
                 FROM session_applies WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionApply {
                        session_id: row.get(0)?,
                        applied_at: ts_col(row, 1)?,
                        reverted_at: opt_ts_col(row, 2)?,
                        revert_commit: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(apply)
    }

    /// Mark a session applied, clearing an earlier revert.
    pub fn record_session_apply(&self, session_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO session_applies (session_id, applied_at) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET applied_at = excluded.applied_at,
                 reverted_at = NULL, revert_commit = NULL",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Mark an applied session reverted.
    pub fn mark_session_reverted(
        &self,
        session_id: &str,
        revert_commit: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE session_applies SET reverted_at = ?2, revert_commit = ?3 WHERE session_id = ?1",
            params![session_id, Utc::now().to_rfc3339(), revert_commit],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session apply".into(),
                id: session_id.into(),
            });
        }
        Ok(())
    }

    /// Record one agent write into the primary tree.
    pub fn insert_applied_file(&self, file: &AppliedFile) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO applied_files
                (session_id, file_path, content_before, digest_after, shadow_commit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file.session_id,
                file.file_path,
                file.content_before,
                file.digest_after,
                file.shadow_commit,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Agent writes of a session, in the order they happened.
    pub fn list_applied_files(&self, session_id: &str) -> Result<Vec<AppliedFile>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, file_path, content_before, digest_after, shadow_commit
             FROM applied_files WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(AppliedFile {
                    session_id: row.get(0)?,
                    file_path: row.get(1)?,
                    content_before: row.get(2)?,
                    digest_after: row.get(3)?,
                    shadow_commit: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Forget the writes of an earlier, reverted apply.
    pub fn clear_applied_files(&self, session_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM applied_files WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    // -- resolution_log -----------------------------------------------------

    /// Log the outcome and duration of a resolution attempt.
    pub fn insert_resolution_log(
        &self,
        session_id: &str,
        record: &ResolutionOutcomeRecord,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO resolution_log (session_id, conflict_id, file_path, outcome, duration_ms,
                 detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                record.conflict_id,
                record.file_path,
                record.outcome.to_string(),
                record.duration_ms as i64,
                record.detail,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Resolution outcomes logged for a session, in order.
    pub fn list_resolution_log(
        &self,
        session_id: &str,
    ) -> Result<Vec<ResolutionOutcomeRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT conflict_id, file_path, outcome, duration_ms, detail
             FROM resolution_log WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let duration: i64 = row.get(3)?;
                Ok(ResolutionOutcomeRecord {
                    conflict_id: row.get(0)?,
                    file_path: row.get(1)?,
                    outcome: enum_col(row, 2, ResolutionOutcome::from_str_val)?,
                    duration_ms: duration.max(0) as u64,
                    detail: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        session_id: Option<&str>,
        commit_sha: Option<&str>,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, session_id, commit_sha, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![action, session_id, commit_sha, details, success as i32, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        self.insert_audit_log(&entry.action, None, None, Some(&entry.details), entry.success)
    }

    /// List recent audit-log entries.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, session_id, commit_sha, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                let success: i32 = row.get(5)?;
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    session_id: row.get(2)?,
                    commit_sha: row.get(3)?,
                    details: row.get(4)?,
                    success: success != 0,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a value from the key-value state store.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Upsert a value in the key-value state store.
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShadowAnnotation;

    fn test_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn mapping(primary: &str, shadow: &str, session: Option<&str>) -> CommitMapping {
        CommitMapping {
            primary_commit_id: primary.into(),
            shadow_commit_id: shadow.into(),
            session_id: session.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    fn sample_session(id: &str) -> Session {
        Session {
            session_id: id.into(),
            start_time: Utc::now(),
            end_time: None,
            primary_commit_at_start: "c1".into(),
            primary_commit_current: "c1".into(),
            shadow_base_commit: "s0".into(),
            worktree_path: "/tmp/wt".into(),
            branch_name: format!("session/{}", id),
            change_events: Vec::new(),
            reasoning_events: Vec::new(),
            state: SessionState::Active,
            shadow_commit: None,
        }
    }

    #[test]
    fn test_commit_map_lookups() {
        let db = test_db();
        db.insert_commit_mapping(&mapping("p1", "s1", None)).unwrap();
        db.insert_commit_mapping(&mapping("p1", "s2", Some("sess"))).unwrap();
        db.insert_commit_mapping(&mapping("p2", "s3", None)).unwrap();

        assert_eq!(db.list_shadow_for_primary("p1").unwrap(), vec!["s1", "s2"]);
        let m = db.get_mapping_for_shadow("s2").unwrap().unwrap();
        assert_eq!(m.primary_commit_id, "p1");
        assert_eq!(m.session_id.as_deref(), Some("sess"));
        assert!(db.get_mapping_for_shadow("nope").unwrap().is_none());

        let range = db
            .list_mappings_for_primaries(&["p2".to_string(), "p1".to_string()])
            .unwrap();
        assert_eq!(range.len(), 3);
        assert!(db.list_mappings_for_primaries(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_replace_commit_map() {
        let db = test_db();
        db.insert_commit_mapping(&mapping("old", "s-old", None)).unwrap();
        let inserted = db
            .replace_commit_map(&[mapping("p1", "s1", None), mapping("p1", "s1", None)])
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.count_commit_map().unwrap(), 1);
        assert!(db.get_mapping_for_shadow("s-old").unwrap().is_none());
    }

    #[test]
    fn test_session_round_trip_with_events() {
        let db = test_db();
        let mut session = sample_session("s-1");
        db.insert_session(&session).unwrap();

        let event = ChangeEvent::new("src/auth.py", ChangeKind::Modify, Some("a".into()), Some("b".into()), Actor::Agent)
            .with_ranges(vec![LineRange::new(3, 8)]);
        db.insert_session_event("s-1", &event).unwrap();

        session.state = SessionState::Closed;
        session.shadow_commit = Some("abc".into());
        session.reasoning_events = vec![ReasoningEvent {
            text: "plan auth".into(),
            timestamp: None,
            ordinal: 0,
        }];
        db.update_session(&session).unwrap();

        let loaded = db.get_session("s-1").unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Closed);
        assert_eq!(loaded.shadow_commit.as_deref(), Some("abc"));
        assert_eq!(loaded.change_events.len(), 1);
        assert_eq!(loaded.change_events[0].line_ranges, vec![LineRange::new(3, 8)]);
        assert_eq!(loaded.reasoning_events[0].text, "plan auth");
    }

    #[test]
    fn test_list_sessions_in_states() {
        let db = test_db();
        db.insert_session(&sample_session("a")).unwrap();
        let mut closed = sample_session("b");
        closed.state = SessionState::Closed;
        db.insert_session(&closed).unwrap();

        let active = db
            .list_sessions_in_states(&[SessionState::Active, SessionState::Interrupted])
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "a");
        assert_eq!(db.list_sessions(10).unwrap().len(), 2);
    }

    #[test]
    fn test_update_missing_session() {
        let db = test_db();
        let result = db.update_session(&sample_session("ghost"));
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn test_file_state_upsert() {
        let db = test_db();
        db.upsert_file_state("a.py", Some("d1"), Actor::Human, None).unwrap();
        db.upsert_file_state("a.py", Some("d2"), Actor::Agent, Some("s")).unwrap();
        let entry = db.get_file_state("a.py").unwrap().unwrap();
        assert_eq!(entry.digest.as_deref(), Some("d2"));
        assert_eq!(entry.last_actor, Actor::Agent);
        assert!(db.get_file_state("b.py").unwrap().is_none());
    }

    #[test]
    fn test_pending_resolution_lifecycle() {
        let db = test_db();
        let pending = PendingResolution {
            id: "r1".into(),
            session_id: "s".into(),
            file_path: "f.py".into(),
            severity: "overlapping-range".into(),
            status: PendingStatus::Proposed,
            outcome: Some(ResolutionOutcome::Resolved),
            base_content: Some("base".into()),
            human_content: Some("human".into()),
            agent_content: Some("agent".into()),
            proposed_content: Some("merged".into()),
            created_at: Utc::now(),
            resolved_at: None,
        };
        db.insert_pending_resolution(&pending).unwrap();
        assert_eq!(db.count_open_resolutions().unwrap(), 1);

        db.settle_pending_resolution("r1", PendingStatus::Accepted).unwrap();
        let loaded = db.get_pending_resolution("r1").unwrap().unwrap();
        assert_eq!(loaded.status, PendingStatus::Accepted);
        assert!(loaded.resolved_at.is_some());
        assert_eq!(db.count_open_resolutions().unwrap(), 0);
        assert_eq!(db.list_resolutions_for_session("s").unwrap().len(), 1);
    }

    #[test]
    fn test_session_apply_and_revert_records() {
        let db = test_db();
        assert!(db.get_session_apply("s").unwrap().is_none());
        assert!(db.mark_session_reverted("s", None).is_err());

        db.insert_applied_file(&AppliedFile {
            session_id: "s".into(),
            file_path: "a.py".into(),
            content_before: Some(b"x = 1\n".to_vec()),
            digest_after: Some("d1".into()),
            shadow_commit: "c1".into(),
        })
        .unwrap();
        db.insert_applied_file(&AppliedFile {
            session_id: "s".into(),
            file_path: "new.py".into(),
            content_before: None,
            digest_after: Some("d2".into()),
            shadow_commit: "c1".into(),
        })
        .unwrap();
        db.record_session_apply("s").unwrap();

        let files = db.list_applied_files("s").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].content_before.as_deref(), Some(&b"x = 1\n"[..]));
        assert!(files[1].content_before.is_none());

        db.mark_session_reverted("s", Some("c2")).unwrap();
        let apply = db.get_session_apply("s").unwrap().unwrap();
        assert!(apply.reverted_at.is_some());
        assert_eq!(apply.revert_commit.as_deref(), Some("c2"));

        // Applying again clears the revert.
        db.clear_applied_files("s").unwrap();
        db.record_session_apply("s").unwrap();
        assert!(db.get_session_apply("s").unwrap().unwrap().reverted_at.is_none());
        assert!(db.list_applied_files("s").unwrap().is_empty());
    }

    #[test]
    fn test_resolution_log() {
        let db = test_db();
        let record = ResolutionOutcomeRecord {
            conflict_id: "c".into(),
            file_path: "f.py".into(),
            outcome: ResolutionOutcome::TimedOut,
            duration_ms: 60_000,
            detail: None,
        };
        db.insert_resolution_log("s", &record).unwrap();
        assert_eq!(db.list_resolution_log("s").unwrap(), vec![record]);
    }

    #[test]
    fn test_audit_and_state() {
        let db = test_db();
        db.insert_audit_entry(&AuditEntry::failure("sync", "boom")).unwrap();
        db.insert_audit_log("session_close", Some("s"), Some("abc"), None, true)
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "session_close");
        assert!(!entries[1].success);

        db.set_state("last_sync_at", "x").unwrap();
        db.set_state("last_sync_at", "y").unwrap();
        assert_eq!(db.get_state("last_sync_at").unwrap().as_deref(), Some("y"));

        let _ = ShadowAnnotation::for_sync("p", vec![]);
    }
}
