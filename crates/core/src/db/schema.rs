//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS commit_map (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            primary_commit  TEXT NOT NULL,
            shadow_commit   TEXT NOT NULL UNIQUE,
            session_id      TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_commit_map_primary ON commit_map (primary_commit);
        CREATE INDEX IF NOT EXISTS idx_commit_map_session ON commit_map (session_id);

        CREATE TABLE IF NOT EXISTS sessions (
            session_id              TEXT PRIMARY KEY,
            state                   TEXT NOT NULL,
            start_time              TEXT NOT NULL,
            end_time                TEXT,
            primary_commit_at_start TEXT NOT NULL,
            primary_commit_current  TEXT NOT NULL,
            shadow_base_commit      TEXT NOT NULL,
            worktree_path           TEXT NOT NULL,
            branch_name             TEXT NOT NULL,
            shadow_commit           TEXT,
            reasoning               TEXT NOT NULL DEFAULT '[]',
            updated_at              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions (state);

        CREATE TABLE IF NOT EXISTS session_events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL REFERENCES sessions (session_id),
            file_path       TEXT NOT NULL,
            kind            TEXT NOT NULL CHECK (kind IN ('create', 'modify', 'delete')),
            actor           TEXT NOT NULL CHECK (actor IN ('human', 'agent')),
            hash_before     TEXT,
            hash_after      TEXT,
            line_ranges     TEXT NOT NULL DEFAULT '[]',
            recorded_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_session_events_session ON session_events (session_id);

        CREATE TABLE IF NOT EXISTS file_state (
            path        TEXT PRIMARY KEY,
            digest      TEXT,
            last_actor  TEXT NOT NULL CHECK (last_actor IN ('human', 'agent')),
            session_id  TEXT,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            session_id  TEXT,
            commit_sha  TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "conflict staging and resolution log",
        r#"
        CREATE TABLE IF NOT EXISTS conflicts (
            id                TEXT PRIMARY KEY,
            session_id        TEXT NOT NULL,
            file_path         TEXT NOT NULL,
            severity          TEXT NOT NULL,
            status            TEXT NOT NULL
                CHECK (status IN ('proposed', 'manual', 'accepted', 'rejected')),
            outcome           TEXT,
            base_content      TEXT,
            human_content     TEXT,
            agent_content     TEXT,
            proposed_content  TEXT,
            created_at        TEXT NOT NULL,
            resolved_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts (status);
        CREATE INDEX IF NOT EXISTS idx_conflicts_session ON conflicts (session_id);

        CREATE TABLE IF NOT EXISTS resolution_log (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            conflict_id  TEXT NOT NULL,
            file_path    TEXT NOT NULL,
            outcome      TEXT NOT NULL
                CHECK (outcome IN ('resolved', 'timed_out', 'rejected', 'syntax_invalid')),
            duration_ms  INTEGER NOT NULL,
            detail       TEXT,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_resolution_log_session ON resolution_log (session_id);
        "#,
    ),
    (
        3,
        "applied sessions and the primary content they replaced",
        r#"
        CREATE TABLE IF NOT EXISTS session_applies (
            session_id     TEXT PRIMARY KEY,
            applied_at     TEXT NOT NULL,
            reverted_at    TEXT,
            revert_commit  TEXT
        );

        CREATE TABLE IF NOT EXISTS applied_files (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL,
            file_path       TEXT NOT NULL,
            content_before  BLOB,
            digest_after    TEXT,
            shadow_commit   TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_applied_files_session ON applied_files (session_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
