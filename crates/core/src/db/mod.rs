//! SQLite index for shadowsync.
//!
//! Everything stored here is either derived from the shadow repository (the
//! commit map, a projection of the commit notes) or bookkeeping the engine
//! can lose without losing history (sessions, file attribution, staged
//! resolutions, audit log). The queries live in [`queries`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// File name of the index inside the data directory.
pub const DB_FILE: &str = "shadowsync.db";

/// Handle to the index database.
///
/// One connection behind a `Mutex`, so the handle can be shared through an
/// `Arc` by the engine, the session registry and the mapper. File databases
/// run in WAL mode with a busy timeout so a CLI invocation and a running hook
/// do not trip over each other.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        info!(path = %path.display(), "index database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the index of a data directory and bring its schema up to date.
    pub fn open_in(data_dir: &Path) -> Result<Self, DatabaseError> {
        let db = Self::new(data_dir.join(DB_FILE))?;
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply pending migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("index schema current");
        Ok(())
    }

    /// Lock the connection. A poisoned lock is recovered: every write is a
    /// single statement or a transaction, so a panicking holder cannot leave
    /// a half-applied change behind.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("index connection lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction, committed only if `f` succeeds.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT_MAPPING: &str =
        "INSERT INTO commit_map (primary_commit, shadow_commit, created_at) VALUES (?1, ?2, ?3)";

    #[test]
    fn test_open_in_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join(".shadowsync");
        let db = Database::open_in(&data_dir).unwrap();
        assert!(data_dir.join(DB_FILE).is_file());
        assert_eq!(db.count_commit_map().unwrap(), 0);

        // Reopening an initialized index is a no-op migration.
        drop(db);
        Database::open_in(&data_dir).unwrap();
    }

    #[test]
    fn test_transaction_commits_on_success() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.transaction(|conn| {
            conn.execute(INSERT_MAPPING, rusqlite::params!["p1", "s1", "2025-01-01T00:00:00Z"])?;
            conn.execute(INSERT_MAPPING, rusqlite::params!["p1", "s2", "2025-01-01T00:00:01Z"])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.count_commit_map().unwrap(), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let result = db.transaction(|conn| {
            conn.execute(INSERT_MAPPING, rusqlite::params!["p1", "s1", "2025-01-01T00:00:00Z"])?;
            // Duplicate shadow commit violates the UNIQUE constraint.
            conn.execute(INSERT_MAPPING, rusqlite::params!["p2", "s1", "2025-01-01T00:00:01Z"])?;
            Ok(())
        });
        assert!(matches!(result, Err(DatabaseError::SqliteError(_))));
        assert_eq!(db.count_commit_map().unwrap(), 0);
    }
}
