//! Error types for the shadowsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, commit id, worktree) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A commit note exists but could not be decoded.
    #[error("invalid note on commit {sha}: {detail}")]
    InvalidNote { sha: String, detail: String },

    /// Another process held the shadow repository's writer lock too long.
    #[error("timed out after {waited_secs}s waiting for writer lock '{path}'")]
    LockTimeout { path: String, waited_secs: u64 },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the dual-tree synchronizer (the `SyncFailure` kind).
///
/// Every variant is fatal to the current pass and safe to retry: files are
/// replaced atomically, so a failed pass never leaves a partial write behind.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync pass is already running.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// An I/O failure while reading or mirroring a file.
    #[error("sync I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A path could not be expressed relative to its tree root.
    #[error("path '{0}' is outside the synchronized tree")]
    OutsideTree(String),

    /// Underlying Git error during sync.
    #[error("sync Git error: {0}")]
    GitError(#[from] GitError),

    /// Database error during sync.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// Mapping error while recording a sync commit.
    #[error("sync mapping error: {0}")]
    MappingError(#[from] MappingError),
}

impl SyncError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Mapping errors
// ---------------------------------------------------------------------------

/// Errors from the commit mapper.
#[derive(Debug, Error)]
pub enum MappingError {
    /// A shadow commit has no discoverable primary commit.
    ///
    /// Reported, not fatal: the caller rebuilds the index from the log.
    #[error("shadow commit {shadow_sha} has no discoverable primary commit: {detail}")]
    Inconsistency { shadow_sha: String, detail: String },

    /// A shadow commit is already mapped to a different primary commit.
    #[error("shadow commit {shadow_sha} is already mapped to {existing}, refusing {requested}")]
    ConflictingPrimary {
        shadow_sha: String,
        existing: String,
        requested: String,
    },

    /// Underlying Git error.
    #[error("mapping Git error: {0}")]
    GitError(#[from] GitError),

    /// Underlying database error.
    #[error("mapping database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Errors from the session boundary accumulator.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transcript was unreadable or empty; the session closes as a no-op.
    #[error("session {session_id} aborted: {detail}")]
    Abort { session_id: String, detail: String },

    /// A state-machine transition was invalid.
    #[error("invalid session state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// No session with this id is registered.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A session with this id already exists.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// Session ids name a branch and a worktree directory.
    #[error("invalid session id '{0}'")]
    InvalidId(String),

    /// The session cannot accept tool events in its current state.
    #[error("session {session_id} is {state}, not active")]
    NotActive { session_id: String, state: String },

    /// Only closed sessions can be applied to the primary tree.
    #[error("session {session_id} is {state}, not closed")]
    NotClosed { session_id: String, state: String },

    /// The session's work is already in the primary tree.
    #[error("session {0} is already applied; revert it before applying again")]
    AlreadyApplied(String),

    /// Only applied, unreverted sessions can be reverted.
    #[error("session {0} has no applied work to revert")]
    NotApplied(String),

    /// Underlying sync error (worktree fingerprinting, interrupted sync).
    #[error("session sync error: {0}")]
    SyncError(#[from] SyncError),

    /// Underlying Git error.
    #[error("session Git error: {0}")]
    GitError(#[from] GitError),

    /// Underlying mapping error.
    #[error("session mapping error: {0}")]
    MappingError(#[from] MappingError),

    /// Underlying database error.
    #[error("session database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict detection / resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Automatic resolution failed; the conflict requires manual resolution.
    #[error("conflict on '{file_path}' requires manual resolution: {outcome}")]
    Unresolved { file_path: String, outcome: String },

    /// The requested conflict ID was not found.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Attempted to resolve a conflict that is already resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// The conflict has no proposal that could be accepted.
    #[error("conflict {0} has no proposed resolution to accept")]
    NoProposal(String),

    /// The human edited the file after the proposal was staged.
    #[error("'{file_path}' changed since conflict {id} was staged; reject it and apply again")]
    HumanChanged { id: String, file_path: String },

    /// Three-way merge failed.
    #[error("three-way merge failed: {0}")]
    MergeFailed(String),

    /// Isolated workspace I/O failure.
    #[error("resolution workspace I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Database error when persisting conflict data.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// External agent errors
// ---------------------------------------------------------------------------

/// Errors from the external reasoning agent boundary.
///
/// Every variant is treated like a timeout by the resolver.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent could not be reached or spawned (`ExternalAgentUnavailable`).
    #[error("reasoning agent unavailable: {0}")]
    Unavailable(String),

    /// The agent ran but reported failure.
    #[error("reasoning agent failed (exit {exit_code}): {stderr}")]
    Failed { exit_code: i32, stderr: String },

    /// The agent returned nothing usable.
    #[error("reasoning agent returned an empty response")]
    EmptyResponse,
}

// ---------------------------------------------------------------------------
// Transcript errors
// ---------------------------------------------------------------------------

/// Errors from the transcript extractor.
#[derive(Debug, Error)]
pub enum TranscriptError {
    /// The transcript file could not be read.
    #[error("transcript unreadable at '{path}': {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON column could not be decoded.
    #[error("corrupt {entity} record {id}: {detail}")]
    Corrupt {
        entity: String,
        id: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
