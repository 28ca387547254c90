//! Domain model types used throughout shadowsync.
//!
//! These types bridge the synchronizer, the session accumulator, the commit
//! mapper, and the database layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A hex-encoded SHA-256 content digest.
pub type Digest = String;

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Kind of change to a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl ChangeKind {
    /// Classify a change from the digests on either side of it.
    ///
    /// Returns `None` when the two sides are identical (no change).
    pub fn classify(before: Option<&str>, after: Option<&str>) -> Option<Self> {
        match (before, after) {
            (None, None) => None,
            (None, Some(_)) => Some(Self::Create),
            (Some(_), None) => Some(Self::Delete),
            (Some(b), Some(a)) if b == a => None,
            (Some(_), Some(_)) => Some(Self::Modify),
        }
    }

    /// Parse a kind string.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Who made a change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Human,
    Agent,
}

impl Actor {
    /// Parse an actor string.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// An inclusive, 1-based line range of the *before* content of a file.
///
/// Pure insertions are recorded as the single point `[n, n]` where `n` is the
/// line the insertion follows (0 for the top of the file).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// `true` if the two ranges share at least one line.
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A single observed file mutation. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path relative to the tree root, forward-slash separated.
    pub file_path: String,
    pub kind: ChangeKind,
    pub content_hash_before: Option<Digest>,
    pub content_hash_after: Option<Digest>,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// Lines of the before content touched by this change. Empty means the
    /// whole file (create, delete, binary content).
    #[serde(default)]
    pub line_ranges: Vec<LineRange>,
}

impl ChangeEvent {
    pub fn new(
        file_path: impl Into<String>,
        kind: ChangeKind,
        content_hash_before: Option<Digest>,
        content_hash_after: Option<Digest>,
        actor: Actor,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            kind,
            content_hash_before,
            content_hash_after,
            actor,
            timestamp: Utc::now(),
            line_ranges: Vec::new(),
        }
    }

    pub fn with_ranges(mut self, ranges: Vec<LineRange>) -> Self {
        self.line_ranges = ranges;
        self
    }
}

/// One fragment of the agent's explanatory text, in transcript order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReasoningEvent {
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub ordinal: usize,
}

/// A tool-use notification from the agent lifecycle hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolEvent {
    pub tool_name: String,
    /// Paths the tool wrote, relative to the tree root.
    pub file_paths: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ToolEvent {
    pub fn new(tool_name: impl Into<String>, file_paths: Vec<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            file_paths,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// States of the session boundary state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Active,
    Interrupted,
    Closing,
    Closed,
    Aborted,
}

impl SessionState {
    /// Parse a state string into a `SessionState`.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "active" => Some(Self::Active),
            "interrupted" => Some(Self::Interrupted),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Whether the machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NotStarted, Active)
                | (Active, Closing)
                | (Active, Aborted)
                | (Active, Interrupted)
                | (Interrupted, Active)
                | (Closing, Closed)
                | (Closing, Aborted)
        )
    }

    /// The coarse status derived from the state.
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Closed => SessionStatus::Closed,
            Self::Aborted => SessionStatus::Aborted,
            _ => SessionStatus::Active,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Active => write!(f, "active"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Coarse session status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
    Aborted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A bounded period of agent activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Primary commit the session started from. The integration commit is
    /// mapped against this id.
    pub primary_commit_at_start: String,
    /// Primary commit the session is currently bound to (moves on interrupt).
    pub primary_commit_current: String,
    /// Shadow commit the session branch was cut from.
    pub shadow_base_commit: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub change_events: Vec<ChangeEvent>,
    pub reasoning_events: Vec<ReasoningEvent>,
    pub state: SessionState,
    pub shadow_commit: Option<String>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    /// Agent events, in record order.
    pub fn agent_events(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.change_events
            .iter()
            .filter(|e| e.actor == Actor::Agent)
    }

    /// Distinct files the agent touched, sorted.
    pub fn agent_files(&self) -> Vec<String> {
        let set: std::collections::BTreeSet<&str> =
            self.agent_events().map(|e| e.file_path.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Commit mapping & annotation
// ---------------------------------------------------------------------------

/// A link between a primary commit and a shadow commit. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitMapping {
    pub primary_commit_id: String,
    pub shadow_commit_id: String,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The outcome of one resolution attempt, as recorded in an annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionOutcomeRecord {
    pub conflict_id: String,
    pub file_path: String,
    pub outcome: ResolutionOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Canonical machine-readable record attached to every shadow commit as a
/// git note. Commit messages are a lossy rendering of this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowAnnotation {
    /// The primary commit this shadow commit maps to. For session commits
    /// this is the primary commit at session start.
    pub primary_commit: String,
    /// Primary commit at the time the shadow commit was written, when it
    /// differs from `primary_commit` (interrupted sessions).
    #[serde(default)]
    pub primary_commit_current: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub lines_added: usize,
    #[serde(default)]
    pub lines_modified: usize,
    #[serde(default)]
    pub lines_removed: usize,
    #[serde(default)]
    pub tool_uses: usize,
    #[serde(default)]
    pub resolutions: Vec<ResolutionOutcomeRecord>,
    pub created_at: DateTime<Utc>,
}

impl ShadowAnnotation {
    /// A minimal annotation for a human sync commit.
    pub fn for_sync(primary_commit: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            primary_commit: primary_commit.into(),
            primary_commit_current: None,
            session_id: None,
            files,
            reasoning: Vec::new(),
            lines_added: 0,
            lines_modified: 0,
            lines_removed: 0,
            tool_uses: 0,
            resolutions: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved,
    TimedOut,
    Rejected,
    SyntaxInvalid,
}

impl ResolutionOutcome {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "resolved" => Some(Self::Resolved),
            "timed_out" => Some(Self::TimedOut),
            "rejected" => Some(Self::Rejected),
            "syntax_invalid" => Some(Self::SyntaxInvalid),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Rejected => write!(f, "rejected"),
            Self::SyntaxInvalid => write!(f, "syntax_invalid"),
        }
    }
}

/// Status of a persisted pending resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// A validated proposal is staged and awaits human acceptance.
    Proposed,
    /// No usable proposal; the human must resolve by hand.
    Manual,
    Accepted,
    Rejected,
}

impl PendingStatus {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "proposed" => Self::Proposed,
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Manual,
        }
    }

    /// `true` once a human has acted on the record.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Manual => write!(f, "manual"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A staged proposal or manual-resolution requirement, with the human, agent,
/// and proposed content kept side by side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResolution {
    pub id: String,
    pub session_id: String,
    pub file_path: String,
    pub severity: String,
    pub status: PendingStatus,
    pub outcome: Option<ResolutionOutcome>,
    pub base_content: Option<String>,
    pub human_content: Option<String>,
    pub agent_content: Option<String>,
    pub proposed_content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}
