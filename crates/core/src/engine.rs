//! The shadowsync engine.
//!
//! [`ShadowEngine`] owns the shared resources (the shadow repository behind
//! the writer lock, the database, the synchronizer, mapper, session
//! accumulator and conflict resolver) and exposes the lifecycle triggers:
//!
//! 1. `init` / `open` the shadow repository for a primary tree.
//! 2. `sync` mirrors human changes and commits them on the shadow main branch.
//! 3. `session_start` / `record_tool_use` / `session_end` drive one agent
//!    session into one shadow commit.
//! 4. `apply_session` brings agent work into the primary tree on explicit
//!    request, detecting and resolving conflicts with human edits.
//!    `revert_session` takes it back out again.
//!
//! A process-wide flag prevents overlapping sync passes within one engine.
//! Every shadow commit and note write holds the [`ShadowWriter`] lock, which
//! also excludes other processes; index reads go straight to SQLite.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::conflict::detector::{ConflictDetector, ConflictRecord, Severity};
use crate::conflict::merger::{self, Merger};
use crate::conflict::resolver::{ConflictResolver, ResolutionRequest};
use crate::db::queries::AppliedFile;
use crate::db::Database;
use crate::errors::{ConflictError, CoreError, GitError, SessionError, SyncError};
use crate::file_policy::FilePolicy;
use crate::fsutil;
use crate::git::{GitClient, ShadowWriter};
use crate::hasher;
use crate::mapper::{CommitMapper, MappingInconsistency};
use crate::models::{
    Actor, AuditEntry, ChangeEvent, ChangeKind, PendingResolution, PendingStatus,
    ResolutionOutcome, ResolutionOutcomeRecord, Session, SessionState, ShadowAnnotation,
    ToolEvent,
};
use crate::session::commit_format;
use crate::session::{CommitIdentity, SessionAccumulator, SessionRegistry};
use crate::synchronizer::DualTreeSynchronizer;

const REPO_DIR: &str = "repo";
const SESSIONS_DIR: &str = "sessions";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub primary_commit: String,
    pub events: Vec<ChangeEvent>,
    pub shadow_commit: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Result of a recorded tool use.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUseReport {
    pub events: Vec<ChangeEvent>,
    /// `true` if primary HEAD had moved and the session was re-synced first.
    pub interrupted: bool,
}

/// Result of applying a closed session to the primary tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub session_id: String,
    /// Agent content written as-is (includes `related`).
    pub applied: Vec<String>,
    /// Clean three-way merges of disjoint edits written.
    pub merged: Vec<String>,
    /// Written, but next to a related human change: worth a look.
    pub related: Vec<String>,
    /// Conflicts left for a human decision.
    pub staged: Vec<PendingResolution>,
    pub outcomes: Vec<ResolutionOutcomeRecord>,
    pub shadow_commit: Option<String>,
}

/// Result of reverting an applied session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevertReport {
    pub session_id: String,
    /// Files put back to their content before the apply.
    pub restored: Vec<String>,
    /// Files changed again after the apply; left as they are.
    pub kept: Vec<String>,
    /// Staged resolutions of the session that were withdrawn.
    pub withdrawn: Vec<String>,
    pub shadow_commit: Option<String>,
}

/// A shadow commit found for a primary commit.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowMatch {
    pub primary_commit: String,
    pub shadow_commit: String,
    pub session_id: Option<String>,
    /// First line of the shadow commit message.
    pub summary: String,
    pub files: Vec<String>,
}

/// Result of a mapping consistency check.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub inconsistencies: Vec<(String, String)>,
    /// Rows in the rebuilt index, when a rebuild ran.
    pub rebuilt: Option<usize>,
}

/// Snapshot of the engine state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub primary_root: PathBuf,
    pub data_dir: PathBuf,
    pub primary_head: Option<String>,
    pub shadow_tip: Option<String>,
    pub sync_state: String,
    pub last_sync_at: Option<String>,
    pub active_sessions: Vec<Session>,
    pub open_resolutions: Vec<PendingResolution>,
    pub divergent_paths: usize,
    pub commit_mappings: i64,
}

/// One side-by-side file change between two shadow commits.
struct NetChange {
    event: ChangeEvent,
    before: Option<Vec<u8>>,
    after: Option<Vec<u8>>,
}

/// What `apply_session` decided for one file.
enum Decision {
    Write(Option<Vec<u8>>),
    Merge(String),
    Stage(PendingResolution, Option<ResolutionOutcomeRecord>),
}

/// Why agent content is being landed in the primary tree.
enum Landing {
    Apply(Vec<ResolutionOutcomeRecord>),
    Revert,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ShadowEngine {
    config: AppConfig,
    primary_root: PathBuf,
    data_dir: PathBuf,
    db: Arc<Database>,
    shadow: Arc<ShadowWriter>,
    synchronizer: Arc<DualTreeSynchronizer>,
    mapper: Arc<CommitMapper>,
    sessions: SessionAccumulator,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    /// Atomic flag preventing overlapping sync passes.
    running: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl ShadowEngine {
    /// Create the shadow repository for `primary_root` and mirror the
    /// primary tree into its first commit, mapped to primary HEAD.
    ///
    /// Opening an already initialized tree is not an error.
    pub async fn init(primary_root: &Path, config: AppConfig) -> Result<Self, CoreError> {
        let primary = GitClient::new(primary_root)?;
        let head = primary
            .head_sha_opt()?
            .ok_or_else(|| GitError::RefNotFound("primary HEAD (no commits yet)".into()))?;

        let data_dir = config.shadow.data_dir_for(primary_root);
        let repo_dir = data_dir.join(REPO_DIR);
        if repo_dir.join(".git").exists() {
            info!(path = %repo_dir.display(), "shadow repository already initialized");
            return Self::open_with(primary_root, config);
        }

        std::fs::create_dir_all(&data_dir)
            .map_err(|e| SyncError::io(data_dir.display().to_string(), e))?;
        // The config always lives at the fixed location so `open` can find a
        // relocated data directory.
        let config_path = AppConfig::path_for_primary(primary_root);
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SyncError::io(parent.display().to_string(), e))?;
            }
            fsutil::atomic_write(&config_path, config.to_file_contents()?.as_bytes())
                .map_err(|e| SyncError::io(config_path.display().to_string(), e))?;
        }
        let mut excluded: Vec<String> = config
            .shadow
            .data_dir_in_tree(primary_root)
            .into_iter()
            .collect();
        if let Some(pointer) = config_path
            .parent()
            .and_then(|p| p.strip_prefix(primary_root).ok())
        {
            excluded.push(fsutil::to_slash(pointer));
        }
        exclude_from_primary(&primary, &excluded)?;

        let shadow = GitClient::init(&repo_dir, &config.shadow.shadow_branch)?;
        let db = Database::open_in(&data_dir)?;
        let engine = Self::assemble(primary_root, data_dir, config, db, shadow);

        let report = engine.sync().await?;
        info!(
            primary = %head,
            shadow = report.shadow_commit.as_deref().unwrap_or("-"),
            files = report.events.len(),
            "shadow repository initialized"
        );
        let _ = engine.db.insert_audit_entry(&AuditEntry::success(
            "init",
            &format!("mirrored {} files at {}", report.events.len(), head),
        ));
        Ok(engine)
    }

    /// Open the shadow repository of an initialized primary tree, reading
    /// `.shadowsync/config.toml` under the primary root.
    pub fn open(primary_root: &Path) -> Result<Self, CoreError> {
        let config = AppConfig::load_for_primary(primary_root)?;
        Self::open_with(primary_root, config)
    }

    pub fn open_with(primary_root: &Path, config: AppConfig) -> Result<Self, CoreError> {
        let data_dir = config.shadow.data_dir_for(primary_root);
        let repo_dir = data_dir.join(REPO_DIR);
        if !repo_dir.join(".git").exists() {
            return Err(GitError::RepositoryNotFound(repo_dir.display().to_string()).into());
        }
        let shadow = GitClient::new(&repo_dir)?;
        let db = Database::open_in(&data_dir)?;
        Ok(Self::assemble(primary_root, data_dir, config, db, shadow))
    }

    fn assemble(
        primary_root: &Path,
        data_dir: PathBuf,
        config: AppConfig,
        db: Database,
        shadow: GitClient,
    ) -> Self {
        let db = Arc::new(db);
        let shadow = Arc::new(ShadowWriter::new(
            shadow,
            &data_dir,
            Duration::from_secs(config.shadow.lock_timeout_secs),
        ));
        let mut policy = FilePolicy::from(&config.sync);
        if let Some(rel) = config.shadow.data_dir_in_tree(primary_root) {
            policy = policy.with_excluded_path(rel);
        }
        let synchronizer = Arc::new(DualTreeSynchronizer::new(
            primary_root.to_path_buf(),
            data_dir.join(REPO_DIR),
            policy,
        ));
        let mapper = Arc::new(CommitMapper::new(
            db.clone(),
            &config.shadow.author_name,
            &config.shadow.author_email,
        ));
        let sessions = SessionAccumulator::new(
            SessionRegistry::new(db.clone()),
            synchronizer.clone(),
            mapper.clone(),
            shadow.clone(),
            config.shadow.shadow_branch.clone(),
            data_dir.join(SESSIONS_DIR),
            CommitIdentity {
                name: config.shadow.author_name.clone(),
                email: config.shadow.author_email.clone(),
            },
            config.session.clone(),
        );
        Self {
            detector: ConflictDetector::new(config.conflict.related_name_threshold),
            resolver: ConflictResolver::from_config(&config.agent),
            primary_root: primary_root.to_path_buf(),
            data_dir,
            db,
            shadow,
            synchronizer,
            mapper,
            sessions,
            config,
            running: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        }
    }

    /// Replace the conflict resolver (agent and deadline).
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn primary_root(&self) -> &Path {
        &self.primary_root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn mapper(&self) -> &CommitMapper {
        &self.mapper
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.sessions.registry()
    }

    /// The writer lock around the shadow repository.
    pub fn shadow(&self) -> Arc<ShadowWriter> {
        self.shadow.clone()
    }

    /// Abort every resolution attempt waiting on the agent.
    pub fn cancel_resolutions(&self) {
        self.resolver.cancel_in_flight();
    }

    fn primary_head(&self) -> Result<String, CoreError> {
        let primary = GitClient::new(&self.primary_root)?;
        Ok(primary
            .head_sha_opt()?
            .ok_or_else(|| GitError::RefNotFound("primary HEAD".into()))?)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Run one sync pass: mirror the primary tree into the shadow tree and
    /// commit the human changes on the shadow main branch.
    ///
    /// Idempotent: a second pass with no intervening edits records nothing.
    pub async fn sync(&self) -> Result<SyncReport, CoreError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning {
                started_at: self.started_at.to_rfc3339(),
            }
            .into());
        }
        let _guard = SyncLockGuard(self.running.clone());

        let started_at = Utc::now();
        let _ = self.db.set_state("sync_state", "syncing");
        let result = self.sync_pass(started_at).await;

        let (state, audit) = match &result {
            Ok(report) => (
                "idle",
                AuditEntry::success(
                    "sync",
                    &format!(
                        "{} events, commit {}",
                        report.events.len(),
                        report.shadow_commit.as_deref().unwrap_or("-")
                    ),
                ),
            ),
            Err(e) => ("error", AuditEntry::failure("sync", &e.to_string())),
        };
        let _ = self.db.set_state("sync_state", state);
        let _ = self.db.set_state("last_sync_at", &Utc::now().to_rfc3339());
        let _ = self.db.insert_audit_entry(&audit);
        result
    }

    async fn sync_pass(&self, started_at: DateTime<Utc>) -> Result<SyncReport, CoreError> {
        let git = self.shadow.lock().await?;
        let primary_commit = self.primary_head()?;
        let owned = self.sessions.registry().owned_paths()?;
        let events = self.synchronizer.sync_primary_to_shadow(&self.db, &owned)?;
        let files: Vec<String> = events
            .iter()
            .map(|e| e.file_path.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let annotation = ShadowAnnotation::for_sync(primary_commit.clone(), files);
        let message = commit_format::render_sync_message(&annotation);
        let shadow_commit = match git.commit_paths(
            None,
            &message,
            &self.config.shadow.author_name,
            &self.config.shadow.author_email,
        )? {
            Some(oid) => {
                let sha = oid.to_string();
                self.mapper.record_mapping(&git, &annotation, &sha)?;
                Some(sha)
            }
            None => None,
        };
        drop(git);

        info!(
            primary = %primary_commit,
            events = events.len(),
            shadow = shadow_commit.as_deref().unwrap_or("-"),
            "sync pass complete"
        );
        Ok(SyncReport {
            primary_commit,
            events,
            shadow_commit,
            started_at,
            completed_at: Utc::now(),
        })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Sync, then open a session bound to primary HEAD.
    pub async fn session_start(&self, session_id: Option<String>) -> Result<Session, CoreError> {
        self.sync().await?;
        let head = self.primary_head()?;
        let session = self.sessions.start(session_id, &head).await?;
        let _ = self.db.insert_audit_log(
            "session_start",
            Some(&session.session_id),
            None,
            Some(&head),
            true,
        );
        Ok(session)
    }

    /// Record a tool use. If primary HEAD moved since the session was last
    /// bound, the interrupted-session sync runs first.
    pub async fn record_tool_use(
        &self,
        session_id: &str,
        tool: &ToolEvent,
    ) -> Result<ToolUseReport, CoreError> {
        let session = self.sessions.registry().get(session_id)?;
        let head = self.primary_head()?;
        let mut interrupted = false;
        if session.state == SessionState::Active && head != session.primary_commit_current {
            info!(session_id, from = %session.primary_commit_current, to = %head, "primary moved during session");
            self.sync().await?;
            let human = self.human_events_since(&session).await?;
            self.sessions.interrupt(session_id, &head, human)?;
            interrupted = true;
        }
        let events = self.sessions.record_tool_use(session_id, tool)?;
        Ok(ToolUseReport {
            events,
            interrupted,
        })
    }

    /// Net human changes on the shadow main branch since the session base,
    /// minus the ones the session already knows about.
    async fn human_events_since(&self, session: &Session) -> Result<Vec<ChangeEvent>, CoreError> {
        let git = self.shadow.lock().await?;
        let tip = git
            .branch_tip(&self.config.shadow.shadow_branch)?
            .ok_or_else(|| GitError::RefNotFound(self.config.shadow.shadow_branch.clone()))?;
        let changes = net_changes(&git, &session.shadow_base_commit, &tip, Actor::Human)?;
        Ok(changes
            .into_iter()
            .map(|c| c.event)
            .filter(|e| {
                !session.change_events.iter().any(|known| {
                    known.actor == Actor::Human
                        && known.file_path == e.file_path
                        && known.content_hash_after == e.content_hash_after
                })
            })
            .collect())
    }

    /// Close a session, producing its single shadow commit.
    pub async fn session_end(
        &self,
        session_id: &str,
        transcript: &Path,
    ) -> Result<Session, CoreError> {
        match self.sessions.close(session_id, transcript).await {
            Ok(session) => {
                let _ = self.db.insert_audit_log(
                    "session_end",
                    Some(session_id),
                    session.shadow_commit.as_deref(),
                    Some(&format!("{} files", session.agent_files().len())),
                    true,
                );
                Ok(session)
            }
            Err(e) => {
                let _ = self.db.insert_audit_log(
                    "session_end",
                    Some(session_id),
                    None,
                    Some(&e.to_string()),
                    false,
                );
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Bring a closed session's work into the primary tree.
    ///
    /// Human and agent net changes since the session base are classified;
    /// unrelated and related files are written, disjoint same-file edits are
    /// merged, everything else goes through the resolver and is staged for a
    /// human decision. Nothing touching a human-modified range is written
    /// without acceptance.
    ///
    /// A session is applied at most once until it is reverted.
    pub async fn apply_session(&self, session_id: &str) -> Result<ApplyReport, CoreError> {
        let session = self.sessions.registry().get(session_id)?;
        if session.state != SessionState::Closed {
            return Err(SessionError::NotClosed {
                session_id: session_id.to_string(),
                state: session.state.to_string(),
            }
            .into());
        }
        if let Some(previous) = self.db.get_session_apply(session_id)? {
            if previous.reverted_at.is_none() {
                return Err(SessionError::AlreadyApplied(session_id.to_string()).into());
            }
            self.db.clear_applied_files(session_id)?;
        }
        let mut report = ApplyReport {
            session_id: session_id.to_string(),
            ..Default::default()
        };
        let Some(session_commit) = session.shadow_commit.clone() else {
            info!(session_id, "session has no commit, nothing to apply");
            return Ok(report);
        };

        self.sync().await?;

        let (human, agent) = {
            let git = self.shadow.lock().await?;
            let tip = git
                .branch_tip(&self.config.shadow.shadow_branch)?
                .ok_or_else(|| GitError::RefNotFound(self.config.shadow.shadow_branch.clone()))?;
            (
                net_changes(&git, &session.shadow_base_commit, &tip, Actor::Human)?,
                net_changes(&git, &session.shadow_base_commit, &session_commit, Actor::Agent)?,
            )
        };

        let human_events: Vec<ChangeEvent> = human.iter().map(|c| c.event.clone()).collect();
        let agent_events: Vec<ChangeEvent> = agent.iter().map(|c| c.event.clone()).collect();
        let records = self.detector.detect(&human_events, &agent_events);
        let reasoning: Vec<String> = session
            .reasoning_events
            .iter()
            .map(|r| r.text.clone())
            .collect();

        let mut writes: Vec<(String, Option<Vec<u8>>)> = Vec::new();
        for change in &agent {
            let path = change.event.file_path.clone();
            let record = records.iter().find(|r| r.file_path == path);
            let severity = record.map(|r| r.severity).unwrap_or(Severity::None);
            let human_side = human.iter().find(|h| h.event.file_path == path);

            let decision = match (severity, record) {
                (Severity::None, _) | (_, None) => Decision::Write(change.after.clone()),
                (Severity::RelatedFile, Some(_)) => {
                    report.related.push(path.clone());
                    Decision::Write(change.after.clone())
                }
                (Severity::SameFile, Some(record)) => {
                    match text_sides(change, human_side) {
                        Some((base, ours, theirs)) => {
                            let merge = Merger::three_way_merge(&base, &ours, &theirs);
                            if !merge.has_conflicts && self.config.conflict.auto_merge_disjoint {
                                Decision::Merge(merge.merged_content)
                            } else {
                                self.resolve(&session, record, Some(base), ours, theirs, &reasoning)
                                    .await?
                            }
                        }
                        None => self.stage_manual(&session, record, change, human_side)?,
                    }
                }
                (Severity::OverlappingRange, Some(record)) => {
                    match text_sides(change, human_side) {
                        Some((base, ours, theirs)) => {
                            let base = change.before.as_ref().map(|_| base);
                            self.resolve(&session, record, base, ours, theirs, &reasoning)
                                .await?
                        }
                        None => self.stage_manual(&session, record, change, human_side)?,
                    }
                }
            };

            match decision {
                Decision::Write(content) => {
                    report.applied.push(path.clone());
                    writes.push((path, content));
                }
                Decision::Merge(content) => {
                    report.merged.push(path.clone());
                    writes.push((path, Some(content.into_bytes())));
                }
                Decision::Stage(pending, outcome) => {
                    report.outcomes.extend(outcome);
                    report.staged.push(pending);
                }
            }
        }

        if !writes.is_empty() {
            report.shadow_commit = self
                .land(&session, &writes, Landing::Apply(report.outcomes.clone()))
                .await?;
        }
        self.db.record_session_apply(session_id)?;

        let _ = self.db.insert_audit_log(
            "session_applied",
            Some(session_id),
            report.shadow_commit.as_deref(),
            Some(&format!(
                "applied {}, merged {}, related {}, staged {}",
                report.applied.len(),
                report.merged.len(),
                report.related.len(),
                report.staged.len()
            )),
            true,
        );
        info!(
            session_id,
            applied = report.applied.len(),
            merged = report.merged.len(),
            staged = report.staged.len(),
            "session applied"
        );
        Ok(report)
    }

    async fn resolve(
        &self,
        session: &Session,
        record: &ConflictRecord,
        base: Option<String>,
        human: String,
        agent: String,
        reasoning: &[String],
    ) -> Result<Decision, CoreError> {
        let request = ResolutionRequest {
            conflict: record.clone(),
            session_id: session.session_id.clone(),
            base,
            human,
            agent,
            reasoning: reasoning.to_vec(),
        };
        let attempt = self.resolver.attempt(&request).await?;
        let pending = ConflictResolver::stage(&self.db, &request, &attempt)?;
        Ok(Decision::Stage(
            pending,
            Some(ConflictResolver::outcome_record(&attempt)),
        ))
    }

    fn stage_manual(
        &self,
        session: &Session,
        record: &ConflictRecord,
        agent: &NetChange,
        human: Option<&NetChange>,
    ) -> Result<Decision, CoreError> {
        debug!(file = %record.file_path, "deletion or binary content, staging for manual resolution");
        let pending = ConflictResolver::stage_manual(
            &self.db,
            &session.session_id,
            record,
            human.and_then(|h| h.after.clone()).and_then(fsutil::bytes_to_text),
            agent.after.clone().and_then(fsutil::bytes_to_text),
            "deletion or binary content needs a human decision",
        )?;
        Ok(Decision::Stage(pending, None))
    }

    /// Write content into both trees under the writer lock and land it as
    /// one commit on the shadow main branch. Applied writes are recorded with
    /// the primary content they replaced, so the session can be reverted.
    async fn land(
        &self,
        session: &Session,
        writes: &[(String, Option<Vec<u8>>)],
        landing: Landing,
    ) -> Result<Option<String>, CoreError> {
        let git = self.shadow.lock().await?;
        let primary_commit = self.primary_head()?;
        let mut replaced = Vec::with_capacity(writes.len());
        for (path, content) in writes {
            replaced.push(
                fsutil::read_bytes(&self.primary_root.join(path))
                    .map_err(|e| SyncError::io(path.as_str(), e))?,
            );
            self.synchronizer.apply_to_primary(
                &self.db,
                path,
                content.as_deref(),
                &session.session_id,
            )?;
        }
        let files: Vec<String> = writes.iter().map(|(p, _)| p.clone()).collect();
        let mut annotation = ShadowAnnotation::for_sync(primary_commit, files.clone());
        annotation.session_id = Some(session.session_id.clone());

        let is_apply = matches!(landing, Landing::Apply(_));
        let message = match landing {
            Landing::Apply(resolutions) => {
                annotation.reasoning = session
                    .reasoning_events
                    .iter()
                    .map(|r| r.text.clone())
                    .collect();
                annotation.resolutions = resolutions;
                commit_format::render_apply_message(&annotation)
            }
            Landing::Revert => commit_format::render_revert_message(&annotation),
        };
        let Some(oid) = git.commit_paths(
            Some(&files),
            &message,
            &self.config.shadow.author_name,
            &self.config.shadow.author_email,
        )?
        else {
            return Ok(None);
        };
        let sha = oid.to_string();
        self.mapper.record_mapping(&git, &annotation, &sha)?;

        if is_apply {
            for ((path, content), before) in writes.iter().zip(replaced) {
                self.db.insert_applied_file(&AppliedFile {
                    session_id: session.session_id.clone(),
                    file_path: path.clone(),
                    content_before: before,
                    digest_after: content.as_deref().map(hasher::fingerprint),
                    shadow_commit: sha.clone(),
                })?;
            }
        }
        Ok(Some(sha))
    }

    // -----------------------------------------------------------------------
    // Resolutions
    // -----------------------------------------------------------------------

    /// Write a staged proposal into the primary tree and mark it accepted.
    pub async fn accept_resolution(&self, id: &str) -> Result<PendingResolution, CoreError> {
        let pending = self
            .db
            .get_pending_resolution(id)?
            .ok_or_else(|| ConflictError::NotFound(id.to_string()))?;
        if pending.status.is_settled() {
            return Err(ConflictError::AlreadyResolved(id.to_string()).into());
        }
        let Some(content) = pending
            .proposed_content
            .clone()
            .filter(|_| pending.status == PendingStatus::Proposed)
        else {
            return Err(ConflictError::NoProposal(id.to_string()).into());
        };

        // The proposal was built against the human content at staging time.
        let current = fsutil::read_bytes(&self.primary_root.join(&pending.file_path))
            .map_err(|e| SyncError::io(pending.file_path.as_str(), e))?;
        let staged_against = pending
            .human_content
            .as_deref()
            .map(|text| hasher::fingerprint(text.as_bytes()));
        if current.as_deref().map(hasher::fingerprint) != staged_against {
            warn!(id, file = %pending.file_path, "primary file changed since staging");
            return Err(ConflictError::HumanChanged {
                id: id.to_string(),
                file_path: pending.file_path.clone(),
            }
            .into());
        }

        let session = self.sessions.registry().get(&pending.session_id)?;
        let record = ResolutionOutcomeRecord {
            conflict_id: pending.id.clone(),
            file_path: pending.file_path.clone(),
            outcome: ResolutionOutcome::Resolved,
            duration_ms: 0,
            detail: Some("accepted".into()),
        };
        self.land(
            &session,
            &[(pending.file_path.clone(), Some(content.into_bytes()))],
            Landing::Apply(vec![record]),
        )
        .await?;
        Ok(ConflictResolver::accept(&self.db, id)?)
    }

    /// Discard a staged record. Nothing is written.
    pub fn reject_resolution(&self, id: &str) -> Result<PendingResolution, CoreError> {
        Ok(ConflictResolver::reject(&self.db, id)?)
    }

    pub fn open_resolutions(&self) -> Result<Vec<PendingResolution>, CoreError> {
        Ok(self.db.list_open_resolutions()?)
    }

    // -----------------------------------------------------------------------
    // Revert
    // -----------------------------------------------------------------------

    /// Take an applied session's work back out of the primary tree.
    ///
    /// Each applied file is restored to its content before the apply, unless
    /// it changed again since; those are kept and reported. Open resolutions
    /// of the session are withdrawn. The session can then be applied again.
    pub async fn revert_session(&self, session_id: &str) -> Result<RevertReport, CoreError> {
        let session = self.sessions.registry().get(session_id)?;
        let applied = self.db.get_session_apply(session_id)?;
        if !applied.is_some_and(|a| a.reverted_at.is_none()) {
            return Err(SessionError::NotApplied(session_id.to_string()).into());
        }

        self.sync().await?;
        let mut report = RevertReport {
            session_id: session_id.to_string(),
            withdrawn: self.db.reject_open_resolutions_for_session(session_id)?,
            ..Default::default()
        };

        // Per path: the content before the first write, the digest after the last.
        let mut net: BTreeMap<String, (Option<Vec<u8>>, Option<String>)> = BTreeMap::new();
        for file in self.db.list_applied_files(session_id)? {
            match net.entry(file.file_path) {
                Entry::Occupied(mut entry) => entry.get_mut().1 = file.digest_after,
                Entry::Vacant(entry) => {
                    entry.insert((file.content_before, file.digest_after));
                }
            }
        }

        let mut restores = Vec::new();
        for (path, (before, applied_digest)) in net {
            let current = fsutil::read_bytes(&self.primary_root.join(&path))
                .map_err(|e| SyncError::io(path.as_str(), e))?;
            if current.as_deref().map(hasher::fingerprint) == applied_digest {
                report.restored.push(path.clone());
                restores.push((path, before));
            } else {
                warn!(session_id, path = %path, "changed since apply, keeping it");
                report.kept.push(path);
            }
        }
        if !restores.is_empty() {
            report.shadow_commit = self.land(&session, &restores, Landing::Revert).await?;
        }
        self.db
            .mark_session_reverted(session_id, report.shadow_commit.as_deref())?;

        let _ = self.db.insert_audit_log(
            "session_reverted",
            Some(session_id),
            report.shadow_commit.as_deref(),
            Some(&format!(
                "restored {}, kept {}, withdrawn {}",
                report.restored.len(),
                report.kept.len(),
                report.withdrawn.len()
            )),
            true,
        );
        info!(
            session_id,
            restored = report.restored.len(),
            kept = report.kept.len(),
            "session reverted"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Shadow commits recorded against a primary revision, or against every
    /// primary commit from `rev` through `until` when a range is given.
    /// Results follow the primary order, then creation order.
    pub async fn find_by_primary(
        &self,
        rev: &str,
        until: Option<&str>,
    ) -> Result<Vec<ShadowMatch>, CoreError> {
        let primary = GitClient::new(&self.primary_root)?;
        let from = primary.resolve_commit(rev)?;
        let mut range = vec![from.clone()];
        if let Some(until) = until {
            let to = primary.resolve_commit(until)?;
            range.extend(primary.commits_between(&from, &to)?);
        }
        let mappings = self.mapper.find_shadow_commits_between(&range)?;

        let git = self.shadow.lock().await?;
        let mut matches = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let files = self
                .mapper
                .read_annotation(&git, &mapping.shadow_commit_id)?
                .map(|a| a.files)
                .unwrap_or_default();
            let summary = git
                .commit_message(&mapping.shadow_commit_id)?
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            matches.push(ShadowMatch {
                primary_commit: mapping.primary_commit_id,
                shadow_commit: mapping.shadow_commit_id,
                session_id: mapping.session_id,
                summary,
                files,
            });
        }
        debug!(rev, count = matches.len(), "looked up shadow commits");
        Ok(matches)
    }

    // -----------------------------------------------------------------------
    // Mapping maintenance & status
    // -----------------------------------------------------------------------

    /// Check the index against the notes; rebuild it from the log when they
    /// disagree.
    pub async fn verify_mappings(&self) -> Result<VerifyReport, CoreError> {
        let git = self.shadow.lock().await?;
        let problems: Vec<MappingInconsistency> = self.mapper.verify(&git)?;
        let rebuilt = if problems.is_empty() {
            None
        } else {
            warn!(count = problems.len(), "rebuilding commit index from shadow log");
            Some(self.mapper.rebuild_from_log(&git)?)
        };
        Ok(VerifyReport {
            inconsistencies: problems
                .into_iter()
                .map(|p| (p.shadow_sha, p.detail))
                .collect(),
            rebuilt,
        })
    }

    pub async fn rebuild_index(&self) -> Result<usize, CoreError> {
        let git = self.shadow.lock().await?;
        Ok(self.mapper.rebuild_from_log(&git)?)
    }

    pub async fn status(&self) -> Result<EngineStatus, CoreError> {
        let primary_head = GitClient::new(&self.primary_root)?.head_sha_opt()?;
        let shadow_tip = {
            let git = self.shadow.lock().await?;
            git.branch_tip(&self.config.shadow.shadow_branch)?
        };
        Ok(EngineStatus {
            primary_root: self.primary_root.clone(),
            data_dir: self.data_dir.clone(),
            primary_head,
            shadow_tip,
            sync_state: self
                .db
                .get_state("sync_state")?
                .unwrap_or_else(|| "idle".into()),
            last_sync_at: self.db.get_state("last_sync_at")?,
            active_sessions: self.sessions.registry().active()?,
            open_resolutions: self.db.list_open_resolutions()?,
            divergent_paths: self.synchronizer.detect_divergence()?.len(),
            commit_mappings: self.db.count_commit_map()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Net file changes between two shadow commits, as events of `actor`.
fn net_changes(
    git: &GitClient,
    from: &str,
    to: &str,
    actor: Actor,
) -> Result<Vec<NetChange>, CoreError> {
    let mut changes = Vec::new();
    for path in git.changed_files(from, to)? {
        let before = git.file_at(from, &path)?;
        let after = git.file_at(to, &path)?;
        let before_digest = before.as_deref().map(hasher::fingerprint);
        let after_digest = after.as_deref().map(hasher::fingerprint);
        let Some(kind) = ChangeKind::classify(before_digest.as_deref(), after_digest.as_deref())
        else {
            continue;
        };
        let ranges = match (kind, &before, &after) {
            (ChangeKind::Modify, Some(b), Some(a)) => match (
                fsutil::bytes_to_text(b.clone()),
                fsutil::bytes_to_text(a.clone()),
            ) {
                (Some(b), Some(a)) => merger::changed_line_ranges(&b, &a),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        changes.push(NetChange {
            event: ChangeEvent::new(path, kind, before_digest, after_digest, actor)
                .with_ranges(ranges),
            before,
            after,
        });
    }
    Ok(changes)
}

/// Base, human and agent text for a same-file conflict. `None` when either
/// side deleted the file or any side is binary. A missing base (both sides
/// created the file) is the empty text.
fn text_sides(agent: &NetChange, human: Option<&NetChange>) -> Option<(String, String, String)> {
    let human = human?;
    let base = match &agent.before {
        Some(bytes) => fsutil::bytes_to_text(bytes.clone())?,
        None => String::new(),
    };
    let ours = fsutil::bytes_to_text(human.after.clone()?)?;
    let theirs = fsutil::bytes_to_text(agent.after.clone()?)?;
    Some((base, ours, theirs))
}

/// Keep the data directory (and the config pointer directory) out of the
/// primary repository's status.
fn exclude_from_primary(primary: &GitClient, rel_dirs: &[String]) -> Result<(), CoreError> {
    let exclude = primary.repo().path().join("info").join("exclude");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    let missing: Vec<String> = rel_dirs
        .iter()
        .map(|rel| format!("/{}/", rel.trim_matches('/')))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|entry| !existing.lines().any(|line| line.trim() == entry.as_str()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    if let Some(parent) = exclude.parent() {
        std::fs::create_dir_all(parent).map_err(GitError::from)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude)
        .map_err(GitError::from)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file).map_err(GitError::from)?;
    }
    for entry in &missing {
        writeln!(file, "{entry}").map_err(GitError::from)?;
    }
    debug!(entries = ?missing, "excluded data directory from primary repository");
    Ok(())
}

/// RAII guard that clears the running flag when dropped.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::agent::{AgentRequest, ReasoningAgent};
    use crate::errors::AgentError;
    use async_trait::async_trait;
    use std::fs;
    use std::time::Duration;

    struct Echo(String);

    #[async_trait]
    impl ReasoningAgent for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn resolve(&self, _request: AgentRequest) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
    }

    fn commit_primary(root: &Path) -> String {
        let git = GitClient::new(root).unwrap();
        git.commit_paths(None, "work", "h", "h@localhost")
            .unwrap()
            .map(|o| o.to_string())
            .unwrap_or_else(|| git.get_head_sha().unwrap())
    }

    async fn setup(files: &[(&str, &str)]) -> (tempfile::TempDir, ShadowEngine) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        GitClient::init(&root, "main").unwrap();
        for (path, content) in files {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        commit_primary(&root);
        let mut config = AppConfig::default();
        config.agent.enabled = false;
        let engine = ShadowEngine::init(&root, config).await.unwrap();
        (dir, engine)
    }

    fn transcript(dir: &Path) -> PathBuf {
        let path = dir.join("t.jsonl");
        fs::write(
            &path,
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"Tidy things up."}]}}"#,
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_init_mirrors_and_maps_primary_head() {
        let (dir, engine) = setup(&[("a.py", "x = 1\n")]).await;
        let head = engine.primary_head().unwrap();
        let shadow_root = engine.data_dir().join(REPO_DIR);
        assert_eq!(fs::read_to_string(shadow_root.join("a.py")).unwrap(), "x = 1\n");
        assert_eq!(engine.mapper().find_shadow_commits(&head).unwrap().len(), 1);

        let exclude = fs::read_to_string(dir.path().join(".git/info/exclude")).unwrap();
        assert!(exclude.lines().any(|l| l == "/.shadowsync/"));
        assert!(AppConfig::path_for_primary(dir.path()).is_file());
    }

    #[tokio::test]
    async fn test_relocated_data_dir_stays_out_of_the_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        GitClient::init(&root, "main").unwrap();
        fs::write(root.join("a.py"), "x = 1\n").unwrap();
        commit_primary(&root);
        let mut config = AppConfig::default();
        config.agent.enabled = false;
        config.shadow.data_dir = PathBuf::from("shadow-data");
        let engine = ShadowEngine::init(&root, config).await.unwrap();
        assert_eq!(engine.data_dir(), root.join("shadow-data"));

        fs::write(root.join("b.py"), "y = 2\n").unwrap();
        assert_eq!(engine.sync().await.unwrap().events.len(), 1);
        assert!(engine.sync().await.unwrap().events.is_empty());
        assert_eq!(engine.status().await.unwrap().divergent_paths, 0);
        assert!(!engine.data_dir().join(REPO_DIR).join("shadow-data").exists());

        let exclude = fs::read_to_string(root.join(".git/info/exclude")).unwrap();
        assert!(exclude.lines().any(|l| l == "/shadow-data/"));
        assert!(exclude.lines().any(|l| l == "/.shadowsync/"));

        drop(engine);
        let reopened = ShadowEngine::open(&root).unwrap();
        assert_eq!(reopened.data_dir(), root.join("shadow-data"));
        assert!(reopened.sync().await.unwrap().events.is_empty());
    }

    #[test]
    fn test_engines_on_separate_runtimes_sync_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (dir, engine) = rt.block_on(setup(&[("a.py", "x = 1\n")]));
        drop(engine);
        for i in 0..300 {
            fs::write(dir.path().join(format!("gen_{i}.py")), format!("v = {i}\n")).unwrap();
        }
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = dir.path().to_path_buf();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(async {
                        let engine = ShadowEngine::open(&root).unwrap();
                        barrier.wait();
                        engine.sync().await.unwrap().events.len()
                    })
                })
            })
            .collect();
        let mut counts: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![0, 300]);

        let engine = ShadowEngine::open(dir.path()).unwrap();
        let status = rt.block_on(engine.status()).unwrap();
        assert_eq!(status.divergent_paths, 0);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let (dir, engine) = setup(&[("a.py", "x = 1\n")]).await;
        fs::write(dir.path().join("b.py"), "y = 2\n").unwrap();
        let first = engine.sync().await.unwrap();
        assert_eq!(first.events.len(), 1);
        assert!(first.shadow_commit.is_some());

        let second = engine.sync().await.unwrap();
        assert!(second.events.is_empty());
        assert!(second.shadow_commit.is_none());
        assert_eq!(engine.status().await.unwrap().divergent_paths, 0);
    }

    #[tokio::test]
    async fn test_apply_writes_unrelated_agent_work() {
        let (dir, engine) = setup(&[("a.py", "x = 1\n"), ("lib/b.py", "y = 2\n")]).await;
        let session = engine.session_start(Some("s1".into())).await.unwrap();
        let wt = PathBuf::from(&session.worktree_path);
        fs::write(wt.join("a.py"), "x = 10\n").unwrap();
        engine
            .record_tool_use("s1", &ToolEvent::new("Edit", vec!["a.py".into()]))
            .await
            .unwrap();
        engine.session_end("s1", &transcript(engine.data_dir())).await.unwrap();

        // The primary tree is never touched before an explicit apply.
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "x = 1\n");

        let report = engine.apply_session("s1").await.unwrap();
        assert_eq!(report.applied, vec!["a.py".to_string()]);
        assert!(report.staged.is_empty());
        assert!(report.shadow_commit.is_some());
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "x = 10\n");

        // The applied file is attributed to the agent on the next sync.
        let next = engine.sync().await.unwrap();
        assert!(next.events.is_empty());
    }

    #[tokio::test]
    async fn test_apply_stages_overlapping_edits() {
        let base = "def f():\n    return 1\n";
        let (dir, engine) = setup(&[("f.py", base)]).await;
        let engine = engine.with_resolver(ConflictResolver::new(
            Some(Arc::new(Echo("def f():\n    log()\n    return 2\n".into()))),
            Duration::from_secs(30),
        ));
        let session = engine.session_start(Some("s2".into())).await.unwrap();
        fs::write(
            PathBuf::from(&session.worktree_path).join("f.py"),
            "def f():\n    return 3\n",
        )
        .unwrap();
        engine
            .record_tool_use("s2", &ToolEvent::new("Edit", vec!["f.py".into()]))
            .await
            .unwrap();
        engine.session_end("s2", &transcript(engine.data_dir())).await.unwrap();

        let human = "def f():\n    return 2\n";
        fs::write(dir.path().join("f.py"), human).unwrap();
        let report = engine.apply_session("s2").await.unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.staged.len(), 1);
        assert_eq!(report.staged[0].status, PendingStatus::Proposed);
        assert_eq!(report.outcomes[0].outcome, ResolutionOutcome::Resolved);
        // Staged, not written.
        assert_eq!(fs::read_to_string(dir.path().join("f.py")).unwrap(), human);

        let id = report.staged[0].id.clone();
        engine.accept_resolution(&id).await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("f.py")).unwrap(),
            "def f():\n    log()\n    return 2\n"
        );
        assert!(engine.open_resolutions().unwrap().is_empty());
    }

    /// Close a session that rewrote `a.py`.
    async fn agent_edits_a(engine: &ShadowEngine, id: &str, content: &str) {
        let session = engine.session_start(Some(id.into())).await.unwrap();
        fs::write(PathBuf::from(&session.worktree_path).join("a.py"), content).unwrap();
        engine
            .record_tool_use(id, &ToolEvent::new("Edit", vec!["a.py".into()]))
            .await
            .unwrap();
        engine.session_end(id, &transcript(engine.data_dir())).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_twice_is_refused() {
        let base = "def f():\n    return 1\n";
        let (dir, engine) = setup(&[("f.py", base), ("a.py", "x = 1\n")]).await;
        let engine = engine.with_resolver(ConflictResolver::new(
            Some(Arc::new(Echo("def f():\n    log()\n    return 2\n".into()))),
            Duration::from_secs(30),
        ));
        let session = engine.session_start(Some("twice".into())).await.unwrap();
        let wt = PathBuf::from(&session.worktree_path);
        fs::write(wt.join("f.py"), "def f():\n    return 3\n").unwrap();
        fs::write(wt.join("a.py"), "x = 10\n").unwrap();
        engine
            .record_tool_use("twice", &ToolEvent::new("Edit", vec!["f.py".into(), "a.py".into()]))
            .await
            .unwrap();
        engine.session_end("twice", &transcript(engine.data_dir())).await.unwrap();
        fs::write(dir.path().join("f.py"), "def f():\n    return 2\n").unwrap();

        let first = engine.apply_session("twice").await.unwrap();
        assert_eq!(first.staged.len(), 1);
        assert_eq!(first.applied, vec!["a.py".to_string()]);

        assert!(matches!(
            engine.apply_session("twice").await,
            Err(CoreError::Session(SessionError::AlreadyApplied(_)))
        ));
        assert_eq!(engine.open_resolutions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_refuses_when_human_changed_file() {
        let base = "def f():\n    return 1\n";
        let (dir, engine) = setup(&[("f.py", base)]).await;
        let engine = engine.with_resolver(ConflictResolver::new(
            Some(Arc::new(Echo("def f():\n    log()\n    return 2\n".into()))),
            Duration::from_secs(30),
        ));
        let session = engine.session_start(Some("stale".into())).await.unwrap();
        fs::write(
            PathBuf::from(&session.worktree_path).join("f.py"),
            "def f():\n    return 3\n",
        )
        .unwrap();
        engine
            .record_tool_use("stale", &ToolEvent::new("Edit", vec!["f.py".into()]))
            .await
            .unwrap();
        engine.session_end("stale", &transcript(engine.data_dir())).await.unwrap();
        fs::write(dir.path().join("f.py"), "def f():\n    return 2\n").unwrap();
        let report = engine.apply_session("stale").await.unwrap();
        let id = report.staged[0].id.clone();

        // The human keeps working after the proposal was staged.
        let later = "def f():\n    return 5\n";
        fs::write(dir.path().join("f.py"), later).unwrap();
        assert!(matches!(
            engine.accept_resolution(&id).await,
            Err(CoreError::Conflict(ConflictError::HumanChanged { .. }))
        ));
        assert_eq!(fs::read_to_string(dir.path().join("f.py")).unwrap(), later);
        assert_eq!(engine.open_resolutions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revert_restores_primary_and_allows_reapply() {
        let (dir, engine) = setup(&[("a.py", "x = 1\n"), ("b.py", "y = 1\n")]).await;
        let session = engine.session_start(Some("rv".into())).await.unwrap();
        let wt = PathBuf::from(&session.worktree_path);
        fs::write(wt.join("a.py"), "x = 10\n").unwrap();
        fs::write(wt.join("b.py"), "y = 10\n").unwrap();
        fs::write(wt.join("new.py"), "z = 1\n").unwrap();
        engine
            .record_tool_use(
                "rv",
                &ToolEvent::new("Write", vec!["a.py".into(), "b.py".into(), "new.py".into()]),
            )
            .await
            .unwrap();
        engine.session_end("rv", &transcript(engine.data_dir())).await.unwrap();
        engine.apply_session("rv").await.unwrap();
        assert!(dir.path().join("new.py").is_file());

        // A human edit made after the apply survives the revert.
        fs::write(dir.path().join("b.py"), "y = 99\n").unwrap();
        let report = engine.revert_session("rv").await.unwrap();
        assert_eq!(report.restored, vec!["a.py".to_string(), "new.py".to_string()]);
        assert_eq!(report.kept, vec!["b.py".to_string()]);
        assert!(report.shadow_commit.is_some());
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "x = 1\n");
        assert_eq!(fs::read_to_string(dir.path().join("b.py")).unwrap(), "y = 99\n");
        assert!(!dir.path().join("new.py").exists());
        assert_eq!(engine.status().await.unwrap().divergent_paths, 0);

        assert!(matches!(
            engine.revert_session("rv").await,
            Err(CoreError::Session(SessionError::NotApplied(_)))
        ));
        let again = engine.apply_session("rv").await.unwrap();
        assert!(again.applied.contains(&"a.py".to_string()));
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "x = 10\n");
    }

    #[tokio::test]
    async fn test_find_by_primary_over_a_range() {
        let (dir, engine) = setup(&[("a.py", "x = 1\n")]).await;
        let first = engine.primary_head().unwrap();
        agent_edits_a(&engine, "fp", "x = 2\n").await;

        fs::write(dir.path().join("b.py"), "y = 2\n").unwrap();
        let second = commit_primary(dir.path());
        engine.sync().await.unwrap();

        let at_first = engine.find_by_primary(&first, None).await.unwrap();
        assert_eq!(at_first.len(), 2);
        assert!(at_first.iter().all(|m| m.primary_commit == first));
        let session_commit = at_first
            .iter()
            .find(|m| m.session_id.as_deref() == Some("fp"))
            .unwrap();
        assert_eq!(session_commit.files, vec!["a.py".to_string()]);

        let range = engine.find_by_primary(&first, Some("HEAD")).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[2].primary_commit, second);
        assert!(range[2].summary.starts_with("Sync primary tree"));

        assert!(matches!(
            engine.find_by_primary("no-such-rev", None).await,
            Err(CoreError::Git(GitError::RefNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_apply_requires_closed_session() {
        let (_dir, engine) = setup(&[("a.py", "x = 1\n")]).await;
        engine.session_start(Some("open".into())).await.unwrap();
        assert!(matches!(
            engine.apply_session("open").await,
            Err(CoreError::Session(SessionError::NotClosed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_verify_rebuilds_lost_index() {
        let (_dir, engine) = setup(&[("a.py", "x = 1\n")]).await;
        engine.db().replace_commit_map(&[]).unwrap();
        let report = engine.verify_mappings().await.unwrap();
        assert_eq!(report.inconsistencies.len(), 1);
        assert_eq!(report.rebuilt, Some(1));
        assert!(engine.verify_mappings().await.unwrap().inconsistencies.is_empty());
    }
}
