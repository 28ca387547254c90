//! Session boundary accumulator.
//!
//! Collects agent [`ChangeEvent`]s between a session start and end without
//! committing anything, then produces exactly one shadow commit for the whole
//! session with the transcript's reasoning as its narrative.
//!
//! Each session works in its own git worktree of the shadow repository on
//! branch `session/<id>`, so concurrent sessions never share a working tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::commit_format;
use super::registry::SessionRegistry;
use crate::config::SessionConfig;
use crate::conflict::merger::{self, LineStats};
use crate::errors::{GitError, SessionError, SyncError};
use crate::fsutil;
use crate::git::{GitClient, ShadowWriter};
use crate::hasher;
use crate::mapper::CommitMapper;
use crate::models::{Actor, ChangeEvent, Session, SessionState, ShadowAnnotation, ToolEvent};
use crate::synchronizer::{Baseline, DualTreeSynchronizer};
use crate::transcript;

/// Branch prefix for session branches.
pub const SESSION_BRANCH_PREFIX: &str = "session/";

/// Identity used for commits and notes.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

pub struct SessionAccumulator {
    registry: SessionRegistry,
    synchronizer: Arc<DualTreeSynchronizer>,
    mapper: Arc<CommitMapper>,
    shadow: Arc<ShadowWriter>,
    shadow_branch: String,
    sessions_dir: PathBuf,
    identity: CommitIdentity,
    config: SessionConfig,
}

impl SessionAccumulator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: SessionRegistry,
        synchronizer: Arc<DualTreeSynchronizer>,
        mapper: Arc<CommitMapper>,
        shadow: Arc<ShadowWriter>,
        shadow_branch: impl Into<String>,
        sessions_dir: PathBuf,
        identity: CommitIdentity,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            synchronizer,
            mapper,
            shadow,
            shadow_branch: shadow_branch.into(),
            sessions_dir,
            identity,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Open a session bound to `primary_commit`: cut `session/<id>` from the
    /// shadow main branch and check it out into a fresh worktree.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        session_id: Option<String>,
        primary_commit: &str,
    ) -> Result<Session, SessionError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_session_id(&session_id)?;
        if self.registry.exists(&session_id)? {
            return Err(SessionError::AlreadyExists(session_id));
        }

        let branch_name = format!("{SESSION_BRANCH_PREFIX}{session_id}");
        let worktree = self.sessions_dir.join(&session_id);

        let shadow_base_commit = {
            let git = self.shadow.lock().await?;
            let base = git
                .branch_tip(&self.shadow_branch)?
                .ok_or_else(|| GitError::RefNotFound(self.shadow_branch.clone()))?;
            git.create_branch(&branch_name, &base)?;
            git.add_worktree(&session_id, &worktree, &branch_name)?;
            base
        };

        let mut session = Session {
            session_id: session_id.clone(),
            start_time: Utc::now(),
            end_time: None,
            primary_commit_at_start: primary_commit.to_string(),
            primary_commit_current: primary_commit.to_string(),
            shadow_base_commit,
            worktree_path: worktree.display().to_string(),
            branch_name,
            change_events: Vec::new(),
            reasoning_events: Vec::new(),
            state: SessionState::NotStarted,
            shadow_commit: None,
        };
        self.registry.create(&session)?;
        self.registry.transition(&mut session, SessionState::Active)?;
        info!(
            session_id = %session.session_id,
            primary = primary_commit,
            worktree = %session.worktree_path,
            "session started"
        );
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Tool events
    // -----------------------------------------------------------------------

    /// Fingerprint the files a tool reported and append agent events for the
    /// ones whose content really changed. Never commits.
    #[instrument(skip(self, tool), fields(tool = %tool.tool_name))]
    pub fn record_tool_use(
        &self,
        session_id: &str,
        tool: &ToolEvent,
    ) -> Result<Vec<ChangeEvent>, SessionError> {
        let mut session = self.registry.get(session_id)?;
        if session.state != SessionState::Active {
            return Err(SessionError::NotActive {
                session_id: session_id.to_string(),
                state: session.state.to_string(),
            });
        }

        let worktree = PathBuf::from(&session.worktree_path);
        let worktree_git = GitClient::new(&worktree)?;
        let mut baselines = BTreeMap::new();
        for raw in &tool.file_paths {
            let path = self.synchronizer.relativize(&worktree, raw)?;
            if baselines.contains_key(&path) {
                continue;
            }
            let baseline = baseline_for(&session, &worktree_git, &path)?;
            baselines.insert(path, baseline);
        }

        let events = self
            .synchronizer
            .sync_shadow_to_agent(&worktree, &tool.file_paths, &baselines)?;
        debug!(session_id, recorded = events.len(), "tool use fingerprinted");
        self.registry.append_events(&mut session, events.clone())?;
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Interrupt
    // -----------------------------------------------------------------------

    /// The primary tree moved while the session was active: record the human
    /// events, bring the files the agent has not touched into the worktree
    /// and rebind the session to `new_primary`.
    #[instrument(skip(self, human_events), fields(events = human_events.len()))]
    pub fn interrupt(
        &self,
        session_id: &str,
        new_primary: &str,
        human_events: Vec<ChangeEvent>,
    ) -> Result<Session, SessionError> {
        let mut session = self.registry.get(session_id)?;
        self.registry
            .transition(&mut session, SessionState::Interrupted)?;

        let agent_files: BTreeSet<String> = session.agent_files().into_iter().collect();
        let untouched: Vec<String> = human_events
            .iter()
            .filter(|e| e.actor == Actor::Human && !agent_files.contains(&e.file_path))
            .map(|e| e.file_path.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let worktree = PathBuf::from(&session.worktree_path);
        let copied = self
            .synchronizer
            .copy_into_worktree(&worktree, &untouched)
            .map_err(SessionError::from)
            .and_then(|()| self.registry.append_events(&mut session, human_events));
        if let Err(e) = copied {
            warn!(session_id, error = %e, "interrupted sync failed, resuming session");
            self.registry.transition(&mut session, SessionState::Active)?;
            return Err(e);
        }

        session.primary_commit_current = new_primary.to_string();
        self.registry.transition(&mut session, SessionState::Active)?;
        info!(
            session_id,
            new_primary,
            copied = untouched.len(),
            agent_files = agent_files.len(),
            "session rebound after primary moved"
        );
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close the session and produce its single shadow commit.
    ///
    /// A session with no agent changes closes without a commit and without
    /// reading the transcript. An unreadable or empty transcript aborts it.
    #[instrument(skip(self), fields(transcript = %transcript_path.display()))]
    pub async fn close(
        &self,
        session_id: &str,
        transcript_path: &Path,
    ) -> Result<Session, SessionError> {
        let mut session = self.registry.get(session_id)?;
        self.registry.transition(&mut session, SessionState::Closing)?;

        let files = session.agent_files();
        if files.is_empty() {
            info!(session_id, "no agent changes, closing without a commit");
            self.registry.transition(&mut session, SessionState::Closed)?;
            return Ok(session);
        }

        let since = session.start_time
            - chrono::Duration::seconds(self.config.transcript_window_secs as i64);
        let summary = match transcript::extract(transcript_path, Some(since)) {
            Ok(summary) if !summary.is_empty() => summary,
            Ok(_) => {
                return self.abort(session, "transcript contains no decodable events".into());
            }
            Err(e) => return self.abort(session, e.to_string()),
        };

        let mut reasoning = summary.reasoning.clone();
        if self.config.max_reasoning_fragments > 0 {
            reasoning.truncate(self.config.max_reasoning_fragments);
        }
        session.reasoning_events = reasoning;

        let mut actions: Vec<String> = Vec::new();
        for tool_use in &summary.tool_uses {
            let line = tool_use.describe();
            if !actions.contains(&line) {
                actions.push(line);
            }
        }
        let tool_uses = if summary.tool_uses.is_empty() {
            session.agent_events().count()
        } else {
            summary.tool_uses.len()
        };

        let worktree = PathBuf::from(&session.worktree_path);
        let stats = match self.session_stats(&session, &worktree, &files) {
            Ok(stats) => stats,
            Err(e) => return self.fail(session, e),
        };

        let annotation = ShadowAnnotation {
            primary_commit: session.primary_commit_at_start.clone(),
            primary_commit_current: (session.primary_commit_current
                != session.primary_commit_at_start)
                .then(|| session.primary_commit_current.clone()),
            session_id: Some(session.session_id.clone()),
            files: files.clone(),
            reasoning: session.reasoning_events.iter().map(|r| r.text.clone()).collect(),
            lines_added: stats.added,
            lines_modified: stats.modified,
            lines_removed: stats.removed,
            tool_uses,
            resolutions: Vec::new(),
            created_at: Utc::now(),
        };
        let message = commit_format::render_session_message(&annotation, &actions);

        let committed = match self.shadow.lock().await {
            Ok(git) => self.commit_session(&git, &worktree, &files, &message, &annotation),
            Err(e) => Err(e.into()),
        };
        match committed {
            Ok(Some(sha)) => {
                session.shadow_commit = Some(sha.clone());
                self.registry.transition(&mut session, SessionState::Closed)?;
                info!(session_id, shadow = %sha, files = files.len(), "session committed");
                Ok(session)
            }
            Ok(None) => {
                info!(session_id, "worktree matches session base, closing without a commit");
                self.registry.transition(&mut session, SessionState::Closed)?;
                Ok(session)
            }
            Err(e) => self.fail(session, e),
        }
    }

    fn commit_session(
        &self,
        shadow: &GitClient,
        worktree: &Path,
        files: &[String],
        message: &str,
        annotation: &ShadowAnnotation,
    ) -> Result<Option<String>, SessionError> {
        let worktree_git = GitClient::new(worktree)?;
        let Some(oid) = worktree_git.commit_paths(
            Some(files),
            message,
            &self.identity.name,
            &self.identity.email,
        )?
        else {
            return Ok(None);
        };
        let sha = oid.to_string();
        self.mapper.record_mapping(shadow, annotation, &sha)?;
        Ok(Some(sha))
    }

    fn session_stats(
        &self,
        session: &Session,
        worktree: &Path,
        files: &[String],
    ) -> Result<LineStats, SessionError> {
        let git = GitClient::new(worktree)?;
        let mut stats = LineStats::default();
        for path in files {
            let before = git
                .file_at(&session.shadow_base_commit, path)?
                .and_then(fsutil::bytes_to_text)
                .unwrap_or_default();
            let after = fsutil::read_text(&worktree.join(path))
                .map_err(|e| SyncError::io(path, e))?
                .unwrap_or_default();
            stats += merger::line_stats(&before, &after);
        }
        Ok(stats)
    }

    fn abort(&self, mut session: Session, detail: String) -> Result<Session, SessionError> {
        warn!(session_id = %session.session_id, %detail, "session aborted, no commit");
        self.registry.transition(&mut session, SessionState::Aborted)?;
        Err(SessionError::Abort {
            session_id: session.session_id,
            detail,
        })
    }

    fn fail(&self, mut session: Session, error: SessionError) -> Result<Session, SessionError> {
        warn!(session_id = %session.session_id, error = %error, "session commit failed");
        self.registry.transition(&mut session, SessionState::Aborted)?;
        Err(error)
    }
}

/// What the session knew about `path` before the latest tool use: the last
/// recorded digest (or the base version's), and the base version's text.
fn baseline_for(
    session: &Session,
    worktree_git: &GitClient,
    path: &str,
) -> Result<Baseline, SessionError> {
    let base_bytes = worktree_git.file_at(&session.shadow_base_commit, path)?;
    let last = session
        .change_events
        .iter()
        .rev()
        .find(|e| e.file_path == path);
    let digest = match last {
        Some(event) => event.content_hash_after.clone(),
        None => base_bytes.as_deref().map(hasher::fingerprint),
    };
    Ok(Baseline {
        digest,
        text: base_bytes.and_then(fsutil::bytes_to_text),
    })
}

fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.contains("..")
        && !id.ends_with(".lock");
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::file_policy::FilePolicy;
    use crate::models::ChangeKind;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        shadow_root: PathBuf,
        shadow: Arc<ShadowWriter>,
        mapper: Arc<CommitMapper>,
        acc: SessionAccumulator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary");
        let shadow_root = dir.path().join("data/repo");
        fs::create_dir_all(&primary).unwrap();
        let git = GitClient::init(&shadow_root, "shadow-main").unwrap();
        fs::write(shadow_root.join("config.py"), "DEBUG = False\nPORT = 80\n").unwrap();
        git.commit_paths(None, "init", "t", "t@localhost").unwrap();

        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let db = Arc::new(db);
        let shadow = Arc::new(ShadowWriter::new(
            git,
            &dir.path().join("data"),
            std::time::Duration::from_secs(5),
        ));
        let mapper = Arc::new(CommitMapper::new(db.clone(), "t", "t@localhost"));
        let sync = Arc::new(DualTreeSynchronizer::new(
            primary,
            shadow_root.clone(),
            FilePolicy::default(),
        ));
        let acc = SessionAccumulator::new(
            SessionRegistry::new(db.clone()),
            sync,
            mapper.clone(),
            shadow.clone(),
            "shadow-main",
            dir.path().join("data/sessions"),
            CommitIdentity {
                name: "t".into(),
                email: "t@localhost".into(),
            },
            SessionConfig::default(),
        );
        Fixture {
            _dir: dir,
            db,
            shadow_root,
            shadow,
            mapper,
            acc,
        }
    }

    fn write_transcript(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("transcript.jsonl");
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    const REASONING_LINE: &str = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"Turn on debug mode for local runs."},{"type":"tool_use","name":"Edit","input":{"file_path":"config.py"}}]}}"#;

    #[tokio::test]
    async fn test_session_produces_one_commit() {
        let f = fixture();
        let session = f.acc.start(Some("s1".into()), "p1").await.unwrap();
        let wt = PathBuf::from(&session.worktree_path);
        assert!(wt.join("config.py").is_file());

        fs::write(wt.join("config.py"), "DEBUG = True\nPORT = 80\n").unwrap();
        let events = f
            .acc
            .record_tool_use("s1", &ToolEvent::new("Edit", vec!["config.py".into()]))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Modify);
        assert_eq!(events[0].line_ranges, vec![crate::models::LineRange::new(1, 1)]);

        fs::write(wt.join("notes.md"), "todo\n").unwrap();
        f.acc
            .record_tool_use(
                "s1",
                &ToolEvent::new("Write", vec![wt.join("notes.md").display().to_string()]),
            )
            .unwrap();

        // Same content again: nothing new recorded.
        let again = f
            .acc
            .record_tool_use("s1", &ToolEvent::new("Edit", vec!["config.py".into()]))
            .unwrap();
        assert!(again.is_empty());

        let transcript = write_transcript(f._dir.path(), &[REASONING_LINE, "not json"]);
        let closed = f.acc.close("s1", &transcript).await.unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        let sha = closed.shadow_commit.unwrap();

        let git = f.shadow.lock().await.unwrap();
        assert_eq!(git.branch_tip("session/s1").unwrap().as_deref(), Some(sha.as_str()));
        assert_eq!(
            git.commits_between(&closed.shadow_base_commit, &sha).unwrap(),
            vec![sha.clone()]
        );
        let message = git.commit_message(&sha).unwrap();
        assert!(message.starts_with("Turn on debug mode for local runs."));
        assert!(message.contains("Modified config.py"));
        assert!(message.contains("Files: config.py,notes.md"));
        assert!(message.contains("Lines-Added: 1\nLines-Modified: 1\n"));
        assert_eq!(
            f.mapper.find_primary_commit(&git, &sha).unwrap().as_deref(),
            Some("p1")
        );
        // The shadow main branch is untouched by session work.
        assert!(!f.shadow_root.join("notes.md").exists());
    }

    #[tokio::test]
    async fn test_session_without_changes_closes_without_commit() {
        let f = fixture();
        f.acc.start(Some("quiet".into()), "p1").await.unwrap();
        let closed = f
            .acc
            .close("quiet", Path::new("/nonexistent/transcript.jsonl"))
            .await
            .unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert!(closed.shadow_commit.is_none());
        assert_eq!(f.db.count_commit_map().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_transcript_aborts() {
        let f = fixture();
        let session = f.acc.start(Some("s2".into()), "p1").await.unwrap();
        fs::write(PathBuf::from(&session.worktree_path).join("a.py"), "x = 1\n").unwrap();
        f.acc
            .record_tool_use("s2", &ToolEvent::new("Write", vec!["a.py".into()]))
            .unwrap();

        let err = f
            .acc
            .close("s2", Path::new("/nonexistent/transcript.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Abort { .. }));
        let stored = f.acc.registry().get("s2").unwrap();
        assert_eq!(stored.state, SessionState::Aborted);
        assert!(stored.shadow_commit.is_none());
        assert_eq!(f.db.count_commit_map().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transcript_without_reasoning_uses_summary() {
        let f = fixture();
        let session = f.acc.start(Some("s3".into()), "p1").await.unwrap();
        fs::write(PathBuf::from(&session.worktree_path).join("a.py"), "x = 1\n").unwrap();
        f.acc
            .record_tool_use("s3", &ToolEvent::new("Write", vec!["a.py".into()]))
            .unwrap();
        let transcript = write_transcript(
            f._dir.path(),
            &[r#"{"type":"user","message":{"role":"user","content":"go"}}"#],
        );
        let closed = f.acc.close("s3", &transcript).await.unwrap();
        let git = f.shadow.lock().await.unwrap();
        let message = git.commit_message(closed.shadow_commit.as_deref().unwrap()).unwrap();
        assert!(message.starts_with("Agent session: 1 tool use on 1 file"));
    }

    #[tokio::test]
    async fn test_interrupt_rebinds_and_copies_untouched_files() {
        let f = fixture();
        let session = f.acc.start(Some("s4".into()), "p1").await.unwrap();
        let wt = PathBuf::from(&session.worktree_path);
        fs::write(wt.join("a.py"), "agent\n").unwrap();
        f.acc
            .record_tool_use("s4", &ToolEvent::new("Write", vec!["a.py".into()]))
            .unwrap();

        let primary = f.acc.synchronizer.primary_root().to_path_buf();
        fs::write(primary.join("config.py"), "DEBUG = False\nPORT = 8080\n").unwrap();
        fs::write(primary.join("a.py"), "human\n").unwrap();
        let human = vec![
            ChangeEvent::new("config.py", ChangeKind::Modify, None, Some("h1".into()), Actor::Human),
            ChangeEvent::new("a.py", ChangeKind::Create, None, Some("h2".into()), Actor::Human),
        ];
        let rebound = f.acc.interrupt("s4", "p2", human).unwrap();

        assert_eq!(rebound.state, SessionState::Active);
        assert_eq!(rebound.primary_commit_current, "p2");
        assert_eq!(rebound.primary_commit_at_start, "p1");
        assert_eq!(
            fs::read_to_string(wt.join("config.py")).unwrap(),
            "DEBUG = False\nPORT = 8080\n"
        );
        // The agent's file is left alone.
        assert_eq!(fs::read_to_string(wt.join("a.py")).unwrap(), "agent\n");
        assert_eq!(rebound.change_events.len(), 3);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_and_duplicate_ids() {
        let f = fixture();
        assert!(matches!(
            f.acc.start(Some("a/b".into()), "p1").await,
            Err(SessionError::InvalidId(_))
        ));
        f.acc.start(Some("dup".into()), "p1").await.unwrap();
        assert!(matches!(
            f.acc.start(Some("dup".into()), "p1").await,
            Err(SessionError::AlreadyExists(_))
        ));
        let closed = f.acc.close("dup", Path::new("/x")).await.unwrap();
        assert!(matches!(
            f.acc
                .record_tool_use(&closed.session_id, &ToolEvent::new("Edit", vec!["a".into()])),
            Err(SessionError::NotActive { .. })
        ));
    }
}
