//! AI-assisted conflict resolution.
//!
//! A [`ConflictResolver`] runs one bounded attempt per conflict:
//!
//! 1. Base, human and agent versions are materialized in a scratch
//!    [`tempfile::TempDir`]; live trees are never touched.
//! 2. A prompt is built from the conflicting hunks (human side as "ours"),
//!    the file language, a structural excerpt and the session reasoning.
//! 3. The agent runs on a spawned task; its answer comes back over a oneshot
//!    channel raced against the deadline and a cancellation signal. Late
//!    answers are dropped and the task is aborted.
//! 4. The answer is validated (markers, syntax, human lines preserved) and
//!    staged as a [`PendingResolution`]. Nothing is written to either tree
//!    until a human accepts it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::agent::{AgentRequest, CliAgent, ReasoningAgent};
use super::detector::ConflictRecord;
use super::merger::{self, Merger};
use super::syntax;
use crate::config::AgentConfig;
use crate::db::Database;
use crate::errors::{AgentError, ConflictError};
use crate::models::{PendingResolution, PendingStatus, ResolutionOutcome, ResolutionOutcomeRecord};

/// Maximum lines in the structural excerpt of a file.
const STRUCTURE_LINE_LIMIT: usize = 20;

const STRUCTURE_PREFIXES: &[&str] = &[
    "import ", "from ", "class ", "def ", "async def ", "#", "/**", "/*", "//", "fn ", "pub ",
    "struct ", "impl ", "function ", "export ", "use ",
];

/// Everything the resolver needs for one conflict.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub conflict: ConflictRecord,
    pub session_id: String,
    pub base: Option<String>,
    pub human: String,
    pub agent: String,
    pub reasoning: Vec<String>,
}

/// One bounded resolution attempt. Transient: only the outcome, its duration
/// and a validated proposal outlive it.
#[derive(Debug, Clone)]
pub struct ResolutionAttempt {
    pub conflict: ConflictRecord,
    /// The prompt sent to the agent.
    pub context: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub outcome: ResolutionOutcome,
    pub proposed_patch: Option<String>,
    pub detail: Option<String>,
    pub duration: Duration,
}

enum Race {
    Answer(String),
    AgentFailed(AgentError),
    Deadline,
    Cancelled,
}

pub struct ConflictResolver {
    agent: Option<Arc<dyn ReasoningAgent>>,
    timeout: Duration,
    /// Set once cancelled; stays set for the resolver's lifetime.
    cancelled: Arc<AtomicBool>,
    cancel: Arc<Notify>,
}

impl ConflictResolver {
    /// `agent = None` disables delegation: every attempt falls back at once.
    pub fn new(agent: Option<Arc<dyn ReasoningAgent>>, timeout: Duration) -> Self {
        Self {
            agent,
            timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let agent: Option<Arc<dyn ReasoningAgent>> = if config.enabled {
            Some(Arc::new(CliAgent::from_config(config)))
        } else {
            None
        };
        Self::new(agent, Duration::from_secs(config.timeout_secs))
    }

    /// Abort every attempt waiting on the agent. Attempts started later end
    /// as cancelled without calling it.
    pub fn cancel_in_flight(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run one attempt. Returns `Err` only for scratch-workspace I/O failures.
    pub async fn attempt(
        &self,
        request: &ResolutionRequest,
    ) -> Result<ResolutionAttempt, ConflictError> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let deadline = started_at
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let file_path = request.conflict.file_path.clone();

        let workspace = tempfile::Builder::new().prefix("shadowsync-resolve-").tempdir()?;
        let base = request.base.clone().unwrap_or_default();
        let merge = Merger::three_way_merge(&base, &request.human, &request.agent);
        let ext = Path::new(&file_path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        for (name, content) in [
            ("base", base.as_str()),
            ("human", request.human.as_str()),
            ("agent", request.agent.as_str()),
            ("merged", merge.merged_content.as_str()),
        ] {
            std::fs::write(workspace.path().join(format!("{name}{ext}")), content)?;
        }

        let context = build_prompt(request, &merge.merged_content, &merge.conflict_hunks);

        let mut attempt = ResolutionAttempt {
            conflict: request.conflict.clone(),
            context: context.clone(),
            started_at,
            deadline,
            outcome: ResolutionOutcome::TimedOut,
            proposed_patch: None,
            detail: None,
            duration: Duration::ZERO,
        };

        let Some(agent) = self.agent.clone() else {
            attempt.detail = Some("reasoning agent disabled".into());
            attempt.duration = clock.elapsed();
            info!(file = %file_path, "agent disabled, conflict left for manual resolution");
            return Ok(attempt);
        };

        // Register interest before checking the flag so a cancel landing in
        // between is not lost.
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if self.is_cancelled() {
            attempt.detail = Some("cancelled".into());
            attempt.duration = clock.elapsed();
            info!(file = %file_path, "resolution cancelled before the agent was called");
            return Ok(attempt);
        }

        let (tx, rx) = oneshot::channel();
        let agent_request = AgentRequest {
            prompt: context,
            workspace: workspace.path().to_path_buf(),
        };
        let task = tokio::spawn(async move {
            let _ = tx.send(agent.resolve(agent_request).await);
        });

        let race = tokio::select! {
            answer = rx => match answer {
                Ok(Ok(text)) => Race::Answer(text),
                Ok(Err(e)) => Race::AgentFailed(e),
                Err(_) => Race::AgentFailed(AgentError::EmptyResponse),
            },
            _ = tokio::time::sleep(self.timeout) => Race::Deadline,
            _ = &mut cancelled => Race::Cancelled,
        };
        task.abort();

        match race {
            Race::Answer(text) => {
                let (outcome, proposal, detail) = validate(request, &text);
                attempt.outcome = outcome;
                attempt.proposed_patch = proposal;
                attempt.detail = detail;
            }
            Race::AgentFailed(e) => {
                warn!(file = %file_path, error = %e, "agent unavailable, treating as timeout");
                attempt.detail = Some(e.to_string());
            }
            Race::Deadline => {
                warn!(file = %file_path, timeout_secs = self.timeout.as_secs(), "agent timed out");
                attempt.detail = Some(format!("no answer within {}s", self.timeout.as_secs()));
            }
            Race::Cancelled => {
                warn!(file = %file_path, "resolution cancelled");
                attempt.detail = Some("cancelled".into());
            }
        }
        attempt.duration = clock.elapsed();
        info!(
            file = %file_path,
            outcome = %attempt.outcome,
            duration_ms = attempt.duration.as_millis() as u64,
            "resolution attempt finished"
        );
        Ok(attempt)
    }

    /// Persist the attempt's outcome: a `proposed` record for a validated
    /// answer, a `manual` one otherwise. The outcome and duration go to the
    /// session's resolution log.
    pub fn stage(
        db: &Database,
        request: &ResolutionRequest,
        attempt: &ResolutionAttempt,
    ) -> Result<PendingResolution, ConflictError> {
        let status = if attempt.outcome == ResolutionOutcome::Resolved {
            PendingStatus::Proposed
        } else {
            PendingStatus::Manual
        };
        let pending = PendingResolution {
            id: request.conflict.id.clone(),
            session_id: request.session_id.clone(),
            file_path: request.conflict.file_path.clone(),
            severity: request.conflict.severity.to_string(),
            status,
            outcome: Some(attempt.outcome),
            base_content: request.base.clone(),
            human_content: Some(request.human.clone()),
            agent_content: Some(request.agent.clone()),
            proposed_content: attempt.proposed_patch.clone(),
            created_at: Utc::now(),
            resolved_at: None,
        };
        db.insert_pending_resolution(&pending)?;
        db.insert_resolution_log(&request.session_id, &Self::outcome_record(attempt))?;
        let _ = db.insert_audit_log(
            "conflict_staged",
            Some(&request.session_id),
            None,
            Some(&format!("{} ({})", pending.file_path, attempt.outcome)),
            true,
        );
        Ok(pending)
    }

    /// Stage a conflict the agent cannot help with (deletions, binary
    /// content) straight to manual resolution.
    pub fn stage_manual(
        db: &Database,
        session_id: &str,
        conflict: &ConflictRecord,
        human: Option<String>,
        agent: Option<String>,
        reason: &str,
    ) -> Result<PendingResolution, ConflictError> {
        let pending = PendingResolution {
            id: conflict.id.clone(),
            session_id: session_id.to_string(),
            file_path: conflict.file_path.clone(),
            severity: conflict.severity.to_string(),
            status: PendingStatus::Manual,
            outcome: Some(ResolutionOutcome::Rejected),
            base_content: None,
            human_content: human,
            agent_content: agent,
            proposed_content: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        db.insert_pending_resolution(&pending)?;
        db.insert_resolution_log(
            session_id,
            &ResolutionOutcomeRecord {
                conflict_id: conflict.id.clone(),
                file_path: conflict.file_path.clone(),
                outcome: ResolutionOutcome::Rejected,
                duration_ms: 0,
                detail: Some(reason.to_string()),
            },
        )?;
        Ok(pending)
    }

    /// The loggable summary of an attempt.
    pub fn outcome_record(attempt: &ResolutionAttempt) -> ResolutionOutcomeRecord {
        ResolutionOutcomeRecord {
            conflict_id: attempt.conflict.id.clone(),
            file_path: attempt.conflict.file_path.clone(),
            outcome: attempt.outcome,
            duration_ms: attempt.duration.as_millis() as u64,
            detail: attempt.detail.clone(),
        }
    }

    /// Mark a staged proposal accepted and return it. The caller writes the
    /// proposed content.
    pub fn accept(db: &Database, id: &str) -> Result<PendingResolution, ConflictError> {
        let pending = Self::open_record(db, id)?;
        if pending.status != PendingStatus::Proposed || pending.proposed_content.is_none() {
            return Err(ConflictError::NoProposal(id.to_string()));
        }
        db.settle_pending_resolution(id, PendingStatus::Accepted)?;
        let _ = db.insert_audit_log(
            "conflict_accepted",
            Some(&pending.session_id),
            None,
            Some(&pending.file_path),
            true,
        );
        info!(id, file = %pending.file_path, "resolution accepted");
        Ok(pending)
    }

    /// Mark a staged record rejected. Nothing is written anywhere.
    pub fn reject(db: &Database, id: &str) -> Result<PendingResolution, ConflictError> {
        let pending = Self::open_record(db, id)?;
        db.settle_pending_resolution(id, PendingStatus::Rejected)?;
        let _ = db.insert_audit_log(
            "conflict_rejected",
            Some(&pending.session_id),
            None,
            Some(&pending.file_path),
            true,
        );
        info!(id, file = %pending.file_path, "resolution rejected");
        Ok(pending)
    }

    fn open_record(db: &Database, id: &str) -> Result<PendingResolution, ConflictError> {
        let pending = db
            .get_pending_resolution(id)?
            .ok_or_else(|| ConflictError::NotFound(id.to_string()))?;
        if pending.status.is_settled() {
            return Err(ConflictError::AlreadyResolved(id.to_string()));
        }
        Ok(pending)
    }
}

// ---------------------------------------------------------------------------
// Prompt and validation
// ---------------------------------------------------------------------------

/// Import and definition lines, at most [`STRUCTURE_LINE_LIMIT`].
pub fn structure_excerpt(content: &str) -> String {
    content
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            STRUCTURE_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        })
        .take(STRUCTURE_LINE_LIMIT)
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_prompt(
    request: &ResolutionRequest,
    merged_with_markers: &str,
    hunks: &[merger::ConflictHunk],
) -> String {
    let file_path = &request.conflict.file_path;
    let language = syntax::language_for(file_path);
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Resolve a merge conflict in `{file_path}` ({language}).\n\n\
         USER CHANGES ALWAYS WIN.\n\
         1. Keep every line the user added or changed, exactly.\n\
         2. Integrate the AI's changes only where they fit around the user's.\n\
         3. When the two cannot be combined, keep the user's version.\n\
         4. Keep the file's existing style and indentation.\n\
         5. Reply with the complete resolved file only: no commentary, no conflict markers.\n\n"
    ));

    prompt.push_str("What the AI was working on:\n");
    if request.reasoning.is_empty() {
        prompt.push_str("(no reasoning recorded)\n");
    } else {
        for paragraph in &request.reasoning {
            prompt.push_str(paragraph.trim());
            prompt.push_str("\n\n");
        }
    }

    let structure = structure_excerpt(&request.human);
    if !structure.is_empty() {
        prompt.push_str(&format!("\nFile structure:\n```{language}\n{structure}\n```\n"));
    }

    for (i, hunk) in hunks.iter().enumerate() {
        prompt.push_str(&format!(
            "\nConflict {} (lines {}-{}):\nUSER'S CODE (must be preserved):\n{}\nAI'S CODE (integrate if compatible):\n{}\n",
            i + 1,
            hunk.start_line,
            hunk.end_line,
            hunk.human.join("\n"),
            hunk.agent.join("\n"),
        ));
    }

    prompt.push_str(&format!(
        "\nFull file with conflict markers (user side first):\n```{language}\n{merged_with_markers}\n```\n"
    ));
    prompt
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_+.#-]*[ \t]*\r?\n(.*?)\r?\n?```\s*$").ok())
        .as_ref()
}

/// Strip one surrounding Markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> String {
    fence_pattern()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|body| body.as_str().to_string())
        .unwrap_or_else(|| text.to_string())
}

fn validate(
    request: &ResolutionRequest,
    answer: &str,
) -> (ResolutionOutcome, Option<String>, Option<String>) {
    let mut proposal = strip_code_fence(answer);
    if proposal.trim().is_empty() {
        return (ResolutionOutcome::Rejected, None, Some("empty answer".into()));
    }
    if request.human.ends_with('\n') && !proposal.ends_with('\n') {
        proposal.push('\n');
    }

    if merger::has_conflict_markers(&proposal) {
        return (
            ResolutionOutcome::Rejected,
            None,
            Some("conflict markers remain".into()),
        );
    }

    if let Some(checker) = syntax::checker_for(&request.conflict.file_path) {
        if let Err(detail) = checker.check(&proposal) {
            debug!(checker = checker.name(), %detail, "proposal failed syntax check");
            return (
                ResolutionOutcome::SyntaxInvalid,
                None,
                Some(format!("{}: {}", checker.name(), detail)),
            );
        }
    }

    let base = request.base.as_deref().unwrap_or("");
    let kept: std::collections::HashSet<&str> = proposal.lines().map(str::trim).collect();
    if let Some(lost) = merger::inserted_lines(base, &request.human)
        .into_iter()
        .find(|line| !kept.contains(line.as_str()))
    {
        return (
            ResolutionOutcome::Rejected,
            None,
            Some(format!("human line dropped: {lost}")),
        );
    }
    if let Some(revived) = merger::deleted_lines(base, &request.human)
        .into_iter()
        .find(|line| kept.contains(line.as_str()))
    {
        return (
            ResolutionOutcome::Rejected,
            None,
            Some(format!("human deletion undone: {revived}")),
        );
    }

    (ResolutionOutcome::Resolved, Some(proposal), None)
}
