//! shadowsync command-line lifecycle triggers.
//!
//! Thin surface over [`ShadowEngine`]: agent hooks call `session-start`,
//! `record-tool` and `session-end` (optionally with the hook JSON on stdin);
//! humans call `sync`, `apply`, `revert`, `conflicts`, `status`, `log` and
//! `find-by-parent`.

mod hook;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use shadowsync_core::config::AppConfig;
use shadowsync_core::engine::{ApplyReport, RevertReport, ShadowEngine};
use shadowsync_core::models::{PendingStatus, ResolutionOutcome, ToolEvent};

use crate::hook::HookPayload;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Shadow history for AI-authored edits.
#[derive(Parser, Debug)]
#[command(
    name = "shadowsync",
    version,
    about = "Keep a shadow history of agent sessions next to a primary repository"
)]
struct Cli {
    /// Primary repository (any path inside it).
    #[arg(short, long, global = true, default_value = ".")]
    repo: String,

    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the shadow repository and mirror the primary tree.
    Init {
        /// Config file to use instead of the generated default.
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Mirror human changes into the shadow tree.
    Sync,

    /// Open an agent session and print its worktree path.
    SessionStart {
        #[arg(short, long)]
        session: Option<String>,

        /// Read the hook JSON payload from stdin.
        #[arg(long)]
        stdin: bool,
    },

    /// Record one tool use of an active session.
    RecordTool {
        #[arg(short, long)]
        session: Option<String>,

        #[arg(short, long, default_value = "Edit")]
        tool: String,

        /// Files the tool touched.
        files: Vec<String>,

        #[arg(long)]
        stdin: bool,
    },

    /// Close a session into its single shadow commit.
    SessionEnd {
        #[arg(short, long)]
        session: Option<String>,

        /// Agent transcript (JSONL).
        #[arg(short, long)]
        transcript: Option<String>,

        #[arg(long)]
        stdin: bool,
    },

    /// Bring a closed session's work into the primary tree.
    Apply {
        session: String,
    },

    /// Take an applied session's work back out of the primary tree.
    Revert {
        session: String,
    },

    /// List the shadow commits recorded against a primary commit.
    FindByParent {
        /// Primary revision (SHA, branch, `HEAD~2`, ...).
        rev: String,

        /// Also include every primary commit after `rev` up to this one.
        #[arg(long)]
        until: Option<String>,
    },

    /// Inspect and settle staged conflict resolutions.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// List recent sessions.
    Sessions {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show engine status.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the shadow history with its annotations.
    Log {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Check the commit index against the shadow notes, rebuilding on mismatch.
    Verify,

    /// Rebuild the commit index from the shadow notes.
    RebuildIndex,

    /// Show recent audit log entries.
    Audit {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Validate the repository's configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
enum ConflictsAction {
    /// List open resolutions, or every resolution of one session.
    List {
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Show the resolution attempts of a session.
    History { session: String },
    /// Show the human, agent and proposed content of one resolution.
    Show { id: String },
    /// Write the proposed content into the primary tree.
    Accept { id: String },
    /// Discard a staged resolution.
    Reject { id: String },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let root = match find_primary_root(&expand_tilde(&cli.repo)) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_logging(&root, cli.verbose);

    match run(cli, &root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, root: &Path) -> Result<()> {
    match cli.command {
        Commands::Init { config } => cmd_init(root, config.as_deref()).await,
        Commands::Validate => cmd_validate(root),
        command => {
            let engine = ShadowEngine::open(root).with_context(|| {
                format!(
                    "no shadow repository for {} (run `shadowsync init` first)",
                    root.display()
                )
            })?;
            match command {
                Commands::Sync => cmd_sync(&engine).await,
                Commands::SessionStart { session, stdin } => {
                    let payload = read_payload(stdin)?;
                    cmd_session_start(&engine, session.or(payload.session_id)).await
                }
                Commands::RecordTool {
                    session,
                    tool,
                    files,
                    stdin,
                } => {
                    let payload = read_payload(stdin)?;
                    let session = session
                        .or(payload.session_id.clone())
                        .context("--session is required")?;
                    let tool = payload.tool_name.clone().unwrap_or(tool);
                    let mut files = files;
                    files.extend(payload.file_path());
                    cmd_record_tool(&engine, &session, ToolEvent::new(tool, files)).await
                }
                Commands::SessionEnd {
                    session,
                    transcript,
                    stdin,
                } => {
                    let payload = read_payload(stdin)?;
                    let session = session
                        .or(payload.session_id)
                        .context("--session is required")?;
                    let transcript = transcript
                        .or(payload.transcript_path)
                        .context("--transcript is required")?;
                    cmd_session_end(&engine, &session, &expand_tilde(&transcript)).await
                }
                Commands::Apply { session } => cmd_apply(&engine, &session).await,
                Commands::Revert { session } => cmd_revert(&engine, &session).await,
                Commands::FindByParent { rev, until } => {
                    cmd_find_by_parent(&engine, &rev, until.as_deref()).await
                }
                Commands::Conflicts { action } => cmd_conflicts(&engine, action).await,
                Commands::Sessions { limit } => cmd_sessions(&engine, limit),
                Commands::Status { json } => cmd_status(&engine, json).await,
                Commands::Log { limit } => cmd_log(&engine, limit).await,
                Commands::Verify => cmd_verify(&engine).await,
                Commands::RebuildIndex => {
                    let rows = engine
                        .rebuild_index()
                        .await
                        .context("failed to rebuild commit index")?;
                    println!("{}", style::success(&format!("Commit index rebuilt ({rows} mappings)")));
                    Ok(())
                }
                Commands::Audit { limit } => cmd_audit(&engine, limit),
                Commands::Init { .. } | Commands::Validate => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

/// Walk up from `start` to the directory holding `.git`.
fn find_primary_root(start: &Path) -> Result<PathBuf> {
    let start = std::fs::canonicalize(start)
        .with_context(|| format!("cannot resolve path {}", start.display()))?;
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
        .with_context(|| format!("{} is not inside a git repository", start.display()))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Warnings to stderr; the configured level to a daily file under the data
/// directory once it exists. `RUST_LOG` overrides both.
fn init_logging(root: &Path, verbose: bool) -> Option<WorkerGuard> {
    let config = AppConfig::load_for_primary(root).unwrap_or_default();
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_filter);

    let data_dir = config.shadow.data_dir_for(root);
    if !data_dir.is_dir() {
        tracing_subscriber::registry().with(stderr).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "shadowsync.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.shadow.log_level));
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(file_filter);
    tracing_subscriber::registry().with(stderr).with(file).init();
    Some(guard)
}

fn read_payload(stdin: bool) -> Result<HookPayload> {
    if stdin {
        HookPayload::from_stdin()
    } else {
        Ok(HookPayload::default())
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_init(root: &Path, config_path: Option<&str>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            let mut config = AppConfig::load_from_file(expand_tilde(path))
                .context("failed to load configuration file")?;
            config
                .resolve_env_vars()
                .context("failed to resolve environment variables")?;
            config.validate().context("invalid configuration")?;
            config
        }
        None => AppConfig::load_for_primary(root).context("failed to load configuration")?,
    };

    let engine = ShadowEngine::init(root, config)
        .await
        .context("failed to initialize shadow repository")?;
    let status = engine.status().await.context("failed to read status")?;

    println!("{}", style::success("Shadow repository ready"));
    println!("  Primary     : {}", root.display());
    println!("  Data dir    : {}", engine.data_dir().display());
    println!(
        "  Shadow tip  : {}",
        status.shadow_tip.as_deref().map(style::short_sha).unwrap_or("-")
    );
    println!();
    println!("Next steps:");
    println!("  1. Point the agent's session hooks at `shadowsync session-start --stdin`");
    println!("     and `shadowsync session-end --stdin`");
    println!("  2. Record edits with `shadowsync record-tool --stdin`");
    Ok(())
}

fn cmd_validate(root: &Path) -> Result<()> {
    let config = AppConfig::load_for_primary(root).context("configuration is invalid")?;
    println!("{}", style::success("Configuration is valid"));
    println!("  Data dir      : {}", config.shadow.data_dir_for(root).display());
    println!("  Shadow branch : {}", config.shadow.shadow_branch);
    println!(
        "  Agent         : {}",
        if config.agent.enabled {
            format!("{} (timeout {}s)", config.agent.command, config.agent.timeout_secs)
        } else {
            "disabled".to_string()
        }
    );
    Ok(())
}

async fn cmd_sync(engine: &ShadowEngine) -> Result<()> {
    let report = engine.sync().await.context("sync failed")?;
    if report.events.is_empty() {
        println!("{}", style::success("Shadow tree already in sync"));
        return Ok(());
    }
    for event in &report.events {
        println!("  {:<8} {}", event.kind.to_string(), event.file_path);
    }
    println!(
        "{}",
        style::success(&format!(
            "Synced {} change(s) into {}",
            report.events.len(),
            report.shadow_commit.as_deref().map(style::short_sha).unwrap_or("-")
        ))
    );
    Ok(())
}

async fn cmd_session_start(engine: &ShadowEngine, session: Option<String>) -> Result<()> {
    let session = engine
        .session_start(session)
        .await
        .context("failed to start session")?;
    // The worktree path is the only stdout output so hooks can capture it.
    println!("{}", session.worktree_path);
    eprintln!(
        "{}",
        style::dim(&format!(
            "session {} at {}",
            session.session_id,
            style::short_sha(&session.primary_commit_at_start)
        ))
    );
    Ok(())
}

async fn cmd_record_tool(engine: &ShadowEngine, session: &str, tool: ToolEvent) -> Result<()> {
    if tool.file_paths.is_empty() {
        tracing::debug!(session, tool = %tool.tool_name, "tool use named no files");
        return Ok(());
    }
    let report = engine
        .record_tool_use(session, &tool)
        .await
        .with_context(|| format!("failed to record {} for session {}", tool.tool_name, session))?;
    if report.interrupted {
        eprintln!("{}", style::warn("Primary tree moved; session re-synced"));
    }
    for event in &report.events {
        eprintln!(
            "{}",
            style::dim(&format!("{} {} {}", event.actor, event.kind, event.file_path))
        );
    }
    Ok(())
}

async fn cmd_session_end(engine: &ShadowEngine, session: &str, transcript: &Path) -> Result<()> {
    let session = engine
        .session_end(session, transcript)
        .await
        .context("failed to close session")?;
    match &session.shadow_commit {
        Some(sha) => println!(
            "{}",
            style::success(&format!(
                "Session {} closed into {} ({} files)",
                session.session_id,
                style::short_sha(sha),
                session.agent_files().len()
            ))
        ),
        None => println!(
            "{}",
            style::success(&format!("Session {} closed with no changes", session.session_id))
        ),
    }
    Ok(())
}

/// Ctrl-C while the reasoning agent is working cancels the attempt; the
/// conflict is then staged for manual resolution and the apply finishes.
async fn cmd_apply(engine: &ShadowEngine, session: &str) -> Result<()> {
    let apply = engine.apply_session(session);
    tokio::pin!(apply);
    let result = loop {
        tokio::select! {
            result = &mut apply => break result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{}", style::warn("Cancelling resolution attempts"));
                engine.cancel_resolutions();
            }
        }
    };
    let report = result.with_context(|| format!("failed to apply session {session}"))?;
    print_apply_report(&report);
    Ok(())
}

fn print_apply_report(report: &ApplyReport) {
    println!();
    println!("{}", style::header(&format!("Session {}", report.session_id)));
    for path in &report.applied {
        let note = if report.related.contains(path) {
            " (next to a human change)"
        } else {
            ""
        };
        println!("  applied  {path}{note}");
    }
    for path in &report.merged {
        println!("  merged   {path}");
    }
    for pending in &report.staged {
        println!("  staged   {} [{}] {}", pending.file_path, pending.status, style::dim(&pending.id));
    }
    println!();
    if report.staged.is_empty() {
        println!("{}", style::success("Nothing left to review"));
    } else {
        println!(
            "{}",
            style::warn(&format!(
                "{} file(s) need review: shadowsync conflicts list",
                report.staged.len()
            ))
        );
    }
}

async fn cmd_revert(engine: &ShadowEngine, session: &str) -> Result<()> {
    let report = engine
        .revert_session(session)
        .await
        .with_context(|| format!("failed to revert session {session}"))?;
    print_revert_report(&report);
    Ok(())
}

fn print_revert_report(report: &RevertReport) {
    println!();
    println!("{}", style::header(&format!("Session {}", report.session_id)));
    for path in &report.restored {
        println!("  restored {path}");
    }
    for path in &report.kept {
        println!("  kept     {path} (changed since apply)");
    }
    for id in &report.withdrawn {
        println!("  withdrew {}", style::dim(id));
    }
    println!();
    if report.kept.is_empty() {
        println!("{}", style::success("Session reverted"));
    } else {
        println!(
            "{}",
            style::warn(&format!(
                "Session reverted; {} file(s) were left as they are",
                report.kept.len()
            ))
        );
    }
}

async fn cmd_find_by_parent(engine: &ShadowEngine, rev: &str, until: Option<&str>) -> Result<()> {
    let matches = engine
        .find_by_primary(rev, until)
        .await
        .with_context(|| format!("failed to look up shadow commits for {rev}"))?;
    if matches.is_empty() {
        println!("No shadow commits recorded for {rev}.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Primary", "Shadow", "Session", "Summary", "Files"]);
    for m in &matches {
        table.add_row(vec![
            Cell::new(style::short_sha(&m.primary_commit)),
            Cell::new(style::short_sha(&m.shadow_commit)),
            Cell::new(m.session_id.as_deref().unwrap_or("-")),
            Cell::new(&m.summary),
            Cell::new(m.files.len()),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cmd_conflicts(engine: &ShadowEngine, action: ConflictsAction) -> Result<()> {
    match action {
        ConflictsAction::List { session } => {
            let open = match session {
                Some(id) => engine
                    .db()
                    .list_resolutions_for_session(&id)
                    .context("failed to list session resolutions")?,
                None => engine
                    .open_resolutions()
                    .context("failed to list resolutions")?,
            };
            if open.is_empty() {
                println!("{}", style::success("No open resolutions"));
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["ID", "File", "Severity", "Status", "Outcome", "Created"]);
            for p in &open {
                let status = match p.status {
                    PendingStatus::Proposed => Cell::new("proposed").fg(Color::Green),
                    _ => Cell::new(p.status.to_string()).fg(Color::Yellow),
                };
                table.add_row(vec![
                    Cell::new(&p.id),
                    Cell::new(&p.file_path),
                    Cell::new(&p.severity),
                    status,
                    Cell::new(p.outcome.map(|o| o.to_string()).unwrap_or_else(|| "-".into())),
                    Cell::new(local_time(&p.created_at)),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        ConflictsAction::History { session } => {
            let attempts = engine
                .db()
                .list_resolution_log(&session)
                .context("failed to read resolution log")?;
            if attempts.is_empty() {
                println!("No resolution attempts for session {session}.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Conflict", "File", "Outcome", "Duration", "Detail"]);
            for a in &attempts {
                let outcome = match a.outcome {
                    ResolutionOutcome::Resolved => Cell::new("resolved").fg(Color::Green),
                    other => Cell::new(other.to_string()).fg(Color::Red),
                };
                table.add_row(vec![
                    Cell::new(&a.conflict_id),
                    Cell::new(&a.file_path),
                    outcome,
                    Cell::new(format!("{} ms", a.duration_ms)),
                    Cell::new(a.detail.as_deref().unwrap_or("")),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        ConflictsAction::Show { id } => {
            let pending = engine
                .db()
                .get_pending_resolution(&id)
                .context("database error")?
                .with_context(|| format!("resolution '{id}' not found"))?;

            println!("{}", style::header(&format!("Resolution {}", pending.id)));
            println!("  File     : {}", pending.file_path);
            println!("  Session  : {}", pending.session_id);
            println!("  Severity : {}", pending.severity);
            println!("  Status   : {}", pending.status);
            for (label, content) in [
                ("Human", &pending.human_content),
                ("Agent", &pending.agent_content),
                ("Proposed", &pending.proposed_content),
            ] {
                if let Some(content) = content {
                    println!();
                    println!("{} ({} bytes):", style::header(label), content.len());
                    println!("{}", "-".repeat(40));
                    println!("{}", content.trim_end());
                }
            }
            Ok(())
        }

        ConflictsAction::Accept { id } => {
            let settled = engine
                .accept_resolution(&id)
                .await
                .context("failed to accept resolution")?;
            println!(
                "{}",
                style::success(&format!("Wrote proposed {} into the primary tree", settled.file_path))
            );
            Ok(())
        }

        ConflictsAction::Reject { id } => {
            let settled = engine
                .reject_resolution(&id)
                .context("failed to reject resolution")?;
            println!(
                "{}",
                style::success(&format!("Discarded resolution for {}", settled.file_path))
            );
            Ok(())
        }
    }
}

fn cmd_sessions(engine: &ShadowEngine, limit: u32) -> Result<()> {
    let sessions = engine
        .db()
        .list_sessions(limit)
        .context("failed to list sessions")?;
    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Session", "State", "Started", "Primary", "Files", "Commit"]);
    for s in &sessions {
        table.add_row(vec![
            Cell::new(&s.session_id),
            Cell::new(s.state.to_string()),
            Cell::new(local_time(&s.start_time)),
            Cell::new(style::short_sha(&s.primary_commit_at_start)),
            Cell::new(s.agent_files().len()),
            Cell::new(s.shadow_commit.as_deref().map(style::short_sha).unwrap_or("-")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn cmd_status(engine: &ShadowEngine, json: bool) -> Result<()> {
    let status = engine.status().await.context("failed to read status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", style::header("shadowsync status"));
    println!();
    println!("  Primary          : {}", status.primary_root.display());
    println!(
        "  Primary HEAD     : {}",
        status.primary_head.as_deref().map(style::short_sha).unwrap_or("none")
    );
    println!(
        "  Shadow tip       : {}",
        status.shadow_tip.as_deref().map(style::short_sha).unwrap_or("none")
    );
    println!("  Sync state       : {}", status.sync_state);
    println!(
        "  Last sync at     : {}",
        status.last_sync_at.as_deref().unwrap_or("never")
    );
    println!("  Divergent paths  : {}", status.divergent_paths);
    println!("  Commit mappings  : {}", status.commit_mappings);
    println!("  Open resolutions : {}", status.open_resolutions.len());
    println!("  Active sessions  : {}", status.active_sessions.len());
    for s in &status.active_sessions {
        println!(
            "    {} {} ({} files)",
            s.session_id,
            style::dim(&s.state.to_string()),
            s.agent_files().len()
        );
    }
    Ok(())
}

async fn cmd_log(engine: &ShadowEngine, limit: usize) -> Result<()> {
    let shadow = engine.shadow();
    let git = shadow.lock().await.context("failed to lock shadow repository")?;
    let commits = git
        .log(&engine.config().shadow.shadow_branch, limit)
        .context("failed to read shadow log")?;

    for commit in &commits {
        let annotation = engine
            .mapper()
            .read_annotation(&git, &commit.sha)
            .context("failed to read annotation")?;
        let when = DateTime::from_timestamp(commit.author_time, 0)
            .map(|t| local_time(&t))
            .unwrap_or_default();
        let actor = match annotation.as_ref().and_then(|a| a.session_id.as_deref()) {
            Some(_) => style::actor("agent"),
            None => style::actor("human"),
        };
        println!(
            "{} {} {} {}",
            style::short_sha(&commit.sha),
            style::dim(&when),
            actor,
            commit.summary
        );
        if let Some(a) = annotation {
            println!(
                "    {} {}",
                style::dim("primary"),
                style::short_sha(&a.primary_commit)
            );
            if !a.files.is_empty() {
                println!("    {} {}", style::dim("files"), a.files.join(", "));
            }
        }
    }
    Ok(())
}

async fn cmd_verify(engine: &ShadowEngine) -> Result<()> {
    let report = engine
        .verify_mappings()
        .await
        .context("failed to verify commit mappings")?;
    if report.inconsistencies.is_empty() {
        println!("{}", style::success("Commit index matches the shadow notes"));
        return Ok(());
    }
    for (sha, detail) in &report.inconsistencies {
        println!("  {} {}", style::short_sha(sha), detail);
    }
    if let Some(rows) = report.rebuilt {
        println!(
            "{}",
            style::warn(&format!(
                "{} inconsistencies; index rebuilt with {rows} mappings",
                report.inconsistencies.len()
            ))
        );
    }
    Ok(())
}

fn cmd_audit(engine: &ShadowEngine, limit: u32) -> Result<()> {
    let entries = engine
        .db()
        .list_audit_log(limit)
        .context("failed to list audit entries")?;
    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Time", "Action", "Session", "Details"]);
    for entry in &entries {
        let action = if entry.success {
            Cell::new(&entry.action)
        } else {
            Cell::new(&entry.action).fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&entry.created_at[..19.min(entry.created_at.len())]),
            action,
            Cell::new(entry.session_id.as_deref().unwrap_or("-")),
            Cell::new(entry.details.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn local_time(t: &DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
