//! Commit message rendering.
//!
//! Messages are a lossy, human-facing rendering of a [`ShadowAnnotation`].
//! Nothing in the crate parses them back; the note is the canonical record.

use crate::models::ShadowAnnotation;

/// Marker embedded in every shadowsync-generated commit message.
pub const MARKER: &str = "[shadowsync]";

/// Summary line used when a session left no reasoning behind.
pub fn fallback_summary(tool_uses: usize, files: usize) -> String {
    format!(
        "Agent session: {} tool {} on {} {}",
        tool_uses,
        if tool_uses == 1 { "use" } else { "uses" },
        files,
        if files == 1 { "file" } else { "files" },
    )
}

/// Render the single commit message for a closed session: reasoning
/// paragraphs (or a generated summary), action lines, trailers, marker.
pub fn render_session_message(annotation: &ShadowAnnotation, actions: &[String]) -> String {
    let mut msg = String::new();

    let paragraphs: Vec<&str> = annotation
        .reasoning
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        msg.push_str(&fallback_summary(annotation.tool_uses, annotation.files.len()));
    } else {
        msg.push_str(&paragraphs.join("\n\n"));
    }
    msg.push_str("\n\n");

    if !actions.is_empty() {
        for action in actions {
            msg.push_str(action);
            msg.push('\n');
        }
        msg.push('\n');
    }

    let session = annotation.session_id.as_deref().unwrap_or("-");
    let current = annotation
        .primary_commit_current
        .as_deref()
        .unwrap_or(&annotation.primary_commit);
    msg.push_str(&format!("Shadow-Session: {session}\n"));
    msg.push_str(&format!("Primary-Commit: {current}\n"));
    msg.push_str(&format!(
        "Primary-Commit-At-Start: {}\n",
        annotation.primary_commit
    ));
    msg.push_str(&format!("Files: {}\n", annotation.files.join(",")));
    msg.push_str(&format!("Lines-Added: {}\n", annotation.lines_added));
    msg.push_str(&format!("Lines-Modified: {}\n", annotation.lines_modified));
    msg.push_str(&format!("Lines-Removed: {}\n", annotation.lines_removed));
    msg.push_str(&format!("Tool-Uses: {}\n", annotation.tool_uses));
    msg.push('\n');
    msg.push_str(MARKER);
    msg.push('\n');
    msg
}

/// Render a mirror commit of human changes on the shadow main branch.
pub fn render_sync_message(annotation: &ShadowAnnotation) -> String {
    let n = annotation.files.len();
    format!(
        "Sync primary tree ({} {})\n\nPrimary-Commit: {}\nFiles: {}\n\n{}\n",
        n,
        if n == 1 { "file" } else { "files" },
        annotation.primary_commit,
        annotation.files.join(","),
        MARKER
    )
}

/// Render the commit that lands applied session work on the shadow main
/// branch.
pub fn render_apply_message(annotation: &ShadowAnnotation) -> String {
    format!(
        "Apply agent session {}\n\nShadow-Session: {}\nPrimary-Commit: {}\nFiles: {}\n\n{}\n",
        annotation.session_id.as_deref().unwrap_or("-"),
        annotation.session_id.as_deref().unwrap_or("-"),
        annotation.primary_commit,
        annotation.files.join(","),
        MARKER
    )
}

/// Render the commit that takes a reverted session's work back out of the
/// shadow main branch.
pub fn render_revert_message(annotation: &ShadowAnnotation) -> String {
    format!(
        "Revert agent session {}\n\nShadow-Session: {}\nPrimary-Commit: {}\nFiles: {}\n\n{}\n",
        annotation.session_id.as_deref().unwrap_or("-"),
        annotation.session_id.as_deref().unwrap_or("-"),
        annotation.primary_commit,
        annotation.files.join(","),
        MARKER
    )
}
