//! Transcript extraction.
//!
//! The agent writes its conversation as a JSONL file. Each line is decoded
//! into a tagged [`RawEntry`] at the boundary; everything past this module
//! works on [`ReasoningEvent`]s and [`TranscriptToolUse`]s. Unknown entry
//! kinds are skipped, undecodable lines are skipped and counted.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::errors::TranscriptError;
use crate::models::ReasoningEvent;

/// Tools whose use writes files.
pub const FILE_WRITING_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// A file-writing tool use found in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptToolUse {
    pub tool_name: String,
    pub file_path: Option<String>,
    /// Number of edits for `MultiEdit`, 1 otherwise.
    pub edits: usize,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TranscriptToolUse {
    /// One-line human description, e.g. `Created auth.py`.
    pub fn describe(&self) -> String {
        let name = self
            .file_path
            .as_deref()
            .map(|p| p.rsplit('/').next().unwrap_or(p))
            .unwrap_or("unknown file");
        match self.tool_name.as_str() {
            "Write" => format!("Created {}", name),
            "MultiEdit" => format!("Made {} changes to {}", self.edits, name),
            "NotebookEdit" => format!("Edited notebook {}", name),
            _ => format!("Modified {}", name),
        }
    }
}

/// Everything extracted from one transcript.
#[derive(Debug, Clone, Default)]
pub struct TranscriptSummary {
    /// Reasoning fragments in transcript order, deduplicated.
    pub reasoning: Vec<ReasoningEvent>,
    /// File-writing tool uses in transcript order.
    pub tool_uses: Vec<TranscriptToolUse>,
    /// User messages seen.
    pub user_messages: usize,
    /// Lines that decoded into a recognized entry (before time filtering).
    pub decoded_entries: usize,
    /// Lines that were not valid JSON or had the wrong shape.
    pub skipped_lines: usize,
}

impl TranscriptSummary {
    /// `true` if nothing in the transcript could be decoded.
    pub fn is_empty(&self) -> bool {
        self.decoded_entries == 0
    }
}

// ---------------------------------------------------------------------------
// Raw wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawEntry {
    Assistant {
        #[serde(default)]
        timestamp: Option<String>,
        message: RawMessage,
    },
    Message {
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        thinking: bool,
        #[serde(default)]
        content: RawContent,
    },
    User {
        #[serde(default)]
        timestamp: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: RawContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Items(Vec<serde_json::Value>),
    #[default]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawItem {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        thinking: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Read and extract a transcript file.
///
/// Entries timestamped before `since` are ignored; entries without a
/// timestamp are kept.
pub fn extract(
    path: &Path,
    since: Option<DateTime<Utc>>,
) -> Result<TranscriptSummary, TranscriptError> {
    let content = std::fs::read_to_string(path).map_err(|source| TranscriptError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    let summary = parse(&content, since);
    info!(
        path = %path.display(),
        reasoning = summary.reasoning.len(),
        tool_uses = summary.tool_uses.len(),
        skipped = summary.skipped_lines,
        "transcript extracted"
    );
    Ok(summary)
}

/// Extract from transcript text already in memory.
pub fn parse(content: &str, since: Option<DateTime<Utc>>) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();
    let mut fragments: Vec<(String, Option<DateTime<Utc>>)> = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: RawEntry = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                debug!(line = line_no + 1, error = %e, "skipping undecodable transcript line");
                summary.skipped_lines += 1;
                continue;
            }
        };

        match entry {
            RawEntry::Assistant { timestamp, message } => {
                summary.decoded_entries += 1;
                if message.role.as_deref().is_some_and(|r| r != "assistant") {
                    continue;
                }
                let ts = parse_timestamp(timestamp.as_deref());
                if is_before(ts, since) {
                    continue;
                }
                collect_content(&message.content, false, ts, &mut fragments, &mut summary);
            }
            RawEntry::Message {
                timestamp,
                role,
                thinking,
                content,
            } => {
                summary.decoded_entries += 1;
                let ts = parse_timestamp(timestamp.as_deref());
                if is_before(ts, since) {
                    continue;
                }
                match role.as_deref() {
                    Some("assistant") => {
                        collect_content(&content, thinking, ts, &mut fragments, &mut summary)
                    }
                    Some("user") => summary.user_messages += 1,
                    _ => {}
                }
            }
            RawEntry::User { timestamp } => {
                summary.decoded_entries += 1;
                if !is_before(parse_timestamp(timestamp.as_deref()), since) {
                    summary.user_messages += 1;
                }
            }
            RawEntry::Other => {}
        }
    }

    summary.reasoning = dedup_reasoning(fragments);
    summary
}

/// Deduplicate reasoning fragments by exact text, preserving first-seen order,
/// and assign ordinals.
pub fn dedup_reasoning(
    fragments: impl IntoIterator<Item = (String, Option<DateTime<Utc>>)>,
) -> Vec<ReasoningEvent> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (text, timestamp) in fragments {
        if seen.insert(text.clone()) {
            out.push(ReasoningEvent {
                text,
                timestamp,
                ordinal: out.len(),
            });
        }
    }
    out
}

fn collect_content(
    content: &RawContent,
    message_is_thinking: bool,
    ts: Option<DateTime<Utc>>,
    fragments: &mut Vec<(String, Option<DateTime<Utc>>)>,
    summary: &mut TranscriptSummary,
) {
    let items = match content {
        RawContent::Text(text) => {
            if message_is_thinking {
                push_fragment(text, ts, fragments);
            }
            return;
        }
        RawContent::Items(items) => items,
        RawContent::Empty => return,
    };

    for value in items {
        let item: RawItem = match serde_json::from_value(value.clone()) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "skipping malformed transcript content item");
                continue;
            }
        };
        match item {
            RawItem::Thinking { thinking } => push_fragment(&thinking, ts, fragments),
            RawItem::Text { text, thinking } if thinking || message_is_thinking => {
                push_fragment(&text, ts, fragments)
            }
            RawItem::Text { .. } => {}
            RawItem::ToolUse { name, input } => {
                if FILE_WRITING_TOOLS.contains(&name.as_str()) {
                    summary.tool_uses.push(tool_use_from_input(name, &input, ts));
                }
            }
            RawItem::Other => {}
        }
    }
}

fn push_fragment(
    text: &str,
    ts: Option<DateTime<Utc>>,
    fragments: &mut Vec<(String, Option<DateTime<Utc>>)>,
) {
    let text = text.trim();
    if !text.is_empty() {
        fragments.push((text.to_string(), ts));
    }
}

fn tool_use_from_input(
    tool_name: String,
    input: &serde_json::Value,
    timestamp: Option<DateTime<Utc>>,
) -> TranscriptToolUse {
    let file_path = ["file_path", "notebook_path", "path"]
        .iter()
        .find_map(|key| input.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string);
    let edits = input
        .get("edits")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(1);
    TranscriptToolUse {
        tool_name,
        file_path,
        edits,
        timestamp,
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn is_before(ts: Option<DateTime<Utc>>, since: Option<DateTime<Utc>>) -> bool {
    matches!((ts, since), (Some(t), Some(s)) if t < s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_line(items: &str) -> String {
        format!(
            r#"{{"type":"assistant","timestamp":"2025-03-01T10:00:00Z","message":{{"role":"assistant","content":[{}]}}}}"#,
            items
        )
    }

    #[test]
    fn test_extracts_thinking_and_tool_uses() {
        let transcript = [
            assistant_line(r#"{"type":"thinking","thinking":"plan auth"}"#),
            assistant_line(
                r#"{"type":"tool_use","name":"Write","input":{"file_path":"src/auth.py","content":"x"}}"#,
            ),
            assistant_line(r#"{"type":"text","text":"Done, all good."}"#),
            assistant_line(
                r#"{"type":"tool_use","name":"MultiEdit","input":{"file_path":"src/user.py","edits":[{},{}]}}"#,
            ),
            assistant_line(r#"{"type":"tool_use","name":"Read","input":{"file_path":"README.md"}}"#),
        ]
        .join("\n");

        let summary = parse(&transcript, None);
        assert_eq!(summary.decoded_entries, 5);
        assert_eq!(summary.reasoning.len(), 1);
        assert_eq!(summary.reasoning[0].text, "plan auth");
        assert_eq!(summary.tool_uses.len(), 2);
        assert_eq!(summary.tool_uses[0].describe(), "Created auth.py");
        assert_eq!(summary.tool_uses[1].describe(), "Made 2 changes to user.py");
    }

    #[test]
    fn test_text_with_thinking_flag_counts_as_reasoning() {
        let line = assistant_line(r#"{"type":"text","thinking":true,"text":"  refactor first  "}"#);
        let summary = parse(&line, None);
        assert_eq!(summary.reasoning[0].text, "refactor first");
    }

    #[test]
    fn test_message_shape_with_thinking_flag() {
        let transcript = concat!(
            r#"{"type":"message","role":"assistant","thinking":true,"content":[{"type":"text","text":"plan X"}]}"#,
            "\n",
            r#"{"type":"message","role":"user","content":"please continue"}"#,
        );
        let summary = parse(transcript, None);
        assert_eq!(summary.reasoning.len(), 1);
        assert_eq!(summary.user_messages, 1);
    }

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let transcript = [
            assistant_line(r#"{"type":"thinking","thinking":"plan X"}"#),
            assistant_line(r#"{"type":"thinking","thinking":"plan X"}"#),
            assistant_line(r#"{"type":"thinking","thinking":"plan Y"}"#),
        ]
        .join("\n");
        let summary = parse(&transcript, None);
        let texts: Vec<&str> = summary.reasoning.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["plan X", "plan Y"]);
        assert_eq!(summary.reasoning[1].ordinal, 1);
    }

    #[test]
    fn test_skips_garbage_and_unknown_kinds() {
        let transcript = concat!(
            "not json at all\n",
            r#"{"type":"summary","summary":"old session"}"#,
            "\n",
            r#"{"no_type":true}"#,
            "\n",
        );
        let summary = parse(transcript, None);
        assert!(summary.is_empty());
        assert_eq!(summary.skipped_lines, 2);
    }

    #[test]
    fn test_filters_entries_before_since() {
        let old = r#"{"type":"assistant","timestamp":"2025-01-01T00:00:00Z","message":{"role":"assistant","content":[{"type":"thinking","thinking":"old plan"}]}}"#;
        let new = assistant_line(r#"{"type":"thinking","thinking":"new plan"}"#);
        let since = DateTime::parse_from_rfc3339("2025-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let summary = parse(&format!("{}\n{}", old, new), Some(since));
        assert_eq!(summary.decoded_entries, 2);
        assert_eq!(summary.reasoning.len(), 1);
        assert_eq!(summary.reasoning[0].text, "new plan");
    }

    #[test]
    fn test_extract_unreadable() {
        let err = extract(Path::new("/nonexistent/transcript.jsonl"), None).unwrap_err();
        assert!(matches!(err, TranscriptError::Unreadable { .. }));
    }
}
