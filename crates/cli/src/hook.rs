//! Hook payloads read from stdin.
//!
//! Agent hooks deliver one JSON object per invocation. Only the fields the
//! lifecycle triggers need are decoded; everything else is ignored.

use std::io::Read;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<ToolInput>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolInput {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub notebook_path: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl HookPayload {
    /// Decode a payload. Blank input is an empty payload.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).context("failed to decode hook JSON")
    }

    pub fn from_stdin() -> Result<Self> {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read hook JSON from stdin")?;
        Self::parse(&raw)
    }

    /// The file the tool touched, if it named one.
    pub fn file_path(&self) -> Option<String> {
        let input = self.tool_input.as_ref()?;
        input
            .file_path
            .clone()
            .or_else(|| input.notebook_path.clone())
            .or_else(|| input.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edit_payload() {
        let raw = r#"{
            "session_id": "abc-123",
            "transcript_path": "/tmp/t.jsonl",
            "hook_event_name": "PostToolUse",
            "tool_name": "Edit",
            "tool_input": {"file_path": "/work/src/auth.py", "old_string": "a", "new_string": "b"}
        }"#;
        let payload = HookPayload::parse(raw).unwrap();
        assert_eq!(payload.session_id.as_deref(), Some("abc-123"));
        assert_eq!(payload.tool_name.as_deref(), Some("Edit"));
        assert_eq!(payload.file_path().as_deref(), Some("/work/src/auth.py"));
    }

    #[test]
    fn test_notebook_and_blank_payloads() {
        let payload =
            HookPayload::parse(r#"{"tool_input": {"notebook_path": "nb.ipynb"}}"#).unwrap();
        assert_eq!(payload.file_path().as_deref(), Some("nb.ipynb"));

        let empty = HookPayload::parse("  \n").unwrap();
        assert!(empty.session_id.is_none());
        assert!(empty.file_path().is_none());
        assert!(HookPayload::parse("not json").is_err());
    }
}
