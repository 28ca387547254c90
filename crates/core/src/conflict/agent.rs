//! External reasoning agent boundary.
//!
//! The resolver only ever talks to a [`ReasoningAgent`]. [`CliAgent`] runs a
//! configured command with the prompt on stdin; tests plug in fakes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::AgentError;

/// One resolution request sent to the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// Isolated scratch directory holding base/human/agent copies. Never a
    /// live tree.
    pub workspace: PathBuf,
}

/// Trait for external reasoning agents.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Produce the full resolved file content for the request.
    async fn resolve(&self, request: AgentRequest) -> Result<String, AgentError>;
}

/// Runs an external command, prompt on stdin, answer on stdout.
#[derive(Debug, Clone)]
pub struct CliAgent {
    command: String,
    args: Vec<String>,
}

impl CliAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl ReasoningAgent for CliAgent {
    fn name(&self) -> &str {
        &self.command
    }

    async fn resolve(&self, request: AgentRequest) -> Result<String, AgentError> {
        debug!(command = %self.command, workspace = %request.workspace.display(), "invoking agent");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Unavailable(format!("{}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                warn!(error = %e, "agent closed stdin early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(AgentError::Failed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if stdout.trim().is_empty() {
            return Err(AgentError::EmptyResponse);
        }
        Ok(stdout)
    }
}
