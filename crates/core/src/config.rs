//! TOML-based configuration system for shadowsync.
//!
//! The configuration lives at `<primary>/.shadowsync/config.toml` even when
//! `shadow.data_dir` moves the rest of the data elsewhere. Every section has
//! defaults, so an empty file (or no file at all) is a valid
//! configuration. The reasoning-agent command may be overridden through the
//! environment; see [`AppConfig::resolve_env_vars`].

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// Environment variable that overrides `agent.command`.
pub const AGENT_COMMAND_ENV: &str = "SHADOWSYNC_AGENT_COMMAND";

/// Name of the per-repository data directory.
pub const DATA_DIR_NAME: &str = ".shadowsync";

/// Configuration file name inside [`DATA_DIR_NAME`].
pub const CONFIG_FILE: &str = "config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Shadow repository settings.
    #[serde(default)]
    pub shadow: ShadowConfig,

    /// Dual-tree synchronizer settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Session accumulator settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Conflict detection settings.
    #[serde(default)]
    pub conflict: ConflictConfig,

    /// External reasoning agent settings.
    #[serde(default)]
    pub agent: AgentConfig,
}

// ---------------------------------------------------------------------------
// Shadow
// ---------------------------------------------------------------------------

/// Shadow repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Data directory, relative to the primary root unless absolute.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Branch of the shadow repository that mirrors the primary tree.
    #[serde(default = "default_shadow_branch")]
    pub shadow_branch: String,

    /// Author name used for shadow commits.
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Author email used for shadow commits.
    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// How long a writer waits for another process to release the shadow
    /// repository.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DATA_DIR_NAME)
}
fn default_log_level() -> String {
    "info".into()
}
fn default_shadow_branch() -> String {
    "shadow-main".into()
}
fn default_author_name() -> String {
    "shadowsync".into()
}
fn default_author_email() -> String {
    "shadowsync@localhost".into()
}
fn default_lock_timeout() -> u64 {
    30
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            shadow_branch: default_shadow_branch(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl ShadowConfig {
    /// The absolute data directory for a given primary root.
    pub fn data_dir_for(&self, primary_root: &Path) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            primary_root.join(&self.data_dir)
        }
    }

    /// The data directory relative to the primary root, slash-separated,
    /// when it lives inside the primary tree.
    pub fn data_dir_in_tree(&self, primary_root: &Path) -> Option<String> {
        let rel = if self.data_dir.is_absolute() {
            self.data_dir.strip_prefix(primary_root).ok()?.to_path_buf()
        } else {
            self.data_dir.clone()
        };
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Dual-tree synchronizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Glob patterns excluded from both trees, matched on the relative path.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Files larger than this many bytes are not mirrored. 0 = unlimited.
    #[serde(default)]
    pub max_file_size: u64,
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/node_modules/**".into(),
        "**/target/**".into(),
        "**/__pycache__/**".into(),
        "**/*.pyc".into(),
        "**/.DS_Store".into(),
    ]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: default_ignore_patterns(),
            max_file_size: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Session accumulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum reasoning fragments rendered into a commit message. 0 = unlimited.
    #[serde(default)]
    pub max_reasoning_fragments: usize,

    /// Seconds of slack allowed before the session start when filtering
    /// transcript events, to tolerate clock skew between hook and agent.
    #[serde(default = "default_transcript_window")]
    pub transcript_window_secs: u64,
}

fn default_transcript_window() -> u64 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reasoning_fragments: 0,
            transcript_window_secs: default_transcript_window(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict
// ---------------------------------------------------------------------------

/// Conflict detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Normalized file-stem similarity at which two files count as related.
    #[serde(default = "default_related_threshold")]
    pub related_name_threshold: f64,

    /// Write clean three-way merges of disjoint same-file edits without asking.
    #[serde(default = "default_true")]
    pub auto_merge_disjoint: bool,
}

fn default_related_threshold() -> f64 {
    0.8
}
fn default_true() -> bool {
    true
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            related_name_threshold: default_related_threshold(),
            auto_merge_disjoint: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// External reasoning agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Whether hard conflicts are delegated to the agent at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Executable to run. The prompt is written to its stdin.
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Arguments passed to the executable.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,

    /// Hard deadline for one resolution attempt.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_agent_command() -> String {
    "claude".into()
}
fn default_agent_args() -> Vec<String> {
    vec!["-p".into()]
}
fn default_agent_timeout() -> u64 {
    60
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_agent_command(),
            args: default_agent_args(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** apply environment overrides -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Where the configuration of a primary tree lives.
    pub fn path_for_primary(primary_root: &Path) -> PathBuf {
        primary_root.join(DATA_DIR_NAME).join(CONFIG_FILE)
    }

    /// Load the config for a primary tree, falling back to defaults when the
    /// repository has no `config.toml` yet.
    pub fn load_for_primary(primary_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_for_primary(primary_root);
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(command) = resolve_optional_env(AGENT_COMMAND_ENV, "agent.command") {
            let mut parts = command.split_whitespace().map(str::to_string);
            if let Some(program) = parts.next() {
                self.agent.command = program;
                self.agent.args = parts.collect();
            }
        }
        Ok(())
    }

    /// Validate that all fields are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.shadow.data_dir.is_absolute() {
            let normal = self
                .shadow
                .data_dir
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
            if !normal || self.shadow.data_dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "shadow.data_dir".into(),
                    detail: format!(
                        "'{}' must be absolute or a plain path below the primary root",
                        self.shadow.data_dir.display()
                    ),
                });
            }
        }
        if self.shadow.lock_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "shadow.lock_timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.shadow.shadow_branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "shadow.shadow_branch".into(),
                detail: "shadow branch must not be empty".into(),
            });
        }
        if git2::Branch::name_is_valid(&self.shadow.shadow_branch) == Ok(false) {
            return Err(ConfigError::InvalidValue {
                field: "shadow.shadow_branch".into(),
                detail: format!("'{}' is not a valid branch name", self.shadow.shadow_branch),
            });
        }
        if self.shadow.author_name.trim().is_empty() || self.shadow.author_email.trim().is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "shadow.author_name".into(),
                detail: "author name and email must not be empty".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.conflict.related_name_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "conflict.related_name_threshold".into(),
                detail: "threshold must be between 0.0 and 1.0".into(),
            });
        }
        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.agent.enabled && self.agent.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "agent.command".into(),
                detail: "agent command must not be empty when the agent is enabled".into(),
            });
        }
        for pattern in &self.sync.ignore_patterns {
            if pattern.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "sync.ignore_patterns".into(),
                    detail: "ignore patterns must not be empty strings".into(),
                });
            }
        }

        Ok(())
    }

    /// The text `shadowsync init` writes for this configuration: the
    /// commented template when the data directory is the default one, the
    /// serialized configuration otherwise.
    pub fn to_file_contents(&self) -> Result<String, ConfigError> {
        if self.shadow.data_dir == default_data_dir() {
            return Ok(Self::default_template().to_string());
        }
        let body =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(format!("# shadowsync configuration\n\n{body}"))
    }

    /// The commented template written by `shadowsync init`.
    pub fn default_template() -> &'static str {
        r#"# shadowsync configuration

[shadow]
# data_dir = ".shadowsync"
log_level = "info"
shadow_branch = "shadow-main"
author_name = "shadowsync"
author_email = "shadowsync@localhost"
# Seconds a writer waits while another process holds the shadow repository.
lock_timeout_secs = 30

[sync]
ignore_patterns = ["**/node_modules/**", "**/target/**", "**/__pycache__/**", "**/*.pyc", "**/.DS_Store"]
# Files above this size (bytes) are not mirrored. 0 = unlimited.
max_file_size = 0

[session]
# Cap on reasoning paragraphs per commit message. 0 = unlimited.
max_reasoning_fragments = 0
transcript_window_secs = 5

[conflict]
related_name_threshold = 0.8
auto_merge_disjoint = true

[agent]
enabled = true
# Override with SHADOWSYNC_AGENT_COMMAND="claude -p"
command = "claude"
args = ["-p"]
timeout_secs = 60
"#
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` when it
/// is set and non-empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.trim().is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[shadow]
log_level = "debug"
shadow_branch = "mirror"
author_name = "bot"
author_email = "bot@example.com"

[sync]
ignore_patterns = ["*.log", "build/**"]
max_file_size = 1048576

[session]
max_reasoning_fragments = 12

[conflict]
related_name_threshold = 0.75
auto_merge_disjoint = false

[agent]
command = "my-agent"
args = ["--resolve"]
timeout_secs = 30
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.shadow.shadow_branch, "mirror");
        assert_eq!(config.sync.max_file_size, 1_048_576);
        assert_eq!(config.session.max_reasoning_fragments, 12);
        assert_eq!(config.session.transcript_window_secs, 5);
        assert!(!config.conflict.auto_merge_disjoint);
        assert_eq!(config.agent.args, vec!["--resolve"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.shadow.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.shadow.data_dir, PathBuf::from(".shadowsync"));
        assert_eq!(config.shadow.shadow_branch, "shadow-main");
        assert_eq!(config.conflict.related_name_threshold, 0.8);
        assert!(config.conflict.auto_merge_disjoint);
        assert_eq!(config.agent.timeout_secs, 60);
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.session.max_reasoning_fragments, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_template_parses() {
        let config: AppConfig = toml::from_str(AppConfig::default_template()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sync.ignore_patterns.len(), 5);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = AppConfig::default();
        config.conflict.related_name_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "conflict.related_name_threshold"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = AppConfig::default();
        config.agent.timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "agent.timeout_secs"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_branch() {
        let mut config = AppConfig::default();
        config.shadow.shadow_branch = "bad..name".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_for() {
        let config = AppConfig::default();
        assert_eq!(
            config.shadow.data_dir_for(Path::new("/work/project")),
            PathBuf::from("/work/project/.shadowsync")
        );
    }

    #[test]
    fn test_validate_rejects_escaping_data_dir() {
        for bad in ["../elsewhere", "./data", ""] {
            let mut config = AppConfig::default();
            config.shadow.data_dir = PathBuf::from(bad);
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::InvalidValue { ref field, .. }) if field == "shadow.data_dir"
                ),
                "{bad:?} accepted"
            );
        }
        let mut config = AppConfig::default();
        config.shadow.data_dir = PathBuf::from("tools/shadow-data");
        config.validate().unwrap();
    }

    #[test]
    fn test_data_dir_in_tree() {
        let root = Path::new("/work/project");
        let mut shadow = ShadowConfig::default();
        assert_eq!(shadow.data_dir_in_tree(root).as_deref(), Some(".shadowsync"));

        shadow.data_dir = PathBuf::from("tools/shadow-data");
        assert_eq!(shadow.data_dir_in_tree(root).as_deref(), Some("tools/shadow-data"));

        shadow.data_dir = PathBuf::from("/work/project/cache/shadow");
        assert_eq!(shadow.data_dir_in_tree(root).as_deref(), Some("cache/shadow"));

        shadow.data_dir = PathBuf::from("/var/lib/shadow");
        assert_eq!(shadow.data_dir_in_tree(root), None);
    }

    #[test]
    fn test_relocated_data_dir_survives_file_round_trip() {
        let mut config = AppConfig::default();
        assert_eq!(config.to_file_contents().unwrap(), AppConfig::default_template());

        config.shadow.data_dir = PathBuf::from("shadow-data");
        config.agent.enabled = false;
        let reread: AppConfig = toml::from_str(&config.to_file_contents().unwrap()).unwrap();
        assert_eq!(reread.shadow.data_dir, PathBuf::from("shadow-data"));
        assert!(!reread.agent.enabled);
        reread.validate().unwrap();
    }

    #[test]
    fn test_resolve_env_vars_overrides_agent_command() {
        std::env::set_var(AGENT_COMMAND_ENV, "fake-agent --json");
        let mut config = AppConfig::default();
        config.resolve_env_vars().unwrap();
        std::env::remove_var(AGENT_COMMAND_ENV);

        assert_eq!(config.agent.command, "fake-agent");
        assert_eq!(config.agent.args, vec!["--json"]);
    }
}
