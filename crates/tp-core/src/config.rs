use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.taskpilot/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            git: GitConfig::default(),
            agents: AgentsConfig::default(),
            events: EventsConfig::default(),
            watcher: WatcherConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.taskpilot/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskpilot")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// SQLite database path for the task store.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory holding one bare clone per distinct remote URL.
    #[serde(default = "default_repos_base_dir")]
    pub repos_base_dir: String,
    /// Directory holding one linked worktree per task.
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,
    /// Per-file limit for inline diff content snapshots, in bytes.
    #[serde(default = "default_max_file_content_bytes")]
    pub max_file_content_bytes: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repos_base_dir: default_repos_base_dir(),
            worktrees_dir: default_worktrees_dir(),
            max_file_content_bytes: default_max_file_content_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Initial deadline per agent run, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How long before the deadline the warning fires, in milliseconds.
    #[serde(default = "default_warning_threshold_ms")]
    pub warning_threshold_ms: u64,
    /// Grant added by each `extend_timeout` call, in milliseconds.
    #[serde(default = "default_extension_ms")]
    pub extension_ms: u64,
    /// First-output silence threshold for the CLI runner, in milliseconds.
    #[serde(default = "default_silence_warning_ms")]
    pub silence_warning_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            warning_threshold_ms: default_warning_threshold_ms(),
            extension_ms: default_extension_ms(),
            silence_warning_ms: default_silence_warning_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Ring-buffer size for agent logs, per task.
    #[serde(default = "default_log_cap")]
    pub log_cap_per_task: usize,
    /// Ring-buffer size for chat/tool events, per task.
    #[serde(default = "default_chat_cap")]
    pub chat_cap_per_task: usize,
    /// Bounded in-flight queue per bus subscriber.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log_cap_per_task: default_log_cap(),
            chat_cap_per_task: default_chat_cap(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// PR watcher poll cadence, in milliseconds.
    #[serde(default = "default_pr_poll_interval_ms")]
    pub pr_poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            pr_poll_interval_ms: default_pr_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_db_path() -> String {
    "~/.taskpilot/taskpilot.db".to_string()
}

fn default_repos_base_dir() -> String {
    "~/.taskpilot/repos".to_string()
}

fn default_worktrees_dir() -> String {
    "~/.taskpilot/worktrees".to_string()
}

fn default_max_file_content_bytes() -> u64 {
    100 * 1024
}

fn default_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_warning_threshold_ms() -> u64 {
    5 * 60 * 1000
}

fn default_extension_ms() -> u64 {
    5 * 60 * 1000
}

fn default_silence_warning_ms() -> u64 {
    30 * 1000
}

fn default_log_cap() -> usize {
    1000
}

fn default_chat_cap() -> usize {
    500
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_pr_poll_interval_ms() -> u64 {
    60 * 1000
}

fn default_bind_addr() -> String {
    "127.0.0.1:7430".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
