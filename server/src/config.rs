//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AGENTDECK_API_KEY`, `AGENTDECK_LISTEN`,
//!    `AGENTDECK_PROJECTS_ROOT`
//! 2. **Config file** — path via `--config <path>`, or `agentdeck.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:3001"
//! max_sessions = 32
//! session_buffer_size = 1000
//! outbound_queue = 256
//! reaper_interval_secs = 60
//! idle_timeout_secs = 1800
//! terminate_grace_ms = 5000
//!
//! [auth]
//! api_key = "your-secret-key"
//! username = "operator"
//!
//! [assistant]
//! binary = "claude"
//! resume_flag = "--resume"
//! session_id_flag = "--session-id"
//!
//! [shell]
//! default_shell = "/bin/sh"
//! use_pty = true
//!
//! [projects]
//! root = "~/.claude/projects"
//! debounce_ms = 300
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:3001`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrently registered sessions (default 32).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Output entries retained per session for late joiners (default 1000).
    #[serde(default = "default_session_buffer_size")]
    pub session_buffer_size: usize,
    /// Per-connection fan-out queue depth; overflow drops the connection's
    /// subscription (default 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Seconds between reaper sweeps (default 60).
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Seconds a detached session may stay idle before the reaper
    /// terminates it (default 1800).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL in milliseconds (default 5000).
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Default terminal rows for PTY sessions (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Default terminal columns for PTY sessions (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
}

/// Single-operator credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token. Override with `AGENTDECK_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Username attached to the authenticated principal.
    #[serde(default = "default_username")]
    pub username: String,
    /// Numeric id attached to the authenticated principal.
    #[serde(default = "default_user_id")]
    pub user_id: u64,
}

/// How the assistant CLI is invoked for conversation sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    /// Assistant executable, resolved through `PATH` (default `claude`).
    #[serde(default = "default_assistant_binary")]
    pub binary: String,
    /// Arguments passed on every invocation.
    #[serde(default = "default_assistant_args")]
    pub args: Vec<String>,
    /// Flag followed by the session id when resuming (default `--resume`).
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Flag followed by the session id for fresh sessions, so the id stays
    /// stable across later resumption (default `--session-id`).
    #[serde(default = "default_session_id_flag")]
    pub session_id_flag: String,
}

/// Interactive shell settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary for terminal sessions (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Back shell sessions with a PTY (default true). When false the shell
    /// runs on plain pipes and `resize` is accepted but has no effect.
    #[serde(default = "default_use_pty")]
    pub use_pty: bool,
}

/// Project discovery and watching.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsConfig {
    /// Directory holding one sub-directory of conversation logs per project.
    #[serde(default = "default_projects_root")]
    pub root: String,
    /// When set, absolute project paths must live under this directory.
    #[serde(default)]
    pub workspace_root: Option<String>,
    /// Quiet window for coalescing filesystem events (default 300 ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:3001".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_session_buffer_size() -> usize {
    1000
}
fn default_outbound_queue() -> usize {
    256
}
fn default_reaper_interval_secs() -> u64 {
    60
}
fn default_idle_timeout_secs() -> u64 {
    30 * 60
}
fn default_terminate_grace_ms() -> u64 {
    5000
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_username() -> String {
    "operator".to_string()
}
fn default_user_id() -> u64 {
    1
}
fn default_assistant_binary() -> String {
    "claude".to_string()
}
fn default_assistant_args() -> Vec<String> {
    [
        "--print",
        "--verbose",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
fn default_resume_flag() -> String {
    "--resume".to_string()
}
fn default_session_id_flag() -> String {
    "--session-id".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_use_pty() -> bool {
    true
}
fn default_projects_root() -> String {
    "~/.claude/projects".to_string()
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            session_buffer_size: default_session_buffer_size(),
            outbound_queue: default_outbound_queue(),
            reaper_interval_secs: default_reaper_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            terminate_grace_ms: default_terminate_grace_ms(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            username: default_username(),
            user_id: default_user_id(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: default_assistant_binary(),
            args: default_assistant_args(),
            resume_flag: default_resume_flag(),
            session_id_flag: default_session_id_flag(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            use_pty: default_use_pty(),
        }
    }
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            root: default_projects_root(),
            workspace_root: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl ProjectsConfig {
    /// Projects root with a leading `~` expanded.
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.root).as_ref())
    }

    pub fn workspace_root_path(&self) -> Option<PathBuf> {
        self.workspace_root
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(p).as_ref()))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `agentdeck.toml` in
    /// the current directory is used when present, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("agentdeck.toml").exists() {
            Self::from_file(Path::new("agentdeck.toml"))?
        } else {
            Config::default()
        };

        if let Ok(key) = std::env::var("AGENTDECK_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("AGENTDECK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(root) = std::env::var("AGENTDECK_PROJECTS_ROOT") {
            config.projects.root = root;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {e}", path.display())))
    }

    /// Parse a TOML document, filling omitted fields with defaults.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
