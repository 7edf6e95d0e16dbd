//! Error type shared by the session registry, gateway, and project resolver.
//!
//! Every variant maps to a stable wire code (see [`Error::code`]) so the
//! gateway can turn any failure into a typed `error` message for the client.
//! Spawn failures are deliberately *not* reported through this type by
//! [`crate::sessions::SessionManager::create`]; they surface as a terminated
//! session carrying the diagnostics instead.

use std::path::PathBuf;

/// All errors produced by agentdeck core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Session limit reached (max {0})")]
    SessionLimit(usize),

    #[error("Connection is bound to session {bound}; send `detach` before binding {requested}")]
    AlreadyBound { bound: String, requested: String },

    #[error("Session {session_id} is a {actual} session")]
    KindMismatch {
        session_id: String,
        actual: &'static str,
    },

    #[error("Connection is not bound to a session")]
    NotBound,

    #[error("Session {0} input stream is closed")]
    InputClosed(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid project path {path}: {reason}")]
    InvalidProjectPath { path: PathBuf, reason: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Filesystem watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code carried in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session-not-found",
            Self::SessionLimit(_) => "session-limit",
            Self::AlreadyBound { .. } => "already-bound",
            Self::KindMismatch { .. } => "kind-mismatch",
            Self::NotBound => "not-bound",
            Self::InputClosed(_) => "input-closed",
            Self::ProjectNotFound(_) => "project-not-found",
            Self::InvalidProjectPath { .. } => "invalid-project-path",
            Self::Spawn { .. } => "spawn-failed",
            Self::Config(_) => "config",
            Self::Watch(_) => "watch",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
