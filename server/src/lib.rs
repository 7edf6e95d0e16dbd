#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! agentdeck library — the session and process-bridging core behind the
//! `agentdeck` binary.
//!
//! - `ws` — connection gateway for `/ws/conversation` and `/ws/shell`
//! - `sessions` — session registry, lifecycle, output buffer, I/O bridge
//! - `process` — pipe and PTY process spawning
//! - `projects` — project resolution, path validation, directory watcher
//! - `auth` — bearer credential extraction and verification
//! - `audit` — in-memory audit log
//! - `protocol` — JSON message envelope
//! - `routes` — REST endpoints and router assembly
//! - `config` — configuration loading

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod process;
pub mod projects;
pub mod protocol;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use audit::AuditLog;
pub use config::Config;
pub use error::{Error, Result};
pub use sessions::SessionManager;
pub use state::AppState;
