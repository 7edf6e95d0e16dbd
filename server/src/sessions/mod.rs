//! Session registry and process lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, attaching to, and
//! ending sessions. Nothing else mutates the registry; readers get
//! [`SessionInfo`] snapshots.
//!
//! - **At most one process per id**: `create` checks for a live session and
//!   inserts the new one under the same write lock, so rapid repeated `init`
//!   messages for one id never double-spawn.
//! - **Spawn failure is a result, not an error**: it comes back as a
//!   `terminated` [`SessionInfo`] carrying the diagnostics.
//! - **Single exit path**: explicit terminate, the reaper, and shutdown all go
//!   through [`ManagedSession::terminate`]; the per-session exit observer is
//!   what finally releases the registry entry.
//!
//! ## Concurrency
//!
//! The map is behind a tokio `RwLock`. Lookups take a read lock and clone the
//! `Arc<ManagedSession>` out, so slow operations (terminate, input) never run
//! while the registry is locked.

pub mod bridge;
pub mod buffer;
pub mod session;
pub mod state;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog};
use crate::config::{AssistantConfig, Config, ShellConfig};
use crate::error::{Error, Result};
use crate::process;

pub use bridge::Subscription;
pub use buffer::{OutputBuffer, OutputEntry, OutputStream};
pub use session::{ManagedSession, SessionInfo};
pub use state::{ExitInfo, ExitReason, Lifecycle, SessionKind, SessionState};

/// Exit records kept for sessions that are gone, so a late `init` can still be
/// told how its session ended.
const MAX_TOMBSTONES: usize = 128;

/// Limits and process settings the manager needs from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_sessions: usize,
    pub buffer_size: usize,
    pub outbound_queue: usize,
    /// Zero disables reaping.
    pub idle_timeout: Duration,
    pub terminate_grace: Duration,
    pub default_rows: u16,
    pub default_cols: u16,
    pub assistant: AssistantConfig,
    pub shell: ShellConfig,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.server.max_sessions,
            buffer_size: config.server.session_buffer_size,
            outbound_queue: config.server.outbound_queue,
            idle_timeout: config.server.idle_timeout(),
            terminate_grace: config.server.terminate_grace(),
            default_rows: config.server.default_terminal_rows,
            default_cols: config.server.default_terminal_cols,
            assistant: config.assistant.clone(),
            shell: config.shell.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub kind: SessionKind,
    /// Already validated by the caller.
    pub project_path: PathBuf,
    /// Reuse this id (attach if live, otherwise spawn under it).
    pub session_id: Option<String>,
    /// Spawn with the resume flag instead of the fresh-session flag.
    pub resume: bool,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// Result of [`SessionManager::attach`].
pub struct Attachment {
    pub session_id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    /// Buffered output after the requested `since`, oldest first.
    pub replay: Vec<OutputEntry>,
    /// Entries evicted before they could be replayed.
    pub dropped: u64,
    /// Live output and the final `session-ended`.
    pub subscription: Subscription,
    /// Connection that was receiving output before this attach.
    pub displaced: Option<Uuid>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<ManagedSession>>,
    ended: VecDeque<(String, ExitInfo)>,
}

impl Registry {
    fn push_tombstone(&mut self, id: String, exit: ExitInfo) {
        self.ended.retain(|(existing, _)| *existing != id);
        if self.ended.len() >= MAX_TOMBSTONES {
            self.ended.pop_front();
        }
        self.ended.push_back((id, exit));
    }
}

/// Cloneable handle; all clones share one registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<RwLock<Registry>>,
    settings: Arc<SessionSettings>,
    audit: Arc<AuditLog>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings, audit: Arc<AuditLog>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
            settings: Arc::new(settings),
            audit,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Create a session, or return the live one already registered under the
    /// requested id.
    pub async fn create(&self, req: CreateRequest) -> Result<SessionInfo> {
        let mut registry = self.inner.write().await;

        if let Some(id) = &req.session_id {
            if let Some(existing) = registry.sessions.get(id) {
                if existing.kind != req.kind {
                    return Err(Error::KindMismatch {
                        session_id: id.clone(),
                        actual: existing.kind.as_str(),
                    });
                }
                return Ok(existing.info().await);
            }
        }

        if registry.sessions.len() >= self.settings.max_sessions {
            return Err(Error::SessionLimit(self.settings.max_sessions));
        }

        let id = req
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // An id whose earlier process ran and exited continues that
        // conversation; the assistant refuses a reused fresh-session id.
        let resume = req.resume
            || (req.kind == SessionKind::Conversation
                && registry
                    .ended
                    .iter()
                    .any(|(ended, exit)| *ended == id && exit.reason != ExitReason::SpawnFailed));
        let spec = match req.kind {
            SessionKind::Conversation => {
                process::conversation_command(&self.settings.assistant, &id, resume)
            }
            SessionKind::Shell => process::shell_command(
                &self.settings.shell,
                req.rows.unwrap_or(self.settings.default_rows),
                req.cols.unwrap_or(self.settings.default_cols),
            ),
        };

        let spawned = match process::spawn(&spec, &req.project_path) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!("Session {id}: {e}");
                let exit = ExitInfo::spawn_failed(e.to_string());
                registry.push_tombstone(id.clone(), exit.clone());
                drop(registry);
                self.audit
                    .record(
                        AuditKind::SessionEnded,
                        format!("{} session {id} failed to start", req.kind.as_str()),
                        Some(json!({ "sessionId": id, "error": e.to_string() })),
                    )
                    .await;
                return Ok(SessionInfo::spawn_failed(
                    id,
                    req.kind,
                    req.project_path,
                    exit,
                ));
            }
        };

        let started = session::ManagedSession::start(
            id.clone(),
            req.kind,
            req.project_path.clone(),
            spawned,
            self.settings.buffer_size,
        );
        let session = Arc::clone(&started.session);
        registry.sessions.insert(id.clone(), Arc::clone(&session));
        registry.ended.retain(|(existing, _)| *existing != id);
        drop(registry);

        let manager = self.clone();
        tokio::spawn(async move {
            let session::Started {
                session,
                child,
                pumps,
            } = started;
            let exit = session.observe(child, pumps).await;
            manager.release(&session, exit).await;
        });

        info!(
            "Created {} session {id} (pid {}) in {}",
            req.kind.as_str(),
            session.pid,
            req.project_path.display()
        );
        self.audit
            .record(
                AuditKind::SessionCreated,
                format!("{} session {id} started", req.kind.as_str()),
                Some(json!({
                    "sessionId": id,
                    "pid": session.pid,
                    "resume": resume,
                    "projectPath": req.project_path,
                })),
            )
            .await;

        Ok(session.info().await)
    }

    /// Drop a finished session from the registry, keeping its exit record.
    async fn release(&self, session: &Arc<ManagedSession>, exit: ExitInfo) {
        {
            let mut registry = self.inner.write().await;
            match registry.sessions.get(&session.id) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    registry.sessions.remove(&session.id);
                    registry.push_tombstone(session.id.clone(), exit.clone());
                }
                // A newer session already reuses this id.
                Some(_) => {}
                None => registry.push_tombstone(session.id.clone(), exit.clone()),
            }
        }
        self.audit
            .record(
                AuditKind::SessionEnded,
                format!("session {} ended: {}", session.id, exit.reason.as_str()),
                serde_json::to_value(&exit).ok(),
            )
            .await;
    }

    /// Bind `connection_id` to a session's output. Any previous subscriber is
    /// silently dropped from the fan-out.
    pub async fn attach(
        &self,
        session_id: &str,
        connection_id: Uuid,
        since: Option<u64>,
    ) -> Result<Attachment> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let (replay, dropped, subscription, displaced) = session
            .attach(connection_id, since, self.settings.outbound_queue)
            .await;
        if let Some(prev) = displaced.filter(|prev| *prev != connection_id) {
            info!("Session {session_id}: connection {connection_id} supersedes {prev}");
        }
        Ok(Attachment {
            session_id: session.id.clone(),
            kind: session.kind,
            state: session.state(),
            replay,
            dropped,
            subscription,
            displaced,
        })
    }

    /// Remove `connection_id` from the fan-out if it is still the subscriber.
    /// Never affects the session's lifecycle.
    pub async fn detach(&self, session_id: &str, connection_id: Uuid) -> bool {
        match self.get(session_id).await {
            Some(session) => session.detach(connection_id).await,
            None => false,
        }
    }

    /// Forward raw text to the process. `Ok(false)` when the session is not
    /// running. Conversation input is line-delimited, so a missing trailing
    /// newline is added.
    pub async fn input(&self, session_id: &str, data: &str) -> Result<bool> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut bytes = data.as_bytes().to_vec();
        if session.kind == SessionKind::Conversation && !data.ends_with('\n') {
            bytes.push(b'\n');
        }
        session.write_input(bytes).await
    }

    /// Best-effort resize. `Ok(false)` means accepted without effect.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<bool> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.resize(rows, cols)
    }

    /// End a session: draining, SIGTERM, SIGKILL after the grace period,
    /// then wait for the exit observer. `None` if the id is unknown.
    pub async fn terminate(&self, session_id: &str, reason: ExitReason) -> Option<ExitInfo> {
        let session = self.get(session_id).await?;
        let exit = session
            .terminate(reason, self.settings.terminate_grace)
            .await;
        // The observer releases the entry right after `terminated`; make sure
        // callers never see it lingering.
        {
            let mut registry = self.inner.write().await;
            if registry
                .sessions
                .get(session_id)
                .is_some_and(|c| Arc::ptr_eq(c, &session))
                && session.state() == SessionState::Terminated
            {
                registry.sessions.remove(session_id);
                if let Some(exit) = &exit {
                    registry.push_tombstone(session_id.to_string(), exit.clone());
                }
            }
        }
        exit
    }

    /// Terminate every running session that has no subscriber and has been
    /// idle longer than the configured timeout. Returns the reaped ids.
    pub async fn reap(&self) -> Vec<String> {
        let idle_timeout = self.settings.idle_timeout;
        if idle_timeout.is_zero() {
            return Vec::new();
        }

        let candidates: Vec<Arc<ManagedSession>> =
            self.inner.read().await.sessions.values().cloned().collect();
        let mut idle = Vec::new();
        for session in candidates {
            if session.state() == SessionState::Running
                && session.idle_for() >= idle_timeout
                && !session.is_attached().await
            {
                idle.push(session);
            }
        }

        let ids: Vec<String> = idle.iter().map(|s| s.id.clone()).collect();
        for id in &ids {
            info!("Reaping idle session {id}");
        }
        join_all(
            ids.iter()
                .map(|id| self.terminate(id, ExitReason::IdleTimeout)),
        )
        .await;
        ids
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ManagedSession>> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    /// Exit record of a session that has already left the registry.
    pub async fn last_exit(&self, session_id: &str) -> Option<ExitInfo> {
        self.inner
            .read()
            .await
            .ended
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, exit)| exit.clone())
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<ManagedSession>> =
            self.inner.read().await.sessions.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for s in sessions {
            out.push(s.info().await);
        }
        out.sort_by_key(|i| i.created_at);
        out
    }

    /// Terminate everything. Used on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.read().await.sessions.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!("Shutting down {} session(s)", ids.len());
        join_all(ids.iter().map(|id| self.terminate(id, ExitReason::Shutdown))).await;
    }
}
