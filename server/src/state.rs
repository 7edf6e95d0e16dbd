//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::audit::AuditLog;
use crate::auth::{ApiKeyVerifier, IdentityVerifier, Principal};
use crate::config::Config;
use crate::projects::{ProjectPathCache, ProjectResolver, WorkspaceResolver};
use crate::sessions::{SessionManager, SessionSettings};
use crate::ws::clients::ClientRegistry;

/// Shared application state for the agentdeck server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owns every conversation and shell session.
    pub sessions: SessionManager,
    /// Authenticated connections plus the broadcast channel they all follow.
    pub clients: ClientRegistry,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub resolver: Arc<dyn ProjectResolver>,
    pub audit: Arc<AuditLog>,
    /// Shared with the resolver; the project watcher invalidates it.
    pub project_cache: Arc<ProjectPathCache>,
}

impl AppState {
    /// Wire up the default collaborators: API-key verification and the
    /// on-disk project resolver.
    pub fn new(config: Config) -> Self {
        let audit = Arc::new(AuditLog::default());
        let project_cache = Arc::new(ProjectPathCache::new());
        let verifier = ApiKeyVerifier::new(
            config.auth.api_key.clone(),
            Principal {
                id: config.auth.user_id,
                username: config.auth.username.clone(),
            },
        );
        let resolver =
            WorkspaceResolver::new(config.projects.root_path(), Arc::clone(&project_cache));
        let sessions = SessionManager::new(SessionSettings::from_config(&config), Arc::clone(&audit));

        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            sessions,
            clients: ClientRegistry::new(),
            verifier: Arc::new(verifier),
            resolver: Arc::new(resolver),
            audit,
            project_cache,
        }
    }
}
