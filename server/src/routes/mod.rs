//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an API endpoint group. Everything except
//! [`health`] and the WebSocket upgrades sits behind the
//! [`crate::auth::require_bearer`] middleware; the upgrade handlers verify
//! their own credential before switching protocols.

pub mod audit;
pub mod health;
pub mod sessions;

use axum::{
    middleware,
    routing::{delete, get},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;
use crate::ws;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{id}", delete(sessions::terminate_session))
        .route("/api/audit", get(audit::get_audit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let ws_routes = Router::new()
        .route("/ws/conversation", get(ws::conversation_upgrade))
        .route("/ws/shell", get(ws::shell_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
