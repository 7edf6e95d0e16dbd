//! REST endpoints for session inspection and control.
//!
//! - `GET    /api/sessions`      — sessions plus connected clients
//! - `DELETE /api/sessions/{id}` — terminate a session

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::sessions::ExitReason;
use crate::state::AppState;

/// `GET /api/sessions` — live sessions and who is connected to them.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.snapshot().await;
    let connections = state.clients.snapshot().await;
    Json(json!({
        "sessions": sessions,
        "connections": connections,
    }))
}

/// `DELETE /api/sessions/{id}` — terminate through the normal exit path and
/// return the recorded exit.
pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.sessions.get(&id).await.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Session {id} not found"), "code": "session-not-found"})),
        ));
    }
    let exit = state.sessions.terminate(&id, ExitReason::Terminated).await;
    Ok(Json(json!({
        "sessionId": id,
        "exit": exit,
    })))
}
