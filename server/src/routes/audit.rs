//! Audit log endpoint.
//!
//! `GET /api/audit?since_id=N&limit=N` — authentication attempts, session
//! starts and ends, and connection closes, oldest first.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// Query parameters for `GET /api/audit`.
#[derive(Deserialize)]
pub struct AuditQuery {
    /// Return entries with `id > since_id`. Defaults to 0 (all entries).
    #[serde(default)]
    pub since_id: u64,
    /// Maximum number of entries to return. Defaults to 50, max 200.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn get_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<Value> {
    let entries = state
        .audit
        .read_since(query.since_id, query.limit.min(200))
        .await;
    Json(json!({ "entries": entries }))
}
