//! In-memory audit journal.
//!
//! Records authentication attempts and session/connection lifecycle in a
//! fixed-size ring buffer. Every entry is also emitted as a `tracing` event on
//! the `audit` target so it reaches the process log regardless of who reads
//! the journal.
//!
//! - **Ring buffer**: `VecDeque<AuditEntry>` capped at `max_entries` (default
//!   200). Old entries are dropped when the buffer is full.
//! - **Monotonic IDs**: clients page with "everything since ID N".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Default journal capacity.
pub const DEFAULT_MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AuthSuccess,
    AuthFailure,
    SessionCreated,
    SessionEnded,
    ConnectionClosed,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::SessionCreated => "session_created",
            Self::SessionEnded => "session_ended",
            Self::ConnectionClosed => "connection_closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: AuditKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            next_id: AtomicU64::new(1),
            max_entries: max_entries.max(1),
        }
    }

    /// Append an entry and return its ID.
    pub async fn record(&self, kind: AuditKind, summary: String, detail: Option<Value>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timestamp = crate::util::now_ms();

        match kind {
            AuditKind::AuthFailure => {
                tracing::warn!(target: "audit", id, kind = kind.as_str(), "{summary}");
            }
            _ => tracing::info!(target: "audit", id, kind = kind.as_str(), "{summary}"),
        }

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(AuditEntry {
            id,
            timestamp,
            kind,
            summary,
            detail,
        });
        id
    }

    /// Entries with `id > since_id`, oldest first, up to `limit`.
    pub async fn read_since(&self, since_id: u64, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.id > since_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ids_are_monotonic_and_paged() {
        let log = AuditLog::new(10);
        let a = log.record(AuditKind::AuthSuccess, "ok".into(), None).await;
        let b = log
            .record(
                AuditKind::SessionCreated,
                "created".into(),
                Some(json!({"sessionId": "s1"})),
            )
            .await;
        assert!(b > a);

        let after_a = log.read_since(a, 10).await;
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_a[0].kind, AuditKind::SessionCreated);
    }

    #[tokio::test]
    async fn oldest_entries_are_evicted() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(AuditKind::AuthFailure, format!("attempt {i}"), None)
                .await;
        }
        let all = log.read_since(0, 100).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].summary, "attempt 2");
        assert_eq!(all[2].summary, "attempt 4");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let v = serde_json::to_value(AuditKind::ConnectionClosed).unwrap();
        assert_eq!(v, "connection_closed");
        assert_eq!(AuditKind::ConnectionClosed.as_str(), "connection_closed");
    }
}
