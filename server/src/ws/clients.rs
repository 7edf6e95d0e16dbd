//! Registry of connected WebSocket clients and the broadcast sink.
//!
//! The gateway is the only writer: it registers a connection once its
//! credential has been verified and unregisters it when the socket closes.
//! Everyone else reads snapshots or publishes through [`ClientRegistry::broadcast`],
//! which fans a message out to every connection regardless of the session it
//! is bound to.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::connection::Connection;
use crate::auth::Principal;
use crate::protocol::ServerMessage;
use crate::sessions::SessionKind;

/// Which endpoint a connection came in on; same grammar split as sessions.
pub type EndpointKind = SessionKind;

/// Capacity of the broadcast channel. Slow receivers skip ahead.
const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub principal: Principal,
    pub endpoint: EndpointKind,
    /// Epoch milliseconds.
    pub connected_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_session: Option<String>,
}

#[derive(Clone)]
pub struct ClientRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionInfo>>>,
    events: broadcast::Sender<ServerMessage>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Add an authenticated connection. The returned receiver yields every
    /// broadcast published after this call.
    pub async fn register(
        &self,
        principal: Principal,
        endpoint: EndpointKind,
    ) -> (Connection, broadcast::Receiver<ServerMessage>) {
        let events = self.events.subscribe();
        let conn = Connection::new(principal, endpoint);
        self.connections.write().await.insert(
            conn.id,
            ConnectionInfo {
                id: conn.id,
                principal: conn.principal.clone(),
                endpoint,
                connected_at: crate::util::now_ms(),
                bound_session: None,
            },
        );
        (conn, events)
    }

    pub async fn unregister(&self, id: Uuid) -> Option<ConnectionInfo> {
        self.connections.write().await.remove(&id)
    }

    /// Record which session a connection is bound to, for listings.
    pub async fn set_bound(&self, id: Uuid, session_id: Option<String>) {
        if let Some(info) = self.connections.write().await.get_mut(&id) {
            info.bound_session = session_id;
        }
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self.connections.read().await.values().cloned().collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Publish to every connected client. Returns the number of receivers.
    pub fn broadcast(&self, msg: ServerMessage) -> usize {
        self.events.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> Principal {
        Principal {
            id: 1,
            username: "operator".into(),
        }
    }

    #[tokio::test]
    async fn register_bind_unregister() {
        let clients = ClientRegistry::new();
        let (conn, _events) = clients.register(operator(), SessionKind::Shell).await;
        assert_eq!(clients.count().await, 1);

        clients.set_bound(conn.id, Some("s1".into())).await;
        let snap = clients.snapshot().await;
        assert_eq!(snap[0].bound_session.as_deref(), Some("s1"));
        assert_eq!(snap[0].endpoint, SessionKind::Shell);

        assert!(clients.unregister(conn.id).await.is_some());
        assert_eq!(clients.count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let clients = ClientRegistry::new();
        let (_a, mut a_rx) = clients.register(operator(), SessionKind::Shell).await;
        let (_b, mut b_rx) = clients.register(operator(), SessionKind::Conversation).await;

        let msg = ServerMessage::ProjectsUpdated {
            changed_projects: vec!["p".into()],
            projects: vec!["p".into()],
        };
        assert_eq!(clients.broadcast(msg.clone()), 2);
        assert_eq!(a_rx.recv().await.unwrap(), msg);
        assert_eq!(b_rx.recv().await.unwrap(), msg);
    }

    #[test]
    fn broadcast_without_clients_is_harmless() {
        let clients = ClientRegistry::new();
        assert_eq!(clients.broadcast(ServerMessage::Pong), 0);
    }
}
