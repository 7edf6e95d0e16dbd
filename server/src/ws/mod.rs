//! Connection gateway: WebSocket transport for conversation and shell sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws/conversation` or `GET /ws/shell` with an
//!    `Authorization: Bearer <key>` header or `?token=<key>`. The credential
//!    is verified before the upgrade completes; failures get `401`/`403` and
//!    no socket.
//! 2. All frames are JSON text objects with a `"type"` field (see
//!    [`crate::protocol`]). Bad frames are answered with `error`, never a close.
//! 3. `init` binds the connection to one session, creating it if needed.
//!    Binding a different session requires `detach` first.
//! 4. On disconnect the connection is detached from its session. The session
//!    keeps running and buffering until it exits or is reaped.
//!
//! ## Message types (client → server)
//!
//! | Type        | Fields                                                               | Response                      |
//! |-------------|----------------------------------------------------------------------|-------------------------------|
//! | `init`      | `projectPath?`, `project?`, `sessionId?`, `resume?`, `cols?`, `rows?`, `since?` | `ready` + replayed `output`, or `session-ended` / `error` |
//! | `input`     | `data`, `sessionId?`                                                 | none, `error` on failure      |
//! | `resize`    | `cols`, `rows`                                                       | none (shell), `error` (conversation) |
//! | `ping`      | —                                                                    | `pong`                        |
//! | `terminate` | `sessionId?`                                                         | `session-ended` when it exits |
//! | `detach`    | —                                                                    | none                          |
//!
//! ## Message types (server → client)
//!
//! | Type               | Key fields                                                 |
//! |--------------------|------------------------------------------------------------|
//! | `ready`            | `sessionId`, `kind`, `state`, `replayed`, `dropped`        |
//! | `output`           | `sessionId`, `seq`, `stream`, `data`                       |
//! | `session-ended`    | `sessionId`, `reason`, `exitCode?`, `signal?`, `detail?`   |
//! | `projects-updated` | `changedProjects`, `projects`                              |
//! | `pong`             | —                                                          |
//! | `error`            | `code`, `message`, `sessionId?`                            |

pub mod clients;
pub mod connection;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::audit::AuditKind;
use crate::auth::authenticate;
use crate::error::{Error, Result};
use crate::projects::validate_project_path;
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::sessions::{CreateRequest, ExitReason, SessionKind, SessionState, Subscription};
use crate::state::AppState;
use connection::Connection;

/// `GET /ws/conversation` — line-oriented assistant sessions.
pub async fn conversation_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Conversation, &headers, &uri, ws).await
}

/// `GET /ws/shell` — raw terminal sessions.
pub async fn shell_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, SessionKind::Shell, &headers, &uri, ws).await
}

async fn upgrade(
    state: AppState,
    endpoint: SessionKind,
    headers: &HeaderMap,
    uri: &Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = match authenticate(
        state.verifier.as_ref(),
        &state.audit,
        headers,
        uri,
        uri.path(),
    )
    .await
    {
        Ok(principal) => principal,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let (conn, events) = state.clients.register(principal, endpoint).await;
        handle_connection(socket, state, conn, events).await;
    })
}

/// Turn a core error into the wire `error` message.
fn error_message(err: &Error, session_id: Option<&str>) -> ServerMessage {
    ServerMessage::Error {
        code: err.code().to_string(),
        message: err.to_string(),
        session_id: session_id.map(ToString::to_string),
    }
}

/// Resolves to the next message on the attached session's queue; pends
/// forever when nothing is attached. `None` means the queue closed.
async fn next_output(subscription: &mut Option<Subscription>) -> Option<ServerMessage> {
    match subscription {
        Some(sub) => sub.rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-connection handler state for the message loop.
struct Gateway {
    state: AppState,
    conn: Connection,
    tx: mpsc::Sender<ServerMessage>,
    subscription: Option<Subscription>,
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink and stream. Every outgoing message goes
/// through one bounded mpsc drained by a dedicated sink task, so a slow
/// socket only ever stalls its own connection.
///
/// `tokio::select!` multiplexes:
/// - inbound frames, handled one at a time in arrival order
/// - broadcast events from the client registry
/// - live output from the attached session
async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    conn: Connection,
    mut events: broadcast::Receiver<ServerMessage>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.sessions.settings().outbound_queue.max(1));

    let conn_id = conn.id;
    let endpoint = conn.endpoint;
    info!(
        "Connection {conn_id} opened on {} endpoint by {}",
        endpoint.as_str(),
        conn.principal.username
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(Message::Text(msg.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    let mut gw = Gateway {
        state,
        conn,
        tx,
        subscription: None,
    };
    let mut events_open = true;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => match parse_client_message(&text) {
                        Ok(msg) => gw.handle(msg).await,
                        Err(reply) => gw.send(reply).await,
                    },
                    Message::Binary(_) => {
                        gw.send(ServerMessage::error(
                            "invalid-message",
                            "Binary frames are not supported",
                        ))
                        .await;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            event = events.recv(), if events_open => match event {
                Ok(msg) => gw.send(msg).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Connection {conn_id} skipped {n} broadcast event(s)");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
            output = next_output(&mut gw.subscription) => match output {
                Some(msg) => gw.forward_output(msg).await,
                None => gw.subscription_closed().await,
            },
        }
        if gw.tx.is_closed() {
            break;
        }
    }

    gw.close().await;
    send_task.abort();
}

impl Gateway {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg).await;
    }

    async fn send_error(&self, err: &Error, session_id: Option<&str>) {
        self.send(error_message(err, session_id)).await;
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Init {
                project_path,
                project,
                session_id,
                resume,
                cols,
                rows,
                since,
            } => {
                let request = InitRequest {
                    project_path,
                    project,
                    session_id,
                    resume,
                    cols,
                    rows,
                    since,
                };
                self.handle_init(request).await;
            }
            ClientMessage::Input { data, session_id } => {
                let bound = match self.target_session(session_id.as_deref()) {
                    Ok(id) => id,
                    Err(e) => return self.send_error(&e, session_id.as_deref()).await,
                };
                match self.state.sessions.input(&bound, &data).await {
                    Ok(true) => {}
                    Ok(false) => debug!("Connection {}: input to {bound} dropped", self.conn.id),
                    Err(e) => self.send_error(&e, Some(&bound)).await,
                }
            }
            ClientMessage::Resize { cols, rows } => {
                if self.conn.endpoint == SessionKind::Conversation {
                    self.send(ServerMessage::error(
                        "unsupported",
                        "Conversation sessions have no terminal to resize",
                    ))
                    .await;
                    return;
                }
                let bound = match self.conn.require_bound() {
                    Ok(id) => id.to_string(),
                    Err(e) => return self.send_error(&e, None).await,
                };
                if let Err(e) = self.state.sessions.resize(&bound, cols, rows).await {
                    self.send_error(&e, Some(&bound)).await;
                }
            }
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
            ClientMessage::Terminate { session_id } => {
                let target = match self.target_session(session_id.as_deref()) {
                    Ok(id) => id,
                    Err(e) => return self.send_error(&e, session_id.as_deref()).await,
                };
                if self.state.sessions.get(&target).await.is_none() {
                    let err = Error::SessionNotFound(target.clone());
                    return self.send_error(&err, Some(&target)).await;
                }
                // Terminating waits out the grace period; the attached
                // subscription delivers `session-ended` when it is done.
                let sessions = self.state.sessions.clone();
                tokio::spawn(async move {
                    sessions.terminate(&target, ExitReason::Terminated).await;
                });
            }
            ClientMessage::Detach => self.detach().await,
        }
    }

    /// The bound session, checked against an optional explicit id.
    fn target_session(&self, requested: Option<&str>) -> Result<String> {
        let bound = self.conn.require_bound()?;
        if let Some(requested) = requested {
            self.conn.check_bind(requested)?;
        }
        Ok(bound.to_string())
    }

    async fn handle_init(&mut self, req: InitRequest) {
        // A binding to a session that has since ended no longer blocks.
        if let Some(bound) = self.conn.bound_session().map(ToString::to_string) {
            let live = self
                .state
                .sessions
                .get(&bound)
                .await
                .is_some_and(|s| s.state() != SessionState::Terminated);
            if !live {
                self.unbind().await;
            }
        }

        match (self.conn.bound_session(), req.session_id.as_deref()) {
            (Some(bound), requested) if requested != Some(bound) => {
                let err = Error::AlreadyBound {
                    bound: bound.to_string(),
                    requested: requested.unwrap_or("a new session").to_string(),
                };
                return self.send_error(&err, requested).await;
            }
            _ => {}
        }

        let existing = match &req.session_id {
            Some(id) => self.state.sessions.get(id).await,
            None => None,
        };
        // Reattaching to a session that is gone: report how it ended.
        if let (None, Some(id), None, None) = (
            &existing,
            req.session_id.as_deref(),
            &req.project_path,
            &req.project,
        ) {
            if let Some(exit) = self.state.sessions.last_exit(id).await {
                self.send(ServerMessage::session_ended(id, &exit)).await;
                return;
            }
        }
        let project_path = match existing {
            Some(session) => session.project_path.clone(),
            None => match self.resolve_project(req.project_path, req.project).await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    self.send(ServerMessage::error(
                        "project-required",
                        "init needs `projectPath`, `project`, or the id of a live session",
                    ))
                    .await;
                    return;
                }
                Err(e) => return self.send_error(&e, req.session_id.as_deref()).await,
            },
        };

        let info = match self
            .state
            .sessions
            .create(CreateRequest {
                kind: self.conn.endpoint,
                project_path,
                session_id: req.session_id.clone(),
                resume: req.resume,
                rows: req.rows,
                cols: req.cols,
            })
            .await
        {
            Ok(info) => info,
            Err(e) => return self.send_error(&e, req.session_id.as_deref()).await,
        };

        if info.state == SessionState::Terminated {
            if let Some(exit) = &info.exit {
                self.send(ServerMessage::session_ended(&info.session_id, exit))
                    .await;
            }
            return;
        }

        let attachment = match self
            .state
            .sessions
            .attach(&info.session_id, self.conn.id, req.since)
            .await
        {
            Ok(attachment) => attachment,
            Err(e) => {
                // Exited between create and attach.
                match self.state.sessions.last_exit(&info.session_id).await {
                    Some(exit) => {
                        self.send(ServerMessage::session_ended(&info.session_id, &exit))
                            .await;
                    }
                    None => self.send_error(&e, Some(&info.session_id)).await,
                }
                return;
            }
        };

        if let Err(e) = self.conn.bind(&attachment.session_id) {
            self.state
                .sessions
                .detach(&attachment.session_id, self.conn.id)
                .await;
            return self.send_error(&e, Some(&attachment.session_id)).await;
        }
        self.state
            .clients
            .set_bound(self.conn.id, Some(attachment.session_id.clone()))
            .await;

        let session_id = attachment.session_id;
        self.send(ServerMessage::Ready {
            session_id: session_id.clone(),
            kind: attachment.kind,
            state: attachment.state,
            replayed: attachment.replay.len(),
            dropped: attachment.dropped,
        })
        .await;
        for entry in &attachment.replay {
            self.send(ServerMessage::output(&session_id, entry)).await;
        }
        self.subscription = Some(attachment.subscription);
    }

    /// Work out and validate the working directory for a new session.
    /// `Ok(None)` when the client named neither a path nor a project.
    async fn resolve_project(
        &self,
        project_path: Option<String>,
        project: Option<String>,
    ) -> Result<Option<PathBuf>> {
        let target = match (project_path, project) {
            (Some(path), _) => ProjectRef::Path(PathBuf::from(path)),
            (None, Some(name)) => ProjectRef::Name(name),
            (None, None) => return Ok(None),
        };
        let resolver = Arc::clone(&self.state.resolver);
        let workspace_root = self.state.config.projects.workspace_root_path();
        tokio::task::spawn_blocking(move || {
            let path = match target {
                ProjectRef::Path(path) => path,
                ProjectRef::Name(name) => resolver.resolve(&name)?,
            };
            validate_project_path(&path, workspace_root.as_deref()).map(Some)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn forward_output(&mut self, msg: ServerMessage) {
        let ended = matches!(msg, ServerMessage::SessionEnded { .. });
        self.send(msg).await;
        if ended {
            self.subscription = None;
            self.unbind().await;
        }
    }

    /// The session dropped this connection from its fan-out: either another
    /// connection attached, or this one fell too far behind.
    async fn subscription_closed(&mut self) {
        let lagged = self.subscription.take().is_some_and(|s| s.lagged());
        let bound = self.conn.bound_session().map(ToString::to_string);
        if lagged {
            warn!(
                "Connection {} lagged behind session {}",
                self.conn.id,
                bound.as_deref().unwrap_or("?")
            );
            self.send(ServerMessage::Error {
                code: "lagged".to_string(),
                message: "Output queue overflowed; reconnect with `since` to resume".to_string(),
                session_id: bound,
            })
            .await;
        } else {
            debug!("Connection {} no longer receives output", self.conn.id);
        }
    }

    async fn detach(&mut self) {
        self.subscription = None;
        if let Some(session_id) = self.conn.bound_session().map(ToString::to_string) {
            self.state.sessions.detach(&session_id, self.conn.id).await;
        }
        self.unbind().await;
    }

    async fn unbind(&mut self) {
        if self.conn.unbind().is_some() {
            self.state.clients.set_bound(self.conn.id, None).await;
        }
    }

    /// Disconnect cleanup. Never terminates the session.
    async fn close(mut self) {
        let bound = self.conn.bound_session().map(ToString::to_string);
        self.detach().await;
        self.state.clients.unregister(self.conn.id).await;
        info!("Connection {} closed", self.conn.id);
        self.state
            .audit
            .record(
                AuditKind::ConnectionClosed,
                format!(
                    "{} connection {} closed",
                    self.conn.endpoint.as_str(),
                    self.conn.id
                ),
                Some(json!({
                    "connectionId": self.conn.id,
                    "user": self.conn.principal.username,
                    "boundSession": bound,
                })),
            )
            .await;
    }
}

/// How an `init` named its working directory; an explicit path wins.
enum ProjectRef {
    Path(PathBuf),
    Name(String),
}

struct InitRequest {
    project_path: Option<String>,
    project: Option<String>,
    session_id: Option<String>,
    resume: bool,
    cols: Option<u16>,
    rows: Option<u16>,
    since: Option<u64>,
}
