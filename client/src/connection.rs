//! WebSocket connection with automatic reconnect and application heartbeat.
//!
//! [`WsClient`] owns one background task that connects, pumps frames in both
//! directions, and reconnects with [`ReconnectPolicy`] backoff whenever the
//! socket is lost. The connection is considered lost on EOF, transport
//! errors, any close code other than 1000, or a missed heartbeat `pong`.
//!
//! Every time a connection is established the handshake closure runs first,
//! so callers can re-send `init` with their session id and last seen `seq`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::dispatch::Dispatcher;
use crate::protocol::ClientMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Messages sent at the start of every connection.
pub type Handshake = Arc<dyn Fn() -> Vec<ClientMessage> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; waiting for an explicit `reconnect()`.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between `ping` probes.
    pub interval: Duration,
    /// How long to wait for the `pong` before declaring the socket dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full endpoint URL, e.g. `ws://host:3001/ws/shell`.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatConfig,
    /// Outbound queue depth.
    pub send_queue: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            send_queue: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Client task has stopped")]
    Stopped,
    #[error("Outbound queue is full")]
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Reconnect,
    Disconnect,
}

/// How one connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    /// Peer closed with 1000; do not reconnect.
    ClosedNormally,
    /// `disconnect()` was called or the client was dropped.
    Disconnected,
    /// `reconnect()` was called: retry immediately.
    Reconnect,
    /// Anything unexpected; retry with backoff.
    Lost(String),
}

pub struct WsClient {
    outbound: mpsc::Sender<ClientMessage>,
    control: mpsc::Sender<Control>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl WsClient {
    /// Spawn the connection task. Inbound messages go to `dispatcher`.
    pub fn start(config: ClientConfig, dispatcher: Arc<Dispatcher>, handshake: Handshake) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.send_queue.max(1));
        let (control, control_rx) = mpsc::channel(8);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let task = tokio::spawn(run(
            config,
            dispatcher,
            handshake,
            outbound_rx,
            control_rx,
            state_tx,
        ));
        Self {
            outbound,
            control,
            state,
            task,
        }
    }

    /// Queue a message. Waits for room; messages queued while disconnected
    /// go out after the next handshake.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.outbound.send(msg).await.map_err(|_| ClientError::Stopped)
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::Stopped,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the state equals `target`. Fails if the task stopped first.
    pub async fn wait_for(&self, target: ConnectionState) -> Result<(), ClientError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Stopped)
    }

    /// Drop the current socket and connect again now, with a fresh attempt
    /// budget.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.control
            .send(Control::Reconnect)
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Close with code 1000 and stop reconnecting.
    pub async fn disconnect(self) {
        let _ = self.control.send(Control::Disconnect).await;
        let _ = self.task.await;
    }
}

async fn open(config: &ClientConfig) -> Result<WsStream, Box<dyn std::error::Error + Send + Sync>> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Connection task: connect, drive, back off, repeat.
async fn run(
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    handshake: Handshake,
    mut outbound: mpsc::Receiver<ClientMessage>,
    mut control: mpsc::Receiver<Control>,
    state: watch::Sender<ConnectionState>,
) {
    let mut attempt: u32 = 0;
    loop {
        state.send_replace(ConnectionState::Connecting);
        info!("Connecting to {}", config.url);
        match open(&config).await {
            Ok(ws) => {
                attempt = 0;
                state.send_replace(ConnectionState::Connected);
                info!("Connected to {}", config.url);
                let end = drive(
                    ws,
                    &config.heartbeat,
                    &dispatcher,
                    &handshake,
                    &mut outbound,
                    &mut control,
                )
                .await;
                match end {
                    ConnectionEnd::ClosedNormally | ConnectionEnd::Disconnected => {
                        info!("Connection closed ({end:?})");
                        state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    ConnectionEnd::Reconnect => {
                        info!("Reconnecting on request");
                        continue;
                    }
                    ConnectionEnd::Lost(reason) => warn!("Connection lost: {reason}"),
                }
            }
            Err(e) => warn!("Connect to {} failed: {e}", config.url),
        }

        let Some(delay) = config.reconnect.delay(attempt) else {
            error!(
                "Giving up after {} reconnect attempt(s)",
                config.reconnect.max_attempts
            );
            state.send_replace(ConnectionState::Error);
            match control.recv().await {
                Some(Control::Reconnect) => {
                    attempt = 0;
                    continue;
                }
                Some(Control::Disconnect) | None => {
                    state.send_replace(ConnectionState::Disconnected);
                    return;
                }
            }
        };
        attempt += 1;
        state.send_replace(ConnectionState::Disconnected);
        debug!("Reconnect attempt {attempt} in {delay:?}");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            ctl = control.recv() => match ctl {
                Some(Control::Reconnect) => attempt = 0,
                Some(Control::Disconnect) | None => return,
            },
        }
    }
}

/// Pends until `deadline`, or forever when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Pump one established connection until it ends.
async fn drive(
    ws: WsStream,
    heartbeat: &HeartbeatConfig,
    dispatcher: &Dispatcher,
    handshake: &Handshake,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    control: &mut mpsc::Receiver<Control>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();

    for msg in handshake() {
        if let Err(e) = send_message(&mut sink, &msg).await {
            return ConnectionEnd::Lost(format!("handshake failed: {e}"));
        }
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(msg) => {
                        if msg.get("type").and_then(Value::as_str) == Some("pong") {
                            pong_deadline = None;
                        }
                        dispatcher.dispatch(&msg);
                    }
                    Err(e) => warn!("Ignoring malformed frame: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(f) if f.code == CloseCode::Normal => ConnectionEnd::ClosedNormally,
                        Some(f) => ConnectionEnd::Lost(format!("closed with {}: {}", u16::from(f.code), f.reason.as_str())),
                        None => ConnectionEnd::Lost("closed without a code".into()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return ConnectionEnd::Lost(e.to_string()),
                None => return ConnectionEnd::Lost("connection reset".into()),
            },
            _ = ticker.tick() => {
                if pong_deadline.is_none() {
                    if let Err(e) = send_message(&mut sink, &ClientMessage::Ping).await {
                        return ConnectionEnd::Lost(format!("heartbeat send failed: {e}"));
                    }
                    pong_deadline = Some(Instant::now() + heartbeat.timeout);
                }
            }
            () = until(pong_deadline) => {
                return ConnectionEnd::Lost(format!("no pong within {:?}", heartbeat.timeout));
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = send_message(&mut sink, &msg).await {
                        return ConnectionEnd::Lost(format!("send failed: {e}"));
                    }
                }
                None => {
                    close_normally(&mut sink).await;
                    return ConnectionEnd::Disconnected;
                }
            },
            ctl = control.recv() => match ctl {
                Some(Control::Reconnect) => {
                    let _ = sink.close().await;
                    return ConnectionEnd::Reconnect;
                }
                Some(Control::Disconnect) | None => {
                    close_normally(&mut sink).await;
                    return ConnectionEnd::Disconnected;
                }
            },
        }
    }
}

type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

async fn send_message(
    sink: &mut WsSink,
    msg: &ClientMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    sink.send(Message::Text(msg.to_json()?.into())).await?;
    Ok(())
}

async fn close_normally(sink: &mut WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static("client disconnect"),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
