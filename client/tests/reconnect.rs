//! Reconnect and heartbeat behavior against a scripted local WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use agentdeck_client::{
    ClientConfig, ClientMessage, ConnectionState, Dispatcher, HeartbeatConfig, ReconnectPolicy,
    WsClient,
};

#[derive(Clone, Copy)]
enum Script {
    /// Read everything, answer nothing.
    Silent,
    /// Answer every `ping` with `pong`, then push one `output`.
    Pong,
    /// Close right after the handshake with this code.
    Close(u16),
}

#[derive(Debug)]
enum Event {
    Connected { authorization: Option<String> },
    Text(Value),
    Closed(Option<u16>),
}

struct TestServer {
    url: String,
    connections: Arc<AtomicUsize>,
    events: mpsc::UnboundedReceiver<Event>,
}

async fn serve(script: Script) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/shell", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let (tx, events) = mpsc::unbounded_channel();

    let count = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            count.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                let auth_tx = tx.clone();
                let callback = move |req: &Request, resp: Response| {
                    let authorization = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);
                    let _ = auth_tx.send(Event::Connected { authorization });
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                if let Script::Close(code) = script {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static("scripted"),
                    };
                    let _ = ws.send(Message::Close(Some(frame))).await;
                    // Wait for the client's close reply.
                    while let Some(Ok(_)) = ws.next().await {}
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let value: Value = serde_json::from_str(&text).unwrap();
                            let is_ping = value["type"] == "ping";
                            let _ = tx.send(Event::Text(value));
                            if is_ping && matches!(script, Script::Pong) {
                                let pong = json!({"type": "pong"}).to_string();
                                let output =
                                    json!({"type": "output", "seq": 7, "data": "hi"}).to_string();
                                let _ = ws.send(Message::Text(pong.into())).await;
                                let _ = ws.send(Message::Text(output.into())).await;
                            }
                        }
                        Message::Close(frame) => {
                            let _ = tx.send(Event::Closed(frame.map(|f| u16::from(f.code))));
                            break;
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    TestServer {
        url,
        connections,
        events,
    }
}

fn config(url: &str, heartbeat_ms: u64, timeout_ms: u64) -> ClientConfig {
    let mut config = ClientConfig::new(url);
    config.token = Some("secret".into());
    config.heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(heartbeat_ms),
        timeout: Duration::from_millis(timeout_ms),
    };
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_attempts: 5,
        ..ReconnectPolicy::default()
    };
    config
}

fn init_handshake() -> Arc<dyn Fn() -> Vec<ClientMessage> + Send + Sync> {
    Arc::new(|| {
        vec![ClientMessage::Init {
            project_path: None,
            project: None,
            session_id: Some("s-1".into()),
            resume: false,
            cols: None,
            rows: None,
            since: Some(3),
        }]
    })
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn missed_pong_forces_reconnect_and_replays_handshake() {
    let mut server = serve(Script::Silent).await;
    let client = WsClient::start(
        config(&server.url, 50, 50),
        Arc::new(Dispatcher::new()),
        init_handshake(),
    );

    let connections = Arc::clone(&server.connections);
    wait_until(|| connections.load(Ordering::SeqCst) >= 2).await;

    let mut inits = 0;
    let mut saw_token = false;
    while inits < 2 {
        match tokio::time::timeout(Duration::from_secs(5), server.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Event::Connected { authorization } => {
                saw_token |= authorization.as_deref() == Some("Bearer secret");
            }
            Event::Text(v) if v["type"] == "init" => {
                assert_eq!(v["sessionId"], "s-1");
                assert_eq!(v["since"], 3);
                inits += 1;
            }
            _ => {}
        }
    }
    assert!(saw_token);
    client.disconnect().await;
}

#[tokio::test]
async fn answered_heartbeats_keep_one_connection_and_dispatch() {
    let server = serve(Script::Pong).await;
    let dispatcher = Arc::new(Dispatcher::new());
    let outputs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&outputs);
    dispatcher.subscribe("output", move |msg| {
        assert_eq!(msg["data"], "hi");
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let client = WsClient::start(config(&server.url, 30, 200), dispatcher, init_handshake());
    client.wait_for(ConnectionState::Connected).await.unwrap();
    wait_until(|| outputs.load(Ordering::SeqCst) >= 3).await;

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_sends_normal_close_and_stops() {
    let mut server = serve(Script::Pong).await;
    let client = WsClient::start(
        config(&server.url, 1_000, 1_000),
        Arc::new(Dispatcher::new()),
        init_handshake(),
    );
    client.wait_for(ConnectionState::Connected).await.unwrap();
    let state = client.watch_state();
    client.disconnect().await;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), server.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Event::Closed(code) => {
                assert_eq!(code, Some(1000));
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn normal_close_from_server_is_not_retried() {
    let server = serve(Script::Close(1000)).await;
    let client = WsClient::start(
        config(&server.url, 1_000, 1_000),
        Arc::new(Dispatcher::new()),
        init_handshake(),
    );
    let connections = Arc::clone(&server.connections);
    wait_until(|| connections.load(Ordering::SeqCst) >= 1).await;
    // A retrying client would have reconnected several times by now.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abnormal_close_is_retried() {
    let server = serve(Script::Close(1011)).await;
    let client = WsClient::start(
        config(&server.url, 1_000, 1_000),
        Arc::new(Dispatcher::new()),
        init_handshake(),
    );
    let connections = Arc::clone(&server.connections);
    wait_until(|| connections.load(Ordering::SeqCst) >= 2).await;
    client.disconnect().await;
}

#[tokio::test]
async fn exhausted_attempts_end_in_error_state() {
    // Reserve a port, then free it so every connect is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/shell", listener.local_addr().unwrap());
    drop(listener);

    let mut cfg = config(&url, 1_000, 1_000);
    cfg.reconnect.max_attempts = 2;
    let client = WsClient::start(cfg, Arc::new(Dispatcher::new()), init_handshake());
    tokio::time::timeout(
        Duration::from_secs(5),
        client.wait_for(ConnectionState::Error),
    )
    .await
    .unwrap()
    .unwrap();
    client.disconnect().await;
}
