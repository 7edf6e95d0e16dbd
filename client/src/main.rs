//! # agentdeck-client
//!
//! Terminal client for an agentdeck server. Connects to the conversation or
//! shell endpoint, binds a session, forwards stdin lines as `input`, and
//! prints `output`. Survives server restarts and network drops: each
//! reconnect re-sends `init` with the session id and last seen `seq`, so no
//! buffered output is lost.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::info;

use agentdeck_client::{
    ClientConfig, ClientMessage, Dispatcher, HeartbeatConfig, ReconnectPolicy, WsClient,
};

#[derive(Clone, Copy, ValueEnum)]
enum Endpoint {
    Conversation,
    Shell,
}

/// Terminal client for agentdeck sessions.
#[derive(Parser)]
#[command(name = "agentdeck-client", version)]
struct Cli {
    /// Server base URL.
    #[arg(long, default_value = "ws://127.0.0.1:3001")]
    url: String,
    /// API key, sent as a Bearer credential.
    #[arg(long)]
    token: String,
    #[arg(long, value_enum, default_value = "conversation")]
    endpoint: Endpoint,
    /// Working directory for a new session.
    #[arg(long)]
    project_path: Option<String>,
    /// Logical project name, resolved by the server.
    #[arg(long)]
    project: Option<String>,
    /// Attach to (or create) this session id.
    #[arg(long)]
    session_id: Option<String>,
    /// Resume a stored conversation instead of starting fresh.
    #[arg(long)]
    resume: bool,
    /// Seconds between heartbeat pings.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,
}

/// Where to pick up after a reconnect.
#[derive(Default)]
struct Cursor {
    session_id: Option<String>,
    last_seq: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let path = match cli.endpoint {
        Endpoint::Conversation => "conversation",
        Endpoint::Shell => "shell",
    };
    let mut config = ClientConfig::new(format!("{}/ws/{path}", cli.url.trim_end_matches('/')));
    config.token = Some(cli.token.clone());
    config.heartbeat = HeartbeatConfig {
        interval: Duration::from_secs(cli.heartbeat_secs.max(1)),
        ..HeartbeatConfig::default()
    };
    config.reconnect = ReconnectPolicy {
        max_attempts: cli.max_attempts,
        ..ReconnectPolicy::default()
    };

    let cursor = Arc::new(Mutex::new(Cursor {
        session_id: cli.session_id.clone(),
        last_seq: None,
    }));
    let ended = Arc::new(Notify::new());
    let lagged = Arc::new(Notify::new());
    let dispatcher = Arc::new(Dispatcher::new());
    let raw_output = matches!(cli.endpoint, Endpoint::Shell);

    {
        let cursor = Arc::clone(&cursor);
        dispatcher.subscribe("ready", move |msg| {
            let id = msg["sessionId"].as_str().ok_or("ready without sessionId")?;
            info!("Bound to session {id} (replayed {})", msg["replayed"]);
            cursor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .session_id = Some(id.to_string());
            Ok(())
        });
    }
    {
        let cursor = Arc::clone(&cursor);
        dispatcher.subscribe("output", move |msg| {
            let seq = msg["seq"].as_u64().ok_or("output without seq")?;
            let data = msg["data"].as_str().unwrap_or_default();
            cursor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_seq = Some(seq);
            let mut out = std::io::stdout().lock();
            if raw_output {
                out.write_all(data.as_bytes())?;
            } else {
                writeln!(out, "{data}")?;
            }
            out.flush()?;
            Ok(())
        });
    }
    {
        let ended = Arc::clone(&ended);
        dispatcher.subscribe("session-ended", move |msg| {
            eprintln!(
                "agentdeck-client: session ended ({}{})",
                msg["reason"].as_str().unwrap_or("unknown"),
                msg["exitCode"]
                    .as_i64()
                    .map(|c| format!(", exit code {c}"))
                    .unwrap_or_default()
            );
            ended.notify_one();
            Ok(())
        });
    }
    {
        let lagged = Arc::clone(&lagged);
        dispatcher.subscribe("error", move |msg| {
            let code = msg["code"].as_str().unwrap_or("unknown");
            eprintln!(
                "agentdeck-client: {code}: {}",
                msg["message"].as_str().unwrap_or_default()
            );
            if code == "lagged" {
                lagged.notify_one();
            }
            Ok(())
        });
    }
    dispatcher.subscribe("projects-updated", |msg: &Value| {
        info!("Projects changed: {}", msg["changedProjects"]);
        Ok(())
    });

    let handshake = {
        let cursor = Arc::clone(&cursor);
        let project_path = cli.project_path.clone();
        let project = cli.project.clone();
        let resume = cli.resume;
        Arc::new(move || {
            let cursor = cursor.lock().unwrap_or_else(PoisonError::into_inner);
            vec![ClientMessage::Init {
                project_path: project_path.clone(),
                project: project.clone(),
                session_id: cursor.session_id.clone(),
                resume: resume && cursor.last_seq.is_none(),
                cols: None,
                rows: None,
                since: cursor.last_seq,
            }]
        })
    };

    let client = WsClient::start(config, dispatcher, handshake);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let data = if raw_output { format!("{line}\n") } else { line };
                    if client.send(ClientMessage::input(data)).await.is_err() {
                        eprintln!("agentdeck-client: connection task stopped");
                        std::process::exit(1);
                    }
                }
                Ok(None) | Err(_) => break,
            },
            () = lagged.notified() => {
                let _ = client.reconnect().await;
            }
            () = ended.notified() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await;
}
