#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agentdeck
//!
//! Browser-facing control surface for a command-line AI assistant.
//!
//! agentdeck exposes WebSocket endpoints that bridge an authenticated browser
//! to long-lived assistant conversation processes and interactive shells,
//! plus a small REST surface for health and inspection. Sessions outlive
//! connections: a client that drops can reconnect and replay what it missed.
//!
//! ## Subcommands
//!
//! - `agentdeck serve` (default) — run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                 | Auth  | Description                         |
//! |--------|----------------------|-------|-------------------------------------|
//! | GET    | `/api/health`        | No    | Liveness probe                      |
//! | GET    | `/api/sessions`      | Yes   | Session and connection snapshot     |
//! | DELETE | `/api/sessions/{id}` | Yes   | Terminate a session                 |
//! | GET    | `/api/audit`         | Yes   | Audit log                           |
//! | GET    | `/ws/conversation`   | Yes*  | Assistant conversation sessions     |
//! | GET    | `/ws/shell`          | Yes*  | Interactive shell sessions          |
//!
//! *WebSocket auth accepts `Authorization: Bearer <key>` or `?token=<key>`
//! (browsers cannot set headers on the upgrade request).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, background tasks, graceful shutdown
//! auth.rs          — credential extraction, IdentityVerifier, Bearer middleware
//! audit.rs         — in-memory audit log mirrored to the `audit` tracing target
//! config.rs        — TOML + env-var configuration
//! protocol.rs      — client/server message envelope
//! routes/          — REST handlers and router assembly
//! ws/
//!   mod.rs         — upgrade handlers and per-connection message loop
//!   clients.rs     — connected-clients registry and broadcast channel
//!   connection.rs  — per-connection binding rules
//! sessions/
//!   mod.rs         — SessionManager (create, attach, input, terminate, reap)
//!   session.rs     — ManagedSession (process, pumps, exit observer)
//!   state.rs       — lifecycle state machine and exit reasons
//!   buffer.rs      — sequenced output ring buffer
//!   bridge.rs      — UTF-8 decoding, framing, bounded fan-out, pumps
//! process/         — pipe and PTY spawning, process-group signals
//! projects/        — resolver, path validation, cache, directory watcher
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use agentdeck::projects::ProjectWatcher;
use agentdeck::{routes, AppState, Config};

/// Browser-facing control surface for a command-line AI assistant.
#[derive(Parser)]
#[command(name = "agentdeck", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file (when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            if let Err(e) = run_server(cli.config.as_deref()).await {
                error!("{e}");
                eprintln!("agentdeck: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config_path: Option<&str>) -> agentdeck::Result<()> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("agentdeck v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set AGENTDECK_API_KEY or update config");
    }

    let state = AppState::new(config);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    // Periodic reaper: terminate detached sessions idle past the timeout
    let reaper_task = if state.sessions.settings().idle_timeout.is_zero() {
        info!("Idle reaping disabled");
        None
    } else {
        let mgr = state.sessions.clone();
        let period = state.config.server.reaper_interval();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let reaped = mgr.reap().await;
                if !reaped.is_empty() {
                    info!("Reaped {} idle session(s)", reaped.len());
                }
            }
        }))
    };

    // Project watcher: cache invalidation + projects-updated broadcasts
    let projects_root = state.config.projects.root_path();
    let _watcher = if projects_root.is_dir() {
        match ProjectWatcher::start(
            projects_root,
            state.config.projects.debounce(),
            state.project_cache.clone(),
            state.clients.clone(),
        ) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("Project watcher disabled: {e}");
                None
            }
        }
    } else {
        warn!(
            "Projects root {} does not exist; watcher disabled",
            projects_root.display()
        );
        None
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    info!("Shutting down...");
    if let Some(task) = reaper_task {
        task.abort();
    }
    tokio::time::timeout(
        state.config.server.terminate_grace() + Duration::from_secs(5),
        state.sessions.shutdown(),
    )
    .await
    .unwrap_or_else(|_| warn!("Timed out waiting for sessions to exit"));
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
                return;
            }
        };
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
