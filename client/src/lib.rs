#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! Client library for agentdeck's WebSocket endpoints.
//!
//! - `connection` — reconnecting socket with heartbeat and state watch
//! - `backoff` — reconnect delay schedule
//! - `dispatch` — per-type handler registry with panic isolation
//! - `protocol` — outbound message envelope

pub mod backoff;
pub mod connection;
pub mod dispatch;
pub mod protocol;

pub use backoff::ReconnectPolicy;
pub use connection::{ClientConfig, ClientError, ConnectionState, HeartbeatConfig, WsClient};
pub use dispatch::{Dispatcher, HandlerToken};
pub use protocol::ClientMessage;
