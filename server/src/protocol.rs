//! JSON message envelope exchanged over both WebSocket endpoints.
//!
//! Every frame is a text frame holding `{"type": "...", ...}` with camelCase
//! field names. Malformed or unknown frames are answered with an `error`
//! message; they never close the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sessions::{ExitInfo, OutputEntry, OutputStream, SessionKind, SessionState};

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &["init", "input", "resize", "ping", "terminate", "detach"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create or attach to a session.
    #[serde(rename_all = "camelCase")]
    Init {
        /// Absolute working directory for a new session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_path: Option<String>,
        /// Logical project name, resolved to a directory server-side.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default)]
        resume: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        /// Last output `seq` the client saw; replay starts after it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Input {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Ping,
    #[serde(rename_all = "camelCase")]
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Acknowledges `init`: the connection is now bound to `session_id`.
    #[serde(rename_all = "camelCase")]
    Ready {
        session_id: String,
        kind: SessionKind,
        state: SessionState,
        /// Buffered entries replayed right after this message.
        replayed: usize,
        /// Entries evicted from the buffer before they could be replayed.
        dropped: u64,
    },
    #[serde(rename_all = "camelCase")]
    Output {
        session_id: String,
        seq: u64,
        stream: OutputStream,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    ProjectsUpdated {
        changed_projects: Vec<String>,
        projects: Vec<String>,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            session_id: None,
        }
    }

    pub fn output(session_id: &str, entry: &OutputEntry) -> Self {
        Self::Output {
            session_id: session_id.to_string(),
            seq: entry.seq,
            stream: entry.stream,
            data: entry.data.clone(),
        }
    }

    pub fn session_ended(session_id: &str, exit: &ExitInfo) -> Self {
        Self::SessionEnded {
            session_id: session_id.to_string(),
            reason: exit.reason.as_str().to_string(),
            exit_code: exit.exit_code,
            signal: exit.signal,
            detail: exit.detail.clone(),
        }
    }

    /// Serialize to the text frame payload.
    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: all keys are strings and
        // no field holds a map or a non-finite float.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","code":"internal","message":"{e}"}}"#)
        })
    }
}

/// Parse one inbound text frame.
///
/// On failure returns the `error` message to send back: `invalid-message` for
/// non-JSON, non-object, missing `type` or bad fields, `unknown-type` for a
/// well-formed envelope of a type this server does not handle.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ServerMessage::error("invalid-message", format!("Invalid JSON: {e}")))?;

    let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
        return Err(ServerMessage::error(
            "invalid-message",
            "Message must be an object with a string `type` field",
        ));
    };

    if !CLIENT_MESSAGE_TYPES.contains(&msg_type) {
        return Err(ServerMessage::error(
            "unknown-type",
            format!("Unknown message type: {msg_type}"),
        ));
    }

    let msg_type = msg_type.to_string();
    serde_json::from_value(value).map_err(|e| {
        ServerMessage::error("invalid-message", format!("Invalid `{msg_type}` message: {e}"))
    })
}
