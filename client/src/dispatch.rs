//! Typed dispatch of inbound server messages.
//!
//! Handlers are registered per message `type` and run in registration order.
//! A handler that errors or panics is logged and skipped; the rest still run
//! and the connection is unaffected.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{error, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&Value) -> Result<(), HandlerError> + Send + Sync>;

/// Returned by [`Dispatcher::subscribe`]; pass to `unsubscribe` to remove
/// the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<String, Vec<(HandlerToken, Handler)>>>,
    next_token: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, msg_type: &str, handler: F) -> HandlerToken
    where
        F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(msg_type.to_string())
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    /// Returns whether a handler was removed.
    pub fn unsubscribe(&self, token: HandlerToken) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(t, _)| *t != token);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Run every handler registered for `msg["type"]`. Returns how many
    /// completed successfully.
    pub fn dispatch(&self, msg: &Value) -> usize {
        let Some(msg_type) = msg.get("type").and_then(Value::as_str) else {
            warn!("Dropping message without a type: {msg}");
            return 0;
        };
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut ok = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => warn!("Handler for `{msg_type}` failed: {e}"),
                Err(_) => error!("Handler for `{msg_type}` panicked"),
            }
        }
        ok
    }

    pub fn handler_count(&self, msg_type: &str) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg_type)
            .map_or(0, Vec::len)
    }
}
