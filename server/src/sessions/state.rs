//! Session kinds, the forward-only lifecycle state machine, and exit records.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Which protocol grammar and process a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Conversation,
    Shell,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Shell => "shell",
        }
    }
}

/// Lifecycle state. Declaration order is the only permitted direction of
/// travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Spawning,
    Running,
    Draining,
    Terminated,
}

impl SessionState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Spawning -> Terminated` exists only for spawn failure; every other
    /// path to `Terminated` goes through `Draining`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Spawning, Self::Running)
                | (Self::Spawning, Self::Terminated)
                | (Self::Running, Self::Draining)
                | (Self::Draining, Self::Terminated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub state: SessionState,
    pub at: Instant,
}

/// Current state plus the ordered record of every state entered.
///
/// Observers can `subscribe` to a `watch` channel; transitions are validated
/// and recorded atomically with the publish.
pub struct Lifecycle {
    tx: watch::Sender<SessionState>,
    history: Mutex<Vec<Transition>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Spawning);
        Self {
            tx,
            history: Mutex::new(vec![Transition {
                state: SessionState::Spawning,
                at: Instant::now(),
            }]),
        }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next` if that is a legal edge. Returns false (and changes
    /// nothing) otherwise, including when already in `next`.
    pub fn advance(&self, next: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if !state.can_advance_to(next) {
                return false;
            }
            *state = next;
            if let Ok(mut history) = self.history.lock() {
                history.push(Transition {
                    state: next,
                    at: Instant::now(),
                });
            }
            true
        })
    }

    /// States entered so far, oldest first.
    pub fn history(&self) -> Vec<SessionState> {
        self.history
            .lock()
            .map(|h| h.iter().map(|t| t.state).collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Wait until the state reaches `target` or anything after it.
    pub async fn wait_for(&self, target: SessionState) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s >= target).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    /// The process exited on its own with a status code.
    Exited,
    /// The process was killed by a signal nobody here sent.
    Signaled,
    /// Explicit `terminate` from a client or the REST surface.
    Terminated,
    /// Reclaimed by the reaper.
    IdleTimeout,
    /// Server shutdown.
    Shutdown,
    /// The process never started.
    SpawnFailed,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::Signaled => "signaled",
            Self::Terminated => "terminated",
            Self::IdleTimeout => "idle-timeout",
            Self::Shutdown => "shutdown",
            Self::SpawnFailed => "spawn-failed",
        }
    }
}

/// Exit diagnostics recorded when a session reaches `terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Spawn error text, or the tail of stderr for a failing process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExitInfo {
    pub fn spawn_failed(message: String) -> Self {
        Self {
            reason: ExitReason::SpawnFailed,
            exit_code: None,
            signal: None,
            detail: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::{Draining, Running, Spawning, Terminated};

    #[test]
    fn only_forward_edges_are_legal() {
        let all = [Spawning, Running, Draining, Terminated];
        let legal = [
            (Spawning, Running),
            (Spawning, Terminated),
            (Running, Draining),
            (Draining, Terminated),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_advance_to(to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn lifecycle_records_history_and_rejects_backward_moves() {
        let lc = Lifecycle::new();
        assert!(lc.advance(Running));
        assert!(!lc.advance(Spawning));
        assert!(!lc.advance(Terminated));
        assert!(lc.advance(Draining));
        assert!(!lc.advance(Draining));
        assert!(lc.advance(Terminated));
        assert!(!lc.advance(Running));
        assert_eq!(lc.history(), vec![Spawning, Running, Draining, Terminated]);
        assert_eq!(lc.current(), Terminated);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_later_state() {
        let lc = std::sync::Arc::new(Lifecycle::new());
        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.wait_for(Draining).await })
        };
        lc.advance(Running);
        lc.advance(Draining);
        lc.advance(Terminated);
        waiter.await.unwrap();
    }

    #[test]
    fn exit_info_serializes_camel_case() {
        let info = ExitInfo {
            reason: ExitReason::IdleTimeout,
            exit_code: Some(143),
            signal: None,
            detail: None,
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["reason"], "idle-timeout");
        assert_eq!(v["exitCode"], 143);
        assert!(v.get("signal").is_none());
    }
}
