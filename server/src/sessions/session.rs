//! A single managed child process and everything attached to it.
//!
//! A [`ManagedSession`] owns the process handle's I/O side: the output pumps
//! feeding the [`SessionOutput`] buffer, the input pump fed by `stdin_tx`, and
//! the PTY master (for resize). The `Child` itself goes to the exit observer,
//! which is the only place that reaps the process and the only place that
//! drives the lifecycle to `terminated`.
//!
//! ## Termination
//!
//! [`ManagedSession::terminate`] moves `running -> draining`, signals the
//! process group with SIGTERM (plus SIGHUP on a PTY, which interactive shells
//! honour), waits up to the grace period for the observer to reach
//! `terminated`, then escalates to SIGKILL.

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bridge::{
    pump_input, pump_output, subscriber, ActivityClock, Framing, PumpContext, SessionOutput,
    StreamTail, Subscription,
};
use super::buffer::{OutputEntry, OutputStream};
use super::state::{ExitInfo, ExitReason, Lifecycle, SessionKind, SessionState};
use crate::error::{Error, Result};
use crate::process::{self, pty, ProcessIo, SpawnedProcess};
use crate::protocol::ServerMessage;

/// Input queue depth between the gateway and the process writer.
const INPUT_QUEUE: usize = 64;

/// How long output pumps may keep draining after the process is reaped.
const PUMP_DRAIN: Duration = Duration::from_secs(1);

/// Upper bound on waiting for the observer after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Serializable summary used by REST listings and `create` results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub project_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub pty: bool,
    pub attached: bool,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub idle_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
}

impl SessionInfo {
    /// Summary for a session whose process could not be started.
    pub fn spawn_failed(
        session_id: String,
        kind: SessionKind,
        project_path: PathBuf,
        exit: ExitInfo,
    ) -> Self {
        Self {
            session_id,
            kind,
            state: SessionState::Terminated,
            project_path,
            pid: None,
            pty: false,
            attached: false,
            created_at: crate::util::now_ms(),
            idle_ms: 0,
            exit: Some(exit),
        }
    }
}

pub struct ManagedSession {
    pub id: String,
    pub kind: SessionKind,
    /// Validated working directory, fixed at creation.
    pub project_path: PathBuf,
    pub pid: u32,
    /// Equals `pid`: the child leads its own process group.
    pub pgid: u32,
    pub created_at: u64,
    lifecycle: Lifecycle,
    output: Arc<Mutex<SessionOutput>>,
    activity: Arc<ActivityClock>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    input_task: AbortHandle,
    pty_master: Option<OwnedFd>,
    stderr_tail: Arc<StreamTail>,
    /// Reason recorded by whoever initiated termination.
    pending_reason: std::sync::Mutex<Option<ExitReason>>,
    exit: std::sync::Mutex<Option<ExitInfo>>,
}

/// A freshly started session plus the pieces the exit observer consumes.
pub struct Started {
    pub session: Arc<ManagedSession>,
    pub child: Child,
    pub pumps: Vec<JoinHandle<()>>,
}

impl ManagedSession {
    /// Wire pumps around a spawned process and mark the session `running`.
    pub fn start(
        id: String,
        kind: SessionKind,
        project_path: PathBuf,
        spawned: SpawnedProcess,
        buffer_size: usize,
    ) -> Started {
        let SpawnedProcess { child, pid, io } = spawned;
        let output = Arc::new(Mutex::new(SessionOutput::new(buffer_size)));
        let activity = Arc::new(ActivityClock::new());
        let stderr_tail = Arc::new(StreamTail::default());
        let ctx = PumpContext {
            session_id: id.clone(),
            output: Arc::clone(&output),
            activity: Arc::clone(&activity),
        };
        let framing = match kind {
            SessionKind::Conversation => Framing::Lines,
            SessionKind::Shell => Framing::Raw,
        };

        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        let (pumps, input_task, pty_master) = match io {
            ProcessIo::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                let input = tokio::spawn(pump_input(id.clone(), stdin, stdin_rx));
                let out = tokio::spawn(pump_output(
                    ctx.clone(),
                    stdout,
                    OutputStream::Stdout,
                    framing,
                    None,
                ));
                let err = tokio::spawn(pump_output(
                    ctx,
                    stderr,
                    OutputStream::Stderr,
                    framing,
                    Some(Arc::clone(&stderr_tail)),
                ));
                (vec![out, err], input.abort_handle(), None)
            }
            ProcessIo::Pty {
                master,
                reader,
                writer,
            } => {
                let input = tokio::spawn(pump_input(id.clone(), writer, stdin_rx));
                let out = tokio::spawn(pump_output(ctx, reader, OutputStream::Stdout, framing, None));
                (vec![out], input.abort_handle(), Some(master))
            }
        };

        let lifecycle = Lifecycle::new();
        lifecycle.advance(SessionState::Running);

        let session = Arc::new(Self {
            id,
            kind,
            project_path,
            pid,
            pgid: pid,
            created_at: crate::util::now_ms(),
            lifecycle,
            output,
            activity,
            stdin_tx,
            input_task,
            pty_master,
            stderr_tail,
            pending_reason: std::sync::Mutex::new(None),
            exit: std::sync::Mutex::new(None),
        });

        Started {
            session,
            child,
            pumps,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.current()
    }

    pub fn is_pty(&self) -> bool {
        self.pty_master.is_some()
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe `connection_id` to live output and snapshot the replay in
    /// the same critical section.
    ///
    /// Returns `(replay, dropped, subscription, displaced_connection)`.
    pub async fn attach(
        &self,
        connection_id: Uuid,
        since: Option<u64>,
        queue: usize,
    ) -> (Vec<OutputEntry>, u64, Subscription, Option<Uuid>) {
        self.activity.touch();
        let (sub, subscription) = subscriber(connection_id, queue);
        let mut output = self.output.lock().await;
        let (replay, dropped) = output.buffer.read_since(since.unwrap_or(0));
        let displaced = output.fanout.replace(sub);
        (replay, dropped, subscription, displaced)
    }

    /// Drop `connection_id` from the fan-out if it is still the subscriber.
    pub async fn detach(&self, connection_id: Uuid) -> bool {
        self.activity.touch();
        self.output.lock().await.fanout.remove_if(connection_id)
    }

    pub async fn is_attached(&self) -> bool {
        self.output.lock().await.fanout.is_attached()
    }

    /// Queue bytes for the process. Returns `Ok(false)` without writing when
    /// the session is not `running`.
    pub async fn write_input(&self, data: Vec<u8>) -> Result<bool> {
        let state = self.state();
        if state != SessionState::Running {
            debug!("Session {}: input ignored in state {}", self.id, state.as_str());
            return Ok(false);
        }
        self.activity.touch();
        self.stdin_tx
            .send(data)
            .await
            .map_err(|_| Error::InputClosed(self.id.clone()))?;
        Ok(true)
    }

    /// Apply a terminal size. `Ok(false)` means the transport has no notion
    /// of size (pipes) and the request was accepted without effect.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<bool> {
        let Some(master) = &self.pty_master else {
            return Ok(false);
        };
        pty::resize_pty(master, rows, cols).map_err(|e| Error::Io(e.into()))?;
        Ok(true)
    }

    /// Stop the process and wait for the observer to record its exit.
    ///
    /// Idempotent: a second call while draining just waits. Returns the exit
    /// record, or `None` if the process could not be confirmed dead.
    pub async fn terminate(&self, reason: ExitReason, grace: Duration) -> Option<ExitInfo> {
        {
            let mut pending = self
                .pending_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if pending.is_none() && self.state() < SessionState::Terminated {
                *pending = Some(reason);
            }
        }

        if self.lifecycle.advance(SessionState::Draining) {
            info!(
                "Session {} draining ({}), SIGTERM to group {}",
                self.id,
                reason.as_str(),
                self.pgid
            );
            if self.is_pty() {
                let _ = process::signal_group(self.pgid, libc::SIGHUP);
            }
            if let Err(e) = process::signal_group(self.pgid, libc::SIGTERM) {
                warn!("Session {}: SIGTERM failed: {e}", self.id);
            }
        }

        let terminated = self.lifecycle.wait_for(SessionState::Terminated);
        tokio::pin!(terminated);
        if tokio::time::timeout(grace, &mut terminated).await.is_err() {
            warn!(
                "Session {} still alive after {}ms, sending SIGKILL",
                self.id,
                grace.as_millis()
            );
            if let Err(e) = process::signal_group(self.pgid, libc::SIGKILL) {
                warn!("Session {}: SIGKILL failed: {e}", self.id);
            }
            if tokio::time::timeout(KILL_WAIT, &mut terminated).await.is_err() {
                warn!("Session {}: exit not observed after SIGKILL", self.id);
                return None;
            }
        }
        self.exit_info()
    }

    /// Reap the child, let the pumps drain, notify the subscriber, and move
    /// to `terminated`. Runs once per session on its own task.
    pub async fn observe(&self, mut child: Child, pumps: Vec<JoinHandle<()>>) -> ExitInfo {
        let status = child.wait().await;

        for mut pump in pumps {
            if tokio::time::timeout(PUMP_DRAIN, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        self.input_task.abort();

        let exit = self.exit_from(status);
        *self.exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(exit.clone());
        info!(
            "Session {} ended: {} (code {:?}, signal {:?})",
            self.id,
            exit.reason.as_str(),
            exit.exit_code,
            exit.signal
        );

        self.lifecycle.advance(SessionState::Draining);
        {
            let mut output = self.output.lock().await;
            output
                .fanout
                .finish(ServerMessage::session_ended(&self.id, &exit));
        }
        self.lifecycle.advance(SessionState::Terminated);
        exit
    }

    fn exit_from(&self, status: std::io::Result<ExitStatus>) -> ExitInfo {
        let pending = *self
            .pending_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match status {
            Ok(status) => {
                let exit_code = status.code();
                let signal = status.signal();
                let reason = pending.unwrap_or(if exit_code.is_some() {
                    ExitReason::Exited
                } else {
                    ExitReason::Signaled
                });
                let detail = if pending.is_none() && exit_code != Some(0) {
                    self.stderr_tail.get()
                } else {
                    None
                };
                ExitInfo {
                    reason,
                    exit_code,
                    signal,
                    detail,
                }
            }
            Err(e) => ExitInfo {
                reason: pending.unwrap_or(ExitReason::Exited),
                exit_code: None,
                signal: None,
                detail: Some(format!("wait failed: {e}")),
            },
        }
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            kind: self.kind,
            state: self.state(),
            project_path: self.project_path.clone(),
            pid: Some(self.pid),
            pty: self.is_pty(),
            attached: self.is_attached().await,
            created_at: self.created_at,
            idle_ms: self.idle_for().as_millis() as u64,
            exit: self.exit_info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandSpec, Transport};
    use std::path::Path;

    fn start_sh(script: &str, kind: SessionKind) -> Started {
        let spec = CommandSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![],
            transport: Transport::Pipes,
        };
        let spawned = process::spawn(&spec, Path::new("/tmp")).unwrap();
        ManagedSession::start("t".into(), kind, PathBuf::from("/tmp"), spawned, 100)
    }

    #[tokio::test]
    async fn natural_exit_is_recorded_with_stderr_detail() {
        let Started {
            session,
            child,
            pumps,
        } = start_sh("echo boom >&2; exit 3", SessionKind::Conversation);
        let exit = session.observe(child, pumps).await;
        assert_eq!(exit.reason, ExitReason::Exited);
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.detail.as_deref(), Some("boom"));
        assert_eq!(
            session.lifecycle().history(),
            vec![
                SessionState::Spawning,
                SessionState::Running,
                SessionState::Draining,
                SessionState::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill_within_grace() {
        let Started {
            session,
            child,
            pumps,
        } = start_sh("trap '' TERM; while :; do sleep 1; done", SessionKind::Shell);
        let observer = {
            let s = Arc::clone(&session);
            tokio::spawn(async move { s.observe(child, pumps).await })
        };

        let started = std::time::Instant::now();
        let exit = session
            .terminate(ExitReason::Terminated, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(300) + KILL_WAIT);
        assert_eq!(exit.reason, ExitReason::Terminated);
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(session.state(), SessionState::Terminated);
        observer.await.unwrap();
    }

    #[tokio::test]
    async fn input_after_termination_is_a_no_op() {
        let Started {
            session,
            child,
            pumps,
        } = start_sh("cat", SessionKind::Shell);
        assert!(session.write_input(b"hello\n".to_vec()).await.unwrap());
        let observer = {
            let s = Arc::clone(&session);
            tokio::spawn(async move { s.observe(child, pumps).await })
        };
        session
            .terminate(ExitReason::Terminated, Duration::from_secs(2))
            .await;
        observer.await.unwrap();
        assert!(!session.write_input(b"late\n".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn pipe_sessions_accept_resize_without_effect() {
        let Started { session, .. } = start_sh("sleep 0", SessionKind::Shell);
        assert!(!session.is_pty());
        assert!(!session.resize(24, 80).unwrap());
    }
}
