//! Child process construction and spawning.
//!
//! A session's process is described by a [`CommandSpec`] (what to run and over
//! which [`Transport`]) and started by [`spawn`], which hands back the child
//! together with its raw I/O handles. Everything is placed in its own process
//! group so signals reach the whole tree.

pub mod pipe;
pub mod pty;

use std::os::fd::OwnedFd;
use std::path::Path;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::config::{AssistantConfig, ShellConfig};
use crate::error::{Error, Result};

/// How the child's stdio is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Separate stdin/stdout/stderr pipes. No terminal, no resize.
    Pipes,
    /// A pseudo-terminal with the given initial size; stdout and stderr merge.
    Pty { rows: u16, cols: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub transport: Transport,
}

/// Assistant CLI invocation for a conversation session.
///
/// Resumption passes `resume_flag <id>`; a fresh session passes
/// `session_id_flag <id>` so the same id can be resumed later.
pub fn conversation_command(cfg: &AssistantConfig, session_id: &str, resume: bool) -> CommandSpec {
    let mut args = cfg.args.clone();
    let flag = if resume {
        &cfg.resume_flag
    } else {
        &cfg.session_id_flag
    };
    if !flag.is_empty() {
        args.push(flag.clone());
        args.push(session_id.to_string());
    }
    CommandSpec {
        program: cfg.binary.clone(),
        args,
        env: Vec::new(),
        transport: Transport::Pipes,
    }
}

/// Interactive shell invocation for a terminal session.
///
/// On a PTY the shell starts as a login shell so rc files are sourced; on
/// pipes `-i` forces interactive mode (prompt included) without a terminal.
pub fn shell_command(cfg: &ShellConfig, rows: u16, cols: u16) -> CommandSpec {
    let (flag, transport) = if cfg.use_pty {
        ("-l", Transport::Pty { rows, cols })
    } else {
        ("-i", Transport::Pipes)
    };
    CommandSpec {
        program: cfg.default_shell.clone(),
        args: vec![flag.to_string()],
        env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        transport,
    }
}

/// Raw stdio of a freshly spawned child.
pub enum ProcessIo {
    Pipes {
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
    },
    Pty {
        /// Kept by the session for resize.
        master: OwnedFd,
        reader: tokio::fs::File,
        writer: tokio::fs::File,
    },
}

pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    pub io: ProcessIo,
}

/// Start the process described by `spec` in `cwd`.
pub fn spawn(spec: &CommandSpec, cwd: &Path) -> Result<SpawnedProcess> {
    let spawn_err = |source: std::io::Error| Error::Spawn {
        program: spec.program.clone(),
        source,
    };

    match spec.transport {
        Transport::Pipes => {
            let mut child = pipe::spawn_piped(&spec.program, &spec.args, &spec.env, cwd)
                .map_err(spawn_err)?;
            let pid = child.id().unwrap_or(0);
            let missing = |what: &str| spawn_err(std::io::Error::other(format!("{what} pipe unavailable")));
            let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
            let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
            let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
            Ok(SpawnedProcess {
                child,
                pid,
                io: ProcessIo::Pipes {
                    stdin,
                    stdout,
                    stderr,
                },
            })
        }
        Transport::Pty { rows, cols } => {
            let pair = pty::allocate_pty(rows, cols).map_err(|e| spawn_err(e.into()))?;
            let child = pty::spawn_on_pty(&pair, &spec.program, &spec.args, &spec.env, cwd)
                .map_err(spawn_err)?;
            let pid = child.id().unwrap_or(0);
            let pty::PtyPair { master, slave } = pair;
            // The child holds its own copy; ours must go so EOF/EIO is seen on exit.
            drop(slave);
            let (reader, writer) = pty::master_streams(&master).map_err(spawn_err)?;
            Ok(SpawnedProcess {
                child,
                pid,
                io: ProcessIo::Pty {
                    master,
                    reader,
                    writer,
                },
            })
        }
    }
}

/// Send `signal` to the process group led by `pgid`.
pub fn signal_group(pgid: u32, signal: i32) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pgid as i32;
    if pgid <= 0 {
        return Ok(());
    }
    // SAFETY: kill(2) with a negative pid targets the process group.
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        // Group already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}
