//! PTY allocation, spawning on the slave side, and terminal resize.
//!
//! Uses `nix` for `openpty` and raw `libc` for the controlling-terminal and
//! window-size ioctls. The master fd stays with the session for resize; two
//! independent clones of it back the async reader and writer.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program` with the PTY slave as its controlling terminal.
///
/// The child calls `setsid()` so it leads a new session and process group
/// (pgid == pid), then takes the slave as stdin/stdout/stderr. The parent's
/// copy of the slave is closed when `pty.slave` is dropped by the caller.
pub fn spawn_on_pty(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    env: &[(String, String)],
    cwd: &Path,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let master_fd = pty.master.as_raw_fd();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            libc::close(master_fd);
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct from the pointer.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Async read and write handles over clones of the master fd.
pub fn master_streams(master: &OwnedFd) -> std::io::Result<(tokio::fs::File, tokio::fs::File)> {
    let reader = std::fs::File::from(master.try_clone()?);
    let writer = std::fs::File::from(master.try_clone()?);
    Ok((tokio::fs::File::from_std(reader), tokio::fs::File::from_std(writer)))
}
