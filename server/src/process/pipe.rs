//! Pipe-backed spawning in a dedicated process group.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Spawn `program` with piped stdin/stdout/stderr.
///
/// `setpgid(0, 0)` in `pre_exec` makes the child a process group leader so
/// `kill(-pgid, sig)` reaches everything it starts. `kill_on_drop(true)`
/// covers the case where the owning task is cancelled.
pub fn spawn_piped(
    program: &str,
    args: &[String],
    env: &[(String, String)],
    cwd: &Path,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}
