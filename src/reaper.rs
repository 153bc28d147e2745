//! Reaper: a genuinely detached auxiliary OS process that polls both the
//! parent and server pids and signals the server if the parent disappears,
//! so termination is orphan-proof even if our own process is killed outright
//! rather than dropped.

use std::process::{Child, Command, Stdio};

/// Spawn the reaper. Returns the child handle; callers should not `wait()`
/// on it directly (it is meant to outlive the parent), only kill it during
/// normal shutdown.
pub fn spawn(parent_pid: u32, server_pid: u32) -> std::io::Result<Child> {
    #[cfg(unix)]
    {
        let script = format!(
            "while kill -0 {parent_pid} 2>/dev/null; do sleep 1; done; kill -TERM {server_pid} 2>/dev/null"
        );
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
    #[cfg(windows)]
    {
        let script = format!(
            "@echo off\n:loop\ntasklist /FI \"PID eq {parent_pid}\" 2>NUL | find \"{parent_pid}\" >NUL\nif not errorlevel 1 (\n  timeout /T 1 >NUL\n  goto loop\n)\ntaskkill /PID {server_pid} /F >NUL 2>&1"
        );
        Command::new("cmd")
            .arg("/C")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_reaper_process_starts() {
        let child = spawn(std::process::id(), std::process::id());
        assert!(child.is_ok());
        let mut child = child.unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}
