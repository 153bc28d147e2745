//! Lockfile (C5): cross-process advisory lock using a marker file carrying
//! `(pid, uuid)`, with liveness checks and in-process waiters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::LockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockStatus {
    Available,
    AvailableInstance,
    LockedSelf,
    LockedDifferent,
}

struct LockOwner {
    notify: Arc<Notify>,
}

/// Process-wide registry of in-flight locks, serializing create/release
/// under one mutex per §4.5's "process-wide mutex."
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<PathBuf, LockOwner>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(LockRegistry::default())
    }

    /// Acquire the lock at `path`, retrying across processes via a 3-second
    /// poll and in-process via `Notify`, per §4.5's acquisition algorithm.
    pub async fn lock(self: &Arc<Self>, path: &Path) -> Result<LockHandle, LockError> {
        let path = normalize(path);
        loop {
            match check(&path, None)? {
                LockStatus::Available => match self.try_create_lock(&path).await? {
                    Some(handle) => return Ok(handle),
                    None => continue, // race loser: someone else created it first
                },
                LockStatus::AvailableInstance => unreachable!("check(None) never returns this"),
                LockStatus::LockedSelf | LockStatus::LockedDifferent => {
                    self.wait_for_unlock(&path).await;
                }
            }
        }
    }

    async fn try_create_lock(
        self: &Arc<Self>,
        path: &Path,
    ) -> Result<Option<LockHandle>, LockError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.contains_key(path) {
            return Ok(None);
        }

        // Re-check under the mutex: another thread in this process, or
        // another process entirely, may have written the marker since our
        // unlocked `check` above.
        match check(path, None)? {
            LockStatus::Available => {}
            _ => return Ok(None),
        }

        let uuid = Uuid::new_v4();
        let pid = std::process::id();
        write_marker(path, pid, uuid)?;

        let notify = Arc::new(Notify::new());
        guard.insert(path.to_path_buf(), LockOwner { notify: notify.clone() });
        drop(guard);

        Ok(Some(LockHandle {
            registry: self.clone(),
            path: path.to_path_buf(),
            uuid,
            released: false,
        }))
    }

    async fn wait_for_unlock(self: &Arc<Self>, path: &Path) {
        let notified = {
            let guard = self.inner.lock().unwrap();
            guard.get(path).map(|o| o.notify.clone())
        };

        match notified {
            Some(notify) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                }
            }
            None => {
                // No in-process owner (cross-process contention); fall back
                // to the poll-only path.
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }

    fn release(&self, path: &Path, uuid: Uuid) -> Result<(), LockError> {
        let mut guard = self.inner.lock().unwrap();

        match check(path, Some(uuid))? {
            LockStatus::AvailableInstance => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(|e| LockError::Io {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                }
            }
            LockStatus::Available => {
                // Already cleaned up by another actor; nothing to unlink.
            }
            LockStatus::LockedSelf | LockStatus::LockedDifferent => {
                return Err(LockError::StillLocked {
                    path: path.to_path_buf(),
                });
            }
        }

        if let Some(owner) = guard.remove(path) {
            owner.notify.notify_waiters();
        }
        Ok(())
    }
}

/// A held lock. Dropping without calling [`LockHandle::unlock`] leaks the
/// marker file; callers should always unlock explicitly.
pub struct LockHandle {
    registry: Arc<LockRegistry>,
    path: PathBuf,
    uuid: Uuid,
    released: bool,
}

impl LockHandle {
    /// Release the lock. A second call on an already-released handle is a
    /// no-op, per §4.5's release algorithm.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.registry.release(&self.path, self.uuid)?;
        self.released = true;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// `check(path, uuid?)`: the four-state classification from §4.5.
fn check(path: &Path, own_uuid: Option<Uuid>) -> Result<LockStatus, LockError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockStatus::Available),
        Err(e) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let (pid, uuid) = match parse_marker(&content) {
        Some(pair) => pair,
        None => return Ok(LockStatus::Available),
    };

    if !is_alive(pid) {
        return Ok(LockStatus::Available);
    }

    let our_pid = std::process::id();
    if pid == our_pid {
        if let Some(expected) = own_uuid {
            if uuid == expected {
                return Ok(LockStatus::AvailableInstance);
            }
        }
        return Ok(LockStatus::LockedSelf);
    }

    Ok(LockStatus::LockedDifferent)
}

fn parse_marker(content: &str) -> Option<(u32, Uuid)> {
    let trimmed = content.trim();
    let mut parts = trimmed.split_whitespace();
    let pid: u32 = parts.next()?.parse().ok()?;
    let uuid: Uuid = parts.next()?.parse().ok()?;
    Some((pid, uuid))
}

fn write_marker(path: &Path, pid: u32, uuid: Uuid) -> Result<(), LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, format!("{pid} {uuid}")).map_err(|e| LockError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Liveness: a no-op signal (`0`). Any error is treated as not-alive.
#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn is_alive(pid: u32) -> bool {
    // Windows: OpenProcess against PROCESS_QUERY_LIMITED_INFORMATION is the
    // closest analogue of a signal-0 probe.
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_then_unlock_leaves_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        let registry = LockRegistry::new();

        let mut handle = registry.lock(&path).await.unwrap();
        assert!(path.exists());

        handle.unlock().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_double_unlock_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        let registry = LockRegistry::new();

        let mut handle = registry.lock(&path).await.unwrap();
        handle.unlock().unwrap();
        handle.unlock().unwrap();
    }

    #[tokio::test]
    async fn test_stale_pid_lock_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");

        // A pid that is astronomically unlikely to be alive.
        std::fs::write(&path, format!("999999 {}", Uuid::new_v4())).unwrap();

        let registry = LockRegistry::new();
        let mut handle = registry.lock(&path).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));
        handle.unlock().unwrap();
    }

    #[tokio::test]
    async fn test_contention_within_process_serializes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.lock");
        let registry = LockRegistry::new();

        let mut first = registry.lock(&path).await.unwrap();
        let status = check(&path, None).unwrap();
        assert_eq!(status, LockStatus::LockedSelf);
        first.unlock().unwrap();
    }

    #[test]
    fn test_parse_marker_tolerates_trailing_whitespace() {
        let uuid = Uuid::new_v4();
        let content = format!("1234 {uuid}  \n");
        let (pid, parsed_uuid) = parse_marker(&content).unwrap();
        assert_eq!(pid, 1234);
        assert_eq!(parsed_uuid, uuid);
    }
}
