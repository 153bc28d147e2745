//! Instance Supervisor (C7): state machine that spawns the binary, parses
//! its output, emits readiness/error events, and guarantees shutdown via a
//! sidecar reaper.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};

use crate::download::{DownloadOptions, Downloader};
use crate::error::{EnsureError, ProcessError, StateError};
use crate::events::{Event, EventBus};
use crate::lockfile::LockRegistry;
use crate::download::BinaryCache;
use crate::locate::{self, LocateResult};
use crate::output::{self, LineSignal};
use crate::reaper;
use crate::types::{BinaryRequest, CleanupOptions, InstanceDescriptor, InstanceOptions, SupervisorState};

const DEFAULT_LAUNCH_TIMEOUT_MS: u64 = 10_000;
const MIN_LAUNCH_TIMEOUT_MS: u64 = 1_000;
const SHUTDOWN_PHASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to resolve and launch a binary, independent of any
/// one instance.
pub struct SupervisorConfig {
    pub binary_name: String,
    pub download_dir: Option<PathBuf>,
    pub system_binary: Option<PathBuf>,
    pub prefer_global_path: bool,
    pub home_dir: PathBuf,
    pub version: String,
    pub os: crate::platform::OsDescriptor,
    pub arch: String,
    pub check_md5: bool,
    pub download_opts: DownloadOptions,
    pub runtime_download: bool,
}

struct RunningProcess {
    // Shared with the post-readiness close watcher: `stop()` needs to send
    // signals through the same handle the watcher polls via `try_wait()`,
    // so both sides take short-lived locks rather than racing over a bare
    // `Child`.
    child: Arc<Mutex<Child>>,
    pid: u32,
    reaper: std::process::Child,
    watcher_cancel: Arc<Notify>,
}

struct Inner {
    state: SupervisorState,
    instance: Option<InstanceDescriptor>,
    running: Option<RunningProcess>,
    is_primary: bool,
}

/// The Instance Supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    locks: Arc<LockRegistry>,
    cache: Arc<BinaryCache>,
    events: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, locks: Arc<LockRegistry>, cache: Arc<BinaryCache>) -> Arc<Self> {
        Arc::new(Supervisor {
            config,
            locks,
            cache,
            events: Arc::new(EventBus::new()),
            inner: Mutex::new(Inner {
                state: SupervisorState::New,
                instance: None,
                running: None,
                is_primary: false,
            }),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    pub async fn instance_info(&self) -> Result<InstanceDescriptor, EnsureError> {
        self.inner
            .lock()
            .await
            .instance
            .clone()
            .ok_or(EnsureError::MissingInstanceInfo)
    }

    pub async fn get_uri(&self, db: Option<&str>) -> Result<String, EnsureError> {
        let instance = self.instance_info().await?;
        let db = db.unwrap_or("");
        Ok(format!("mongodb://{}:{}/{}", instance.ip, instance.port, db))
    }

    /// `create(opts)`: construct + `start`.
    pub async fn create(
        self: &Arc<Self>,
        opts: InstanceOptions,
    ) -> Result<(), SupervisorError> {
        self.start_internal(opts, false).await
    }

    /// `start(force_same_port)`.
    pub async fn start(
        self: &Arc<Self>,
        opts: InstanceOptions,
        force_same_port: bool,
    ) -> Result<(), SupervisorError> {
        self.start_internal(opts, force_same_port).await
    }

    async fn start_internal(
        self: &Arc<Self>,
        opts: InstanceOptions,
        force_same_port: bool,
    ) -> Result<(), SupervisorError> {
        {
            let mut guard = self.inner.lock().await;
            match guard.state {
                SupervisorState::Starting => {
                    return Err(SupervisorError::State(StateError {
                        allowed: vec!["new", "stopped"],
                        actual: "starting",
                    }));
                }
                // §9 open question: `running` falls through without error,
                // short-circuiting silently. Preserved intentionally.
                SupervisorState::Running => return Ok(()),
                SupervisorState::New | SupervisorState::Stopped => {}
            }
            guard.state = SupervisorState::Starting;
            self.events.publish(Event::StateChange(SupervisorState::Starting));
        }

        match self.run_start_pipeline(opts, force_same_port).await {
            Ok(()) => {
                let mut guard = self.inner.lock().await;
                guard.state = SupervisorState::Running;
                drop(guard);
                self.events.publish(Event::StateChange(SupervisorState::Running));
                self.events.publish(Event::InstanceStarted);
                Ok(())
            }
            Err(e) => {
                let _ = self.stop(CleanupOptions { do_cleanup: false, force: false }).await;
                Err(e)
            }
        }
    }

    async fn run_start_pipeline(
        self: &Arc<Self>,
        opts: InstanceOptions,
        force_same_port: bool,
    ) -> Result<(), SupervisorError> {
        let existing_port = {
            let guard = self.inner.lock().await;
            guard.instance.as_ref().map(|i| i.port)
        };
        let port = select_port(opts.port, force_same_port, existing_port)?;

        let (data_path, tmp_dir) = match opts.data_path {
            Some(p) => (p, false),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("minio-tst-")
                    .tempdir()
                    .map_err(|e| SupervisorError::Process(ProcessError::StartFailed {
                        binary: PathBuf::new(),
                        source: e,
                    }))?;
                (dir.into_path(), true)
            }
        };

        let binary_path = self.resolve_binary().await?;
        verify_permissions(&binary_path)?;

        let mut args = vec!["server".to_string(), data_path.display().to_string()];
        args.extend(opts.args.iter().cloned());

        let mut command = Command::new(&binary_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            SupervisorError::Process(ProcessError::StartFailed {
                binary: binary_path.clone(),
                source: e,
            })
        })?;

        let server_pid = child.id().ok_or_else(|| {
            SupervisorError::Process(ProcessError::StartFailed {
                binary: binary_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no pid after spawn"),
            })
        })?;

        let reaper_child = reaper::spawn(std::process::id(), server_pid).map_err(|e| {
            SupervisorError::Process(ProcessError::StartFailed {
                binary: binary_path.clone(),
                source: e,
            })
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let launch_timeout_ms = opts
            .launch_timeout_ms
            .unwrap_or(DEFAULT_LAUNCH_TIMEOUT_MS)
            .max(MIN_LAUNCH_TIMEOUT_MS);

        let this = self.clone();
        let readiness = race_readiness(this.clone(), stdout, stderr, &mut child, launch_timeout_ms).await;

        match readiness {
            Ok(()) => {
                let child = Arc::new(Mutex::new(child));
                let watcher_cancel = Arc::new(Notify::new());

                let mut guard = self.inner.lock().await;
                guard.instance = Some(InstanceDescriptor {
                    port,
                    data_path: data_path.clone(),
                    ip: opts.ip.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                    tmp_dir,
                    launch_timeout_ms,
                    args: args.clone(),
                    auth_options: opts.auth_options.clone(),
                });
                guard.running = Some(RunningProcess {
                    child: child.clone(),
                    pid: server_pid,
                    reaper: reaper_child,
                    watcher_cancel: watcher_cancel.clone(),
                });
                drop(guard);

                tokio::spawn(watch_for_close(self.clone(), child, watcher_cancel));
                Ok(())
            }
            Err(e) => {
                let _ = child.kill().await;
                let mut reaper_child = reaper_child;
                let _ = reaper_child.kill();
                Err(e)
            }
        }
    }

    async fn resolve_binary(self: &Arc<Self>) -> Result<PathBuf, SupervisorError> {
        let req = BinaryRequest {
            version: self.config.version.clone(),
            os: self.config.os.clone(),
            arch: self.config.arch.clone(),
            download_dir: self
                .config
                .download_dir
                .clone()
                .unwrap_or_else(|| self.config.home_dir.join(".cache").join("minio-binaries")),
            system_binary: self.config.system_binary.clone(),
            check_md5: self.config.check_md5,
        };

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let located = locate::locate(
            &self.config.binary_name,
            self.config.system_binary.as_deref(),
            self.config.download_dir.as_deref(),
            self.config.prefer_global_path,
            &self.config.home_dir,
            &cwd,
        );

        match located {
            LocateResult::Found(path) => Ok(path),
            LocateResult::NotFound { preferred_download_path } => {
                if !self.config.runtime_download {
                    return Err(SupervisorError::Process(ProcessError::StartFailed {
                        binary: preferred_download_path,
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "binary not found and runtime download disabled",
                        ),
                    }));
                }
                let download_dir = preferred_download_path
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.config.home_dir.clone());
                let mut req = req;
                req.download_dir = download_dir;
                let downloader = Downloader::new(self.locks.clone(), self.cache.clone());
                downloader
                    .provision(&req, &self.config.binary_name, &self.config.download_opts)
                    .await
                    .map_err(SupervisorError::Network)
            }
        }
    }

    /// `stop(cleanup_opts)`.
    pub async fn stop(self: &Arc<Self>, cleanup: CleanupOptions) -> Result<(), SupervisorError> {
        let running = {
            let mut guard = self.inner.lock().await;
            guard.running.take()
        };

        if let Some(RunningProcess { child, pid, mut reaper, watcher_cancel }) = running {
            watcher_cancel.notify_waiters();
            let mut child_guard = child.lock().await;
            shutdown_process(&mut child_guard, pid).await?;
            drop(child_guard);
            let _ = reaper.kill();
            let _ = reaper.wait();
        }

        {
            let mut guard = self.inner.lock().await;
            guard.state = SupervisorState::Stopped;
        }
        self.events.publish(Event::StateChange(SupervisorState::Stopped));

        if cleanup.do_cleanup {
            self.cleanup(cleanup.force).await?;
        }

        Ok(())
    }

    async fn cleanup(self: &Arc<Self>, force: bool) -> Result<(), SupervisorError> {
        {
            let guard = self.inner.lock().await;
            if guard.running.is_some() {
                return Err(SupervisorError::State(StateError {
                    allowed: vec!["stopped"],
                    actual: "running",
                }));
            }
        }

        let instance = {
            let guard = self.inner.lock().await;
            guard.instance.clone()
        };

        if let Some(instance) = instance {
            if instance.tmp_dir {
                let _ = std::fs::remove_dir_all(&instance.data_path);
            } else if force && instance.data_path.is_dir() {
                let _ = std::fs::remove_dir_all(&instance.data_path);
            }
        }

        {
            let mut guard = self.inner.lock().await;
            guard.state = SupervisorState::New;
        }
        self.events.publish(Event::StateChange(SupervisorState::New));
        Ok(())
    }

    /// `ensure_instance()`.
    pub async fn ensure_instance(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let state = self.state().await;
        match state {
            SupervisorState::Running => Ok(()),
            SupervisorState::Starting => {
                let mut rx = self.subscribe();
                loop {
                    match rx.recv().await {
                        Ok(Event::StateChange(SupervisorState::Running)) => return Ok(()),
                        Ok(Event::StateChange(other)) => {
                            return Err(SupervisorError::Ensure(EnsureError::UnexpectedTransition(
                                other.as_str().to_string(),
                            )));
                        }
                        Ok(_) => continue,
                        Err(_) => {
                            return Err(SupervisorError::Ensure(EnsureError::UnexpectedTransition(
                                "channel closed".to_string(),
                            )))
                        }
                    }
                }
            }
            SupervisorState::New | SupervisorState::Stopped => {
                self.start(InstanceOptions::default(), false).await
            }
        }
    }
}

fn select_port(
    requested: Option<u16>,
    force_same_port: bool,
    existing_port: Option<u16>,
) -> Result<u16, SupervisorError> {
    if force_same_port {
        if let Some(p) = existing_port {
            return Ok(p);
        }
    }

    if let Some(p) = requested {
        if TcpListener::bind(("127.0.0.1", p)).is_ok() {
            return Ok(p);
        }
        if force_same_port {
            return Err(SupervisorError::Process(ProcessError::InstanceError(format!(
                "StdoutInstanceError: port {p} already in use"
            ))));
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
        SupervisorError::Process(ProcessError::StartFailed {
            binary: PathBuf::new(),
            source: e,
        })
    })?;
    Ok(listener.local_addr().unwrap().port())
}

fn verify_permissions(path: &std::path::Path) -> Result<(), SupervisorError> {
    if !path.exists() {
        return Err(SupervisorError::Storage(crate::error::StorageError::BinaryNotFound {
            binary: path.display().to_string(),
        }));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path).map_err(crate::error::StorageError::Io)?;
        let mut perms = meta.permissions();
        perms.set_mode(0o755);
        let _ = std::fs::set_permissions(path, perms);

        let meta = std::fs::metadata(path).map_err(crate::error::StorageError::Io)?;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(SupervisorError::Storage(
                crate::error::StorageError::InsufficientPermissions {
                    path: path.to_path_buf(),
                },
            ));
        }
    }

    Ok(())
}

/// Race the four events from §4.7 step 7: readiness, an instance error,
/// process close, and the launch timeout.
async fn race_readiness(
    supervisor: Arc<Supervisor>,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    child: &mut Child,
    timeout_ms: u64,
) -> Result<(), SupervisorError> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ReadinessSignal>(32);

    let tx_out = tx.clone();
    let sup_out = supervisor.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match output::scan_stdout(&line) {
                LineSignal::StdoutReady => {
                    let _ = tx_out.send(ReadinessSignal::Ready).await;
                }
                LineSignal::FatalError(msg) => {
                    sup_out.events.publish(Event::InstanceError(msg.clone()));
                    let _ = tx_out.send(ReadinessSignal::Error(msg)).await;
                }
                LineSignal::ReplState { state, is_primary } => {
                    if !is_primary {
                        let mut guard = sup_out.inner.lock().await;
                        guard.is_primary = false;
                    }
                    sup_out.events.publish(Event::ReplState(state));
                }
                LineSignal::Primary => {
                    let mut guard = sup_out.inner.lock().await;
                    guard.is_primary = true;
                    drop(guard);
                    sup_out.events.publish(Event::Primary);
                }
                LineSignal::StderrReady | LineSignal::None => {}
            }
        }
    });

    let tx_err = tx.clone();
    let sup_err = supervisor.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match output::scan_stderr(&line) {
                LineSignal::StderrReady => {
                    let _ = tx_err.send(ReadinessSignal::Ready).await;
                }
                LineSignal::FatalError(msg) => {
                    sup_err.events.publish(Event::InstanceError(msg.clone()));
                    let _ = tx_err.send(ReadinessSignal::Error(msg)).await;
                }
                _ => {}
            }
        }
    });

    let wait_result = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            tokio::select! {
                signal = rx.recv() => {
                    match signal {
                        Some(ReadinessSignal::Ready) => return Ok(()),
                        Some(ReadinessSignal::Error(msg)) => {
                            return Err(SupervisorError::Process(ProcessError::InstanceError(msg)));
                        }
                        None => return Err(SupervisorError::Process(ProcessError::ExitedBeforeReady)),
                    }
                }
                status = child.wait() => {
                    let status = status.map_err(|e| SupervisorError::Process(ProcessError::StartFailed {
                        binary: PathBuf::new(),
                        source: e,
                    }))?;
                    if !status.success() {
                        return Err(SupervisorError::Process(ProcessError::ExitedBeforeReady));
                    }
                }
            }
        }
    })
    .await;

    match wait_result {
        Ok(inner) => inner,
        Err(_) => Err(SupervisorError::Process(ProcessError::LaunchTimeout(timeout_ms))),
    }
}

enum ReadinessSignal {
    Ready,
    Error(String),
}

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Post-readiness close watcher (§4.7 "Close handling"). Polls the child via
/// `try_wait()` rather than blocking on `wait()` so `stop()` can take the
/// same lock to deliver signals without contending with an in-flight wait.
/// Per §9 "Cyclic references," this calls `stop()` directly on an
/// unexpected close instead of round-tripping through the event bus.
async fn watch_for_close(supervisor: Arc<Supervisor>, child: Arc<Mutex<Child>>, cancel: Arc<Notify>) {
    loop {
        tokio::select! {
            _ = cancel.notified() => return,
            _ = tokio::time::sleep(CLOSE_POLL_INTERVAL) => {}
        }

        let status = {
            let mut guard = child.lock().await;
            match guard.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(_) => continue,
            }
        };

        // An explicit `stop()` already notified `cancel` and may have torn
        // the instance down by the time this poll observes the exit; only a
        // close witnessed while still `running` is this instance's own to
        // report, avoiding a duplicate state transition/event pair.
        let still_running = {
            let guard = supervisor.inner.lock().await;
            guard.state == SupervisorState::Running
        };
        if !still_running {
            return;
        }

        let code = status.code();
        let signal = close_signal_name(&status);

        if output::is_unexpected_close(code, signal.as_deref()) {
            let mut message = format!(
                "instance closed unexpectedly (code={code:?}, signal={signal:?})"
            );
            if let Some(augment) = output::augment_close_message(code, signal.as_deref()) {
                message = format!("{message}: {augment}");
            }
            supervisor.events.publish(Event::InstanceError(message));
        }
        supervisor.events.publish(Event::InstanceClosed { code, signal });

        let _ = supervisor
            .stop(CleanupOptions { do_cleanup: false, force: false })
            .await;
        return;
    }
}

#[cfg(unix)]
fn close_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| {
        nix::sys::signal::Signal::try_from(sig)
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|_| format!("SIG{sig}"))
    })
}

#[cfg(not(unix))]
fn close_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Two-phase shutdown: SIGINT → 10s wait → SIGKILL → 10s wait → reject.
async fn shutdown_process(child: &mut Child, pid: u32) -> Result<(), SupervisorError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }

    if tokio::time::timeout(SHUTDOWN_PHASE_TIMEOUT, child.wait()).await.is_ok() {
        return Ok(());
    }

    let _ = child.start_kill();

    if tokio::time::timeout(SHUTDOWN_PHASE_TIMEOUT, child.wait()).await.is_ok() {
        return Ok(());
    }

    Err(SupervisorError::Process(ProcessError::UnexpectedClose {
        code: None,
        signal: Some("SIGKILL".to_string()),
    }))
}

/// Supervisor-level error union, carrying every concern C3–C7 can raise
/// during `start`/`stop`.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(StateError),
    #[error(transparent)]
    Process(ProcessError),
    #[error(transparent)]
    Storage(#[from] crate::error::StorageError),
    #[error(transparent)]
    Network(#[from] crate::error::NetworkError),
    #[error(transparent)]
    Ensure(EnsureError),
}

impl From<SupervisorError> for crate::error::Error {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::State(s) => crate::error::Error::State(s),
            SupervisorError::Process(p) => crate::error::Error::Process(p),
            SupervisorError::Storage(s) => crate::error::Error::Storage(s),
            SupervisorError::Network(n) => crate::error::Error::Network(n),
            SupervisorError::Ensure(e) => crate::error::Error::Ensure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_port_picks_free_port_when_none_requested() {
        let port = select_port(None, false, None).unwrap();
        assert!(port > 0);
    }

    #[test]
    fn test_select_port_keeps_existing_when_force_same_port() {
        let port = select_port(Some(9999), true, Some(12345)).unwrap();
        assert_eq!(port, 12345);
    }
}
