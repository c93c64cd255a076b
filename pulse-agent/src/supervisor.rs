//! Daemon mode: keep one worker process alive
//!
//! The supervisor refuses to start when the PID file names a live process,
//! spawns the worker (this same binary without `--daemon`), and restarts it
//! after a short delay whenever it exits. A worker that just installed an
//! update writes the restart flag (or exits with `RESTART_EXIT_CODE`) and is
//! restarted without the delay. SIGINT/SIGTERM are forwarded to the worker,
//! which is killed if it outlives the grace period.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

pub const PID_FILE: &str = "work.pid";
pub const RESTART_FLAG: &str = "restart.flag";
/// Set on the worker so it knows a supervisor will relaunch it
pub const SUPERVISED_ENV: &str = "PULSE_SUPERVISED";
pub const RESTART_EXIT_CODE: i32 = 75;
pub const RESTART_DELAY: Duration = Duration::from_secs(5);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Another instance is already running with PID {0}")]
    AlreadyRunning(i32),

    #[error("PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot locate the running executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Zero-signal probe; EPERM still means the process exists
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Owns the PID file for the lifetime of the supervisor
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, SupervisorError> {
        let path = path.into();
        if let Some(pid) = read_pid(&path) {
            if process_alive(pid) {
                return Err(SupervisorError::AlreadyRunning(pid));
            }
            warn!(pid, path = %path.display(), "Removing stale PID file");
        }

        std::fs::write(&path, std::process::id().to_string()).map_err(|source| SupervisorError::PidFile {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// How `stop_child` ended the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Exited,
    Killed,
}

pub struct Supervisor {
    exe: PathBuf,
    args: Vec<OsString>,
    pid_file: PathBuf,
    restart_flag: PathBuf,
    restart_delay: Duration,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(exe: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            exe,
            args,
            pid_file: PathBuf::from(PID_FILE),
            restart_flag: PathBuf::from(RESTART_FLAG),
            restart_delay: RESTART_DELAY,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// Supervise this binary; `worker_args` must not contain the daemon flag
    pub fn for_current_process(worker_args: Vec<OsString>) -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
        Ok(Self::new(exe, worker_args))
    }

    /// Keep the PID file and restart flag under `dir` instead of the working directory
    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.pid_file = dir.join(PID_FILE);
        self.restart_flag = dir.join(RESTART_FLAG);
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Supervise until SIGTERM or SIGINT
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;

        self.run_until(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received, stopping worker"),
                _ = sigint.recv() => info!("SIGINT received, stopping worker"),
            }
        })
        .await
    }

    /// Supervise until `shutdown` resolves, then stop the worker
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), SupervisorError> {
        let pid_guard = PidGuard::acquire(&self.pid_file)?;
        info!(pid = std::process::id(), pid_file = %pid_guard.path().display(), "Supervisor started");
        tokio::pin!(shutdown);

        loop {
            let _ = std::fs::remove_file(&self.restart_flag);

            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(exe = %self.exe.display(), error = %e, "Failed to spawn worker");
                    tokio::select! {
                        _ = tokio::time::sleep(self.restart_delay) => continue,
                        _ = &mut shutdown => break,
                    }
                }
            };
            info!(pid = child.id(), "Worker started");

            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut shutdown => {
                    stop_child(&mut child, self.shutdown_grace).await;
                    break;
                }
            };

            match &status {
                Ok(status) => warn!(%status, "Worker exited"),
                Err(e) => error!(error = %e, "Failed to wait for worker"),
            }

            if self.restart_requested(status.ok()) {
                info!("Worker updated itself, restarting immediately");
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = &mut shutdown => break,
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.exe)
            .args(&self.args)
            .env(SUPERVISED_ENV, "1")
            .stdin(Stdio::null())
            .spawn()
    }

    fn restart_requested(&self, status: Option<ExitStatus>) -> bool {
        self.restart_flag.exists() || status.and_then(|s| s.code()) == Some(RESTART_EXIT_CODE)
    }
}

/// SIGTERM, then SIGKILL after the grace period
async fn stop_child(child: &mut Child, grace: Duration) -> StopOutcome {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to signal worker");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(%status, "Worker stopped");
            StopOutcome::Exited
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to wait for worker");
            StopOutcome::Exited
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                error!(error = %e, "Failed to kill worker");
            }
            StopOutcome::Killed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_liveness() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(i32::MAX));
        assert!(!process_alive(0));
    }

    #[test]
    fn test_pid_guard_refuses_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE);

        let guard = PidGuard::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));

        let second = PidGuard::acquire(&path);
        assert!(matches!(second, Err(SupervisorError::AlreadyRunning(pid)) if pid == std::process::id() as i32));

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_guard_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE);

        std::fs::write(&path, i32::MAX.to_string()).unwrap();
        let _guard = PidGuard::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));

        std::fs::write(&path, "not a pid").unwrap();
        assert!(PidGuard::acquire(&path).is_ok());
    }

    #[tokio::test]
    async fn test_restart_requested_by_flag_or_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(PathBuf::from("/bin/true"), Vec::new()).in_dir(dir.path());

        let normal = Command::new("sh").args(["-c", "exit 0"]).status().await.unwrap();
        let update = Command::new("sh")
            .args(["-c", &format!("exit {RESTART_EXIT_CODE}")])
            .status()
            .await
            .unwrap();

        assert!(!supervisor.restart_requested(Some(normal)));
        assert!(supervisor.restart_requested(Some(update)));

        std::fs::write(&supervisor.restart_flag, b"update").unwrap();
        assert!(supervisor.restart_requested(Some(normal)));
    }

    fn shell(script: &str) -> Supervisor {
        Supervisor::new(PathBuf::from("sh"), vec![OsString::from("-c"), OsString::from(script)])
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_stop_child_kills_after_grace() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        // Let the shell install its trap before signalling
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = stop_child(&mut child, Duration::from_millis(200)).await;

        assert_eq!(outcome, StopOutcome::Killed);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_child_exits_on_sigterm() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let outcome = stop_child(&mut child, Duration::from_secs(5)).await;

        assert_eq!(outcome, StopOutcome::Exited);
    }

    #[tokio::test]
    async fn test_update_exit_restarts_without_delay() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let script = format!("echo run >> '{}'; exit {RESTART_EXIT_CODE}", runs.display());
        let supervisor = shell(&script)
            .in_dir(dir.path())
            .with_restart_delay(Duration::from_secs(30));

        supervisor
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(line_count(&runs) >= 3);
        assert!(!dir.path().join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn test_plain_exit_waits_for_restart_delay() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let script = format!("echo run >> '{}'; exit 0", runs.display());
        let supervisor = shell(&script)
            .in_dir(dir.path())
            .with_restart_delay(Duration::from_secs(30));

        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();

        assert_eq!(line_count(&runs), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = shell("trap '' TERM; sleep 30")
            .in_dir(dir.path())
            .with_shutdown_grace(Duration::from_millis(200));

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.run_until(tokio::time::sleep(Duration::from_millis(300))),
        )
        .await;

        assert!(matches!(stopped, Ok(Ok(()))));
        assert!(!dir.path().join(PID_FILE).exists());
    }
}
