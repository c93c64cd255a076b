//! Self-update against the collector
//!
//! Features:
//! - Poll `<metrics_url>/version` every 10 seconds (5 second backoff on fetch errors)
//! - Download `<metrics_url>/agent/agent` next to the running executable
//! - Atomic rename over the current binary, never an in-place overwrite
//! - Relaunch by exec (same PID, args and env) or through the daemon supervisor

use parking_lot::Mutex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ConfigStore};
use crate::supervisor::{RESTART_EXIT_CODE, RESTART_FLAG, SUPERVISED_ENV};

pub const LOCAL_VERSION: &str = match option_env!("PULSE_AGENT_VERSION") {
    Some(version) => version,
    None => "1.0",
};
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const FETCH_BACKOFF: Duration = Duration::from_secs(5);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Cannot locate the running executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Version check failed: {0}")]
    Fetch(#[source] reqwest::Error),

    #[error("Binary download failed: {0}")]
    Download(#[source] reqwest::Error),

    #[error("Downloaded binary is empty")]
    EmptyBinary,

    #[error("Failed to stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace {path}: {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Relaunch failed: {0}")]
    Relaunch(#[source] std::io::Error),
}

/// Version identifier as published by the collector
#[derive(Debug, Clone, PartialEq)]
pub enum VersionMarker {
    /// Empty or zero; no decision can be made
    Unset,
    Numeric(f64),
    Text(String),
}

impl VersionMarker {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return VersionMarker::Unset;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value == 0.0 => VersionMarker::Unset,
            Ok(value) => VersionMarker::Numeric(value),
            Err(_) => VersionMarker::Text(trimmed.to_string()),
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, VersionMarker::Unset)
    }

    pub fn matches(&self, other: &VersionMarker) -> bool {
        match (self, other) {
            (VersionMarker::Numeric(a), VersionMarker::Numeric(b)) => a == b,
            (VersionMarker::Text(a), VersionMarker::Text(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingVersion,
    Downloading,
    Replacing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Either side reported an unset version
    Skipped,
    UpToDate,
    Updated { version: String },
    /// Another update attempt holds the lock
    Busy,
}

/// Starts the freshly installed binary
pub trait Relauncher: Send + Sync {
    fn relaunch(&self, exe: &Path) -> Result<(), UpdateError>;
}

/// Replace the process image, keeping PID, arguments and environment
pub struct ExecInPlace;

impl Relauncher for ExecInPlace {
    fn relaunch(&self, exe: &Path) -> Result<(), UpdateError> {
        use std::os::unix::process::CommandExt;

        info!(exe = %exe.display(), "Re-executing updated binary");
        // exec only returns on failure
        let err = std::process::Command::new(exe).args(std::env::args_os().skip(1)).exec();
        Err(UpdateError::Relaunch(err))
    }
}

/// Ask the daemon supervisor for an immediate restart
pub struct RestartViaSupervisor {
    flag: PathBuf,
}

impl RestartViaSupervisor {
    pub fn new(flag: impl Into<PathBuf>) -> Self {
        Self { flag: flag.into() }
    }
}

impl Relauncher for RestartViaSupervisor {
    fn relaunch(&self, _exe: &Path) -> Result<(), UpdateError> {
        std::fs::write(&self.flag, b"update").map_err(UpdateError::Relaunch)?;
        info!(flag = %self.flag.display(), "Restart requested from supervisor");
        std::process::exit(RESTART_EXIT_CODE);
    }
}

/// Resets the visible state when an attempt ends, whatever the outcome
struct StateGuard<'a>(&'a Mutex<UpdateState>);

impl StateGuard<'_> {
    fn set(&self, state: UpdateState) {
        *self.0.lock() = state;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = UpdateState::Idle;
    }
}

pub struct SelfUpdater {
    client: reqwest::Client,
    local: VersionMarker,
    local_raw: String,
    exe: PathBuf,
    relauncher: Box<dyn Relauncher>,
    in_progress: tokio::sync::Mutex<()>,
    state: Mutex<UpdateState>,
}

impl SelfUpdater {
    pub fn new(local_version: &str, exe: PathBuf, relauncher: Box<dyn Relauncher>) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(UpdateError::Client)?;
        Ok(Self {
            client,
            local: VersionMarker::parse(local_version),
            local_raw: local_version.to_string(),
            exe,
            relauncher,
            in_progress: tokio::sync::Mutex::new(()),
            state: Mutex::new(UpdateState::Idle),
        })
    }

    /// Updater for this process; relaunch goes through the supervisor when one is present
    pub fn for_current_process() -> Result<Self, UpdateError> {
        let exe = std::env::current_exe().map_err(UpdateError::CurrentExe)?;
        let relauncher: Box<dyn Relauncher> = if std::env::var(SUPERVISED_ENV).as_deref() == Ok("1") {
            Box::new(RestartViaSupervisor::new(RESTART_FLAG))
        } else {
            Box::new(ExecInPlace)
        };
        Self::new(LOCAL_VERSION, exe, relauncher)
    }

    pub fn state(&self) -> UpdateState {
        *self.state.lock()
    }

    pub async fn fetch_remote(&self, url: &str) -> Result<VersionMarker, UpdateError> {
        let body = self
            .client
            .get(url)
            .timeout(FETCH_BACKOFF)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(UpdateError::Fetch)?
            .text()
            .await
            .map_err(UpdateError::Fetch)?;
        Ok(VersionMarker::parse(&body))
    }

    /// One pass of the update state machine
    pub async fn check_and_update(&self, config: &AgentConfig) -> Result<UpdateOutcome, UpdateError> {
        let Ok(_lock) = self.in_progress.try_lock() else {
            debug!("Update already in progress");
            return Ok(UpdateOutcome::Busy);
        };
        let state = StateGuard(&self.state);

        state.set(UpdateState::CheckingVersion);
        let remote = self.fetch_remote(&config.version_endpoint()).await?;
        if self.local.is_unset() || remote.is_unset() {
            return Ok(UpdateOutcome::Skipped);
        }
        if self.local.matches(&remote) {
            return Ok(UpdateOutcome::UpToDate);
        }

        info!(local = %self.local_raw, remote = ?remote, "Version mismatch, updating");

        state.set(UpdateState::Downloading);
        let staged = self.download(&config.binary_endpoint()).await?;

        state.set(UpdateState::Replacing);
        if let Err(e) = replace_executable(&staged, &self.exe) {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
        info!(exe = %self.exe.display(), "Executable replaced");

        self.relauncher.relaunch(&self.exe)?;
        Ok(UpdateOutcome::Updated {
            version: match remote {
                VersionMarker::Numeric(v) => v.to_string(),
                VersionMarker::Text(t) => t,
                VersionMarker::Unset => String::new(),
            },
        })
    }

    /// Download into a uniquely named file beside the executable so the final rename stays on one filesystem
    async fn download(&self, url: &str) -> Result<PathBuf, UpdateError> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(UpdateError::Download)?
            .bytes()
            .await
            .map_err(UpdateError::Download)?;
        if bytes.is_empty() {
            return Err(UpdateError::EmptyBinary);
        }

        let dir = self.exe.parent().unwrap_or_else(|| Path::new("."));
        let staged = dir.join(format!(".pulse-agent-update-{}", uuid::Uuid::new_v4()));
        let stage_err = |source| UpdateError::Stage {
            path: staged.clone(),
            source,
        };

        if let Err(e) = tokio::fs::write(&staged, &bytes).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(stage_err(e));
        }

        if let Err(e) = tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755)).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(stage_err(e));
        }

        debug!(path = %staged.display(), size = bytes.len(), "Update staged");
        Ok(staged)
    }

    /// Poll forever, re-reading `auto_update` on every cycle
    pub async fn run(self: Arc<Self>, store: Arc<ConfigStore>) {
        loop {
            let config = match store.load() {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Updater could not load configuration");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            if !config.agent.auto_update || config.agent.metrics_url.trim().is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let pause = match self.check_and_update(&config).await {
                Ok(outcome) => {
                    debug!(?outcome, "Update check finished");
                    POLL_INTERVAL
                }
                Err(e @ UpdateError::Fetch(_)) => {
                    warn!(error = %e, "Version endpoint unreachable");
                    FETCH_BACKOFF
                }
                Err(e) => {
                    error!(error = %e, "Self-update failed, keeping current binary");
                    POLL_INTERVAL
                }
            };
            tokio::time::sleep(pause).await;
        }
    }
}

fn replace_executable(staged: &Path, exe: &Path) -> Result<(), UpdateError> {
    std::fs::rename(staged, exe).map_err(|source| UpdateError::Replace {
        path: exe.to_path_buf(),
        source,
    })
}
