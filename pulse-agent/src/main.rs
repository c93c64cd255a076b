//! Pulse Agent - host and cluster metrics shipper
//!
//! The agent samples host, service, certificate and Kubernetes state on a
//! multi-rate schedule and ships every sample, gzip-compressed and AES-GCM
//! sealed, to a remote collector:
//! - Worker mode (default): scheduler + transport + self-updater in-process
//! - Daemon mode (`-d`): single-instance supervisor restarting the worker

mod config;
mod metrics;
mod scheduler;
mod supervisor;
mod transport;
mod updater;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ConfigStore, DEFAULT_CONFIG_PATH};
use metrics::Samplers;
use scheduler::Scheduler;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use transport::Transport;
use updater::{SelfUpdater, LOCAL_VERSION};

#[derive(Parser, Debug)]
#[command(name = "pulse-agent", about = "Host and cluster metrics agent")]
struct Cli {
    /// Run as a supervisor that keeps a single worker alive
    #[arg(short, long)]
    daemon: bool,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the local version marker and exit
    #[arg(long)]
    version_check: bool,
}

impl Cli {
    /// Command line for the supervised worker, rebuilt so the daemon flag never leaks through
    fn worker_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("--config"),
            self.config.clone().into_os_string(),
            OsString::from("--log-level"),
            OsString::from(&self.log_level),
        ]
    }
}

/// Worker state: shared config, samplers and the outbound pipeline
struct Agent {
    config: Arc<ConfigStore>,
    scheduler: Arc<Scheduler>,
    updater: Arc<SelfUpdater>,
}

impl Agent {
    fn new(config_path: PathBuf) -> Result<Self> {
        let config = Arc::new(ConfigStore::new(config_path));
        let current = config.load().context("Failed to load configuration")?;

        if current.is_configured() {
            info!(
                project = %current.agent.project,
                collector = %current.metrics_endpoint(),
                "Configuration loaded"
            );
        } else {
            warn!(
                path = %config.path().display(),
                "Configuration incomplete, set agent.metrics_url and encrypted to start sending"
            );
        }

        let transport =
            Transport::new(current.agent.max_inflight_sends).context("Failed to build HTTP transport")?;
        let samplers = Arc::new(Samplers::new(LOCAL_VERSION));
        let scheduler = Arc::new(Scheduler::new(config.clone(), samplers, transport));
        let updater = Arc::new(SelfUpdater::for_current_process().context("Failed to initialize self-updater")?);

        Ok(Self {
            config,
            scheduler,
            updater,
        })
    }

    async fn run(self) -> Result<()> {
        tokio::spawn(self.updater.clone().run(self.config.clone()));

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            _ = self.scheduler.clone().run() => {}
            _ = sigterm.recv() => info!("SIGTERM received, stopping"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, stopping"),
        }
        Ok(())
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version_check {
        println!("{LOCAL_VERSION}");
        return Ok(());
    }

    init_logging(&cli.log_level);

    if cli.daemon {
        info!(version = LOCAL_VERSION, "Pulse supervisor starting");
        let supervisor = Supervisor::for_current_process(cli.worker_args()).context("Failed to create supervisor")?;
        if let Err(e) = supervisor.run().await {
            error!(error = %e, "Supervisor terminated with error");
            return Err(e.into());
        }
        return Ok(());
    }

    info!(version = LOCAL_VERSION, config = %cli.config.display(), "Pulse agent starting");

    let agent = Agent::new(cli.config).context("Failed to create agent")?;
    agent.run().await.context("Agent execution failed")?;

    info!("Pulse agent stopped");
    Ok(())
}
