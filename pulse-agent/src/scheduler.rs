//! Multi-rate sampling driven by a 1-second tick
//!
//! Tier membership is derived from the wall clock alone:
//! - fast (every 15s): hardware, heartbeat, nginx, harbor
//! - medium (second 0 of each minute): Kubernetes containers and controllers
//! - slow (second 0 when minute % 5 == 0): SSL certificates
//!
//! Each fired tick is dispatched onto its own task so a slow sampler never
//! delays the next tick.

use chrono::{Local, Timelike};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::config::{AgentConfig, ConfigStore, MetricsSection, CONFIG_CACHE_TTL};
use crate::metrics::{Sample, SamplerError, Samplers, SourceKind};
use crate::transport::Transport;

pub const TICK: Duration = Duration::from_secs(1);
pub const FAST_INTERVAL_SECS: u32 = 15;
pub const SLOW_INTERVAL_MINUTES: u32 = 5;

/// Tiers firing on a given tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSet {
    pub fast: bool,
    pub medium: bool,
    pub slow: bool,
}

impl TierSet {
    pub fn due(minute: u32, second: u32) -> Self {
        let top_of_minute = second == 0;
        Self {
            fast: second % FAST_INTERVAL_SECS == 0,
            medium: top_of_minute,
            slow: top_of_minute && minute % SLOW_INTERVAL_MINUTES == 0,
        }
    }

    pub fn at<T: Timelike>(time: &T) -> Self {
        Self::due(time.minute(), time.second())
    }

    pub fn is_empty(&self) -> bool {
        !(self.fast || self.medium || self.slow)
    }
}

/// Sources to sample for the fired tiers, in execution order
pub fn plan(due: TierSet, metrics: &MetricsSection) -> Vec<SourceKind> {
    let mut sources = Vec::new();
    if due.fast {
        sources.extend([SourceKind::Hardware, SourceKind::Heartbeat]);
        if metrics.nginx.enable {
            sources.push(SourceKind::Nginx);
        }
        if metrics.harbor.enable {
            sources.push(SourceKind::Harbor);
        }
    }
    if due.medium && metrics.k8s.enable {
        sources.extend([SourceKind::K8sContainer, SourceKind::K8sController]);
    }
    if due.slow && metrics.ssl.enable {
        sources.push(SourceKind::Ssl);
    }
    sources
}

pub struct Scheduler {
    config: Arc<ConfigStore>,
    samplers: Arc<Samplers>,
    transport: Transport,
    last_unconfigured_warning: Mutex<Option<Instant>>,
}

impl Scheduler {
    pub fn new(config: Arc<ConfigStore>, samplers: Arc<Samplers>, transport: Transport) -> Self {
        Self {
            config,
            samplers,
            transport,
            last_unconfigured_warning: Mutex::new(None),
        }
    }

    /// Tick forever; callers stop it by dropping the future
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let due = TierSet::at(&Local::now());
            if due.is_empty() {
                continue;
            }
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move { scheduler.dispatch(due).await });
        }
    }

    /// Sample every source of the fired tiers sequentially and fan the sends out
    pub async fn dispatch(&self, due: TierSet) {
        let config = match self.config.load() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to load configuration, skipping tick");
                return;
            }
        };

        if !config.is_configured() {
            self.warn_unconfigured();
            return;
        }

        let endpoint = config.metrics_endpoint();
        let key = config.encryption_key().to_vec();

        for kind in plan(due, &config.metrics) {
            match self.sample(kind, &config).await {
                Ok(sample) => {
                    self.transport
                        .dispatch(endpoint.clone(), key.clone(), config.agent.project.clone(), sample);
                }
                Err(e) => warn!(source = %kind, error = %e, "Sampler failed, skipping send"),
            }
        }
        debug!(?due, free_send_slots = self.transport.available_slots(), "Tick dispatched");
    }

    async fn sample(&self, kind: SourceKind, config: &AgentConfig) -> Result<Sample, SamplerError> {
        match kind {
            SourceKind::Hardware => self.samplers.hardware().await,
            SourceKind::Heartbeat => self.samplers.heartbeat(config),
            SourceKind::Nginx => self.samplers.nginx(config).await,
            SourceKind::Harbor => self.samplers.harbor().await,
            SourceKind::Ssl => self.samplers.ssl(config).await,
            SourceKind::K8sContainer => self.samplers.k8s_containers(config).await,
            SourceKind::K8sController => self.samplers.k8s_controllers(config).await,
        }
    }

    fn warn_unconfigured(&self) {
        let mut last = self.last_unconfigured_warning.lock();
        if last.map_or(true, |at| at.elapsed() >= CONFIG_CACHE_TTL) {
            warn!(
                path = %self.config.path().display(),
                "metrics_url or encryption key not set, sending is paused"
            );
            *last = Some(Instant::now());
        }
    }
}
