//! Metric sources for the pulse agent
//!
//! Every source produces a list of flat records tagged with a `SourceKind`:
//! - `hard`: CPU, memory, disk and load of the host
//! - `heart`: liveness heartbeat
//! - `nginx` / `harbor`: service and connection statistics
//! - `ssl`: certificate expiry per discovered domain
//! - `k8s` / `k8sController`: cluster workload usage
//!
//! Expensive sub-results (hostname, CPU baseline, cluster clients) are cached
//! inside `Samplers`, which is shared by the scheduler.

pub mod hardware;
pub mod k8s;
pub mod network;
pub mod ssl;

use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;
use hardware::{HardwareSampler, HostRecord};
use k8s::{ContainerResource, ControllerResource, KubeClients};
use network::{HarborRecord, NginxRecord};
use ssl::DomainRecord;

pub const HOSTNAME_TTL: Duration = Duration::from_secs(300);

/// Failure of a single source; logged and skipped for the current cycle
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Unexpected output format from {0}")]
    Format(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Kubernetes configuration error: {0}")]
    KubeConfig(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Sampler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SamplerError {
    pub fn command(command: &str, reason: impl fmt::Display) -> Self {
        SamplerError::Command {
            command: command.to_string(),
            reason: reason.to_string().trim().to_string(),
        }
    }
}

/// Compile a fixed pattern once; a bad pattern fails every later lookup the same way
pub(crate) fn compiled(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex, SamplerError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| SamplerError::Format(format!("pattern `{pattern}`: {e}")))
}

/// Wire tag of each metric source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SourceKind {
    #[serde(rename = "hard")]
    Hardware,
    #[serde(rename = "heart")]
    Heartbeat,
    #[serde(rename = "nginx")]
    Nginx,
    #[serde(rename = "harbor")]
    Harbor,
    #[serde(rename = "ssl")]
    Ssl,
    #[serde(rename = "k8s")]
    K8sContainer,
    #[serde(rename = "k8sController")]
    K8sController,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Hardware => "hard",
            SourceKind::Heartbeat => "heart",
            SourceKind::Nginx => "nginx",
            SourceKind::Harbor => "harbor",
            SourceKind::Ssl => "ssl",
            SourceKind::K8sContainer => "k8s",
            SourceKind::K8sController => "k8sController",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records produced by one sampler run, serialized as a bare JSON array
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Sample {
    Hardware(Vec<HostRecord>),
    Heartbeat(Vec<HeartbeatRecord>),
    Nginx(Vec<NginxRecord>),
    Harbor(Vec<HarborRecord>),
    Ssl(Vec<DomainRecord>),
    K8sContainer(Vec<ContainerResource>),
    K8sController(Vec<ControllerResource>),
}

impl Sample {
    pub fn kind(&self) -> SourceKind {
        match self {
            Sample::Hardware(_) => SourceKind::Hardware,
            Sample::Heartbeat(_) => SourceKind::Heartbeat,
            Sample::Nginx(_) => SourceKind::Nginx,
            Sample::Harbor(_) => SourceKind::Harbor,
            Sample::Ssl(_) => SourceKind::Ssl,
            Sample::K8sContainer(_) => SourceKind::K8sContainer,
            Sample::K8sController(_) => SourceKind::K8sController,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Sample::Hardware(r) => r.len(),
            Sample::Heartbeat(r) => r.len(),
            Sample::Nginx(r) => r.len(),
            Sample::Harbor(r) => r.len(),
            Sample::Ssl(r) => r.len(),
            Sample::K8sContainer(r) => r.len(),
            Sample::K8sController(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One row of the `heart` source
///
/// `is_active` is always 1: the record only proves the process is scheduling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub is_active: u8,
    pub project: String,
    pub hostname: String,
    pub version: f64,
}

/// Hostname resolved from `/etc/hostname`, refreshed every five minutes
pub struct HostnameCache {
    source: PathBuf,
    ttl: Duration,
    cached: RwLock<Option<(String, Instant)>>,
}

impl HostnameCache {
    pub fn new() -> Self {
        Self::with_source(PathBuf::from("/etc/hostname"), HOSTNAME_TTL)
    }

    pub fn with_source(source: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            source: source.into(),
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Result<String, SamplerError> {
        if let Some((name, at)) = self.cached.read().as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(name.clone());
            }
        }

        let mut cached = self.cached.write();
        if let Some((name, at)) = cached.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(name.clone());
            }
        }

        let name = self.resolve()?;
        debug!(hostname = %name, "Hostname refreshed");
        *cached = Some((name.clone(), Instant::now()));
        Ok(name)
    }

    fn resolve(&self) -> Result<String, SamplerError> {
        if let Ok(content) = std::fs::read_to_string(&self.source) {
            let name = content.trim();
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
        hostname::get()
            .map(|name| name.to_string_lossy().trim().to_string())
            .map_err(|source| SamplerError::Io {
                path: self.source.display().to_string(),
                source,
            })
    }
}

impl Default for HostnameCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime context shared by every source
pub struct Samplers {
    hostname: HostnameCache,
    hardware: HardwareSampler,
    kube: KubeClients,
    version: f64,
}

impl Samplers {
    pub fn new(version: &str) -> Self {
        Self {
            hostname: HostnameCache::new(),
            hardware: HardwareSampler::new(),
            kube: KubeClients::new(),
            version: numeric_version(version),
        }
    }

    pub fn hostname(&self) -> Result<String, SamplerError> {
        self.hostname.get()
    }

    pub async fn hardware(&self) -> Result<Sample, SamplerError> {
        let record = self.hardware.collect(self.hostname()?).await?;
        Ok(Sample::Hardware(vec![record]))
    }

    pub fn heartbeat(&self, config: &AgentConfig) -> Result<Sample, SamplerError> {
        Ok(Sample::Heartbeat(vec![HeartbeatRecord {
            is_active: 1,
            project: config.agent.project.clone(),
            hostname: self.hostname()?,
            version: self.version,
        }]))
    }

    pub async fn nginx(&self, config: &AgentConfig) -> Result<Sample, SamplerError> {
        let record = network::collect_nginx(&config.metrics.nginx.service, self.hostname()?).await;
        Ok(Sample::Nginx(vec![record]))
    }

    pub async fn harbor(&self) -> Result<Sample, SamplerError> {
        let record = network::collect_harbor(self.hostname()?).await;
        Ok(Sample::Harbor(vec![record]))
    }

    pub async fn ssl(&self, config: &AgentConfig) -> Result<Sample, SamplerError> {
        Ok(Sample::Ssl(ssl::collect(&config.metrics.ssl).await?))
    }

    pub async fn k8s_containers(&self, config: &AgentConfig) -> Result<Sample, SamplerError> {
        let client = self.kube.client(&config.metrics.k8s.config_path).await?;
        Ok(Sample::K8sContainer(k8s::collect_containers(client).await?))
    }

    pub async fn k8s_controllers(&self, config: &AgentConfig) -> Result<Sample, SamplerError> {
        let client = self.kube.client(&config.metrics.k8s.config_path).await?;
        Ok(Sample::K8sController(k8s::collect_controllers(client).await?))
    }
}

/// Heartbeat carries the version as a number; non-numeric versions report 0
fn numeric_version(version: &str) -> f64 {
    version.trim().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_compiled_pattern_is_cached() {
        static GOOD: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
        let first = compiled(&GOOD, r"^\d+$").unwrap();
        let second = compiled(&GOOD, r"^\d+$").unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(first.is_match("42"));
    }

    #[test]
    fn test_invalid_pattern_is_format_error() {
        static BAD: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
        assert!(matches!(compiled(&BAD, r"(unclosed"), Err(SamplerError::Format(_))));
        assert!(matches!(compiled(&BAD, r"(unclosed"), Err(SamplerError::Format(_))));
    }

    #[test]
    fn test_source_kind_tags() {
        let tags: Vec<String> = [
            SourceKind::Hardware,
            SourceKind::Heartbeat,
            SourceKind::Nginx,
            SourceKind::Harbor,
            SourceKind::Ssl,
            SourceKind::K8sContainer,
            SourceKind::K8sController,
        ]
        .iter()
        .map(|kind| serde_json::to_value(kind).unwrap().as_str().unwrap().to_string())
        .collect();
        assert_eq!(tags, ["hard", "heart", "nginx", "harbor", "ssl", "k8s", "k8sController"]);
        assert_eq!(SourceKind::K8sController.to_string(), "k8sController");
    }

    #[test]
    fn test_heartbeat_shape() {
        let sample = Sample::Heartbeat(vec![HeartbeatRecord {
            is_active: 1,
            project: "shop".into(),
            hostname: "web-01".into(),
            version: 1.2,
        }]);
        assert_eq!(sample.kind(), SourceKind::Heartbeat);
        assert_eq!(
            serde_json::to_value(&sample).unwrap(),
            serde_json::json!([{ "isActive": 1, "project": "shop", "hostname": "web-01", "version": 1.2 }])
        );
    }

    #[test]
    fn test_empty_sample_serializes_as_empty_array() {
        let sample = Sample::Ssl(Vec::new());
        assert!(sample.is_empty());
        assert_eq!(serde_json::to_string(&sample).unwrap(), "[]");
    }

    #[test]
    fn test_hostname_cached_within_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node-a").unwrap();
        let cache = HostnameCache::with_source(file.path(), Duration::from_secs(60));
        assert_eq!(cache.get().unwrap(), "node-a");

        std::fs::write(file.path(), "node-b\n").unwrap();
        assert_eq!(cache.get().unwrap(), "node-a");
    }

    #[test]
    fn test_hostname_refreshed_after_ttl() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "node-a\n").unwrap();
        let cache = HostnameCache::with_source(file.path(), Duration::from_millis(20));
        assert_eq!(cache.get().unwrap(), "node-a");

        std::fs::write(file.path(), "node-b\n").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get().unwrap(), "node-b");
    }

    #[test]
    fn test_hostname_falls_back_to_system() {
        let cache = HostnameCache::with_source("/nonexistent/hostname", HOSTNAME_TTL);
        assert!(!cache.get().unwrap().is_empty());
    }

    #[test]
    fn test_numeric_version() {
        assert_eq!(numeric_version("1.5"), 1.5);
        assert_eq!(numeric_version("dev"), 0.0);
    }
}
