//! Configuration store with a short-lived in-memory cache
//!
//! Handles:
//! - YAML config loading (`config.yaml` in the working directory by default)
//! - Commented template generation on first run
//! - 30s cache guarded by a read-mostly lock (double-checked on miss)
//! - Load failures cached for the same window
//! - Encryption key validation

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(30);

/// Valid AES key sizes (AES-128, AES-192, AES-256)
pub const VALID_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

const CONFIG_TEMPLATE: &str = r#"# Pulse agent configuration
agent:

  # Project name, used by the collector to group hosts
  project: ""

  # Collector base URL (samples go to <metrics_url>/metrics_data)
  metrics_url: ""

  # Poll <metrics_url>/version and replace the binary on mismatch
  auto_update: false

# Metric sources, true to enable
metrics:

  # SSL certificate expiry (nginx vhosts, hosts file, domains.txt)
  ssl:
    enable: false

  # Nginx service state and socket summary
  nginx:
    enable: false

  # Harbor host login sessions
  harbor:
    enable: false

  # Kubernetes pod and controller resources
  k8s:
    enable: false
    # Kubeconfig path, relative or absolute; empty uses in-cluster credentials
    config_path: ""

# Payload encryption key, 16, 24 or 32 characters
encrypted: ""
"#;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKey(usize),
    #[error("Config {path} still invalid (cached): {reason}")]
    StillInvalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub metrics: MetricsSection,
    /// Raw AES key material
    pub encrypted: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub project: String,
    pub metrics_url: String,
    pub auto_update: bool,
    /// Upper bound on concurrently running sends
    pub max_inflight_sends: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub ssl: SslSection,
    pub nginx: NginxSection,
    pub harbor: Toggle,
    pub k8s: K8sSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle {
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslSection {
    pub enable: bool,
    pub domains_file: PathBuf,
    pub nginx_conf_dir: PathBuf,
    pub hosts_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NginxSection {
    pub enable: bool,
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sSection {
    pub enable: bool,
    pub config_path: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            project: String::new(),
            metrics_url: String::new(),
            auto_update: false,
            max_inflight_sends: 64,
        }
    }
}

impl Default for SslSection {
    fn default() -> Self {
        Self {
            enable: false,
            domains_file: PathBuf::from("domains.txt"),
            nginx_conf_dir: PathBuf::from("/etc/nginx/conf.d"),
            hosts_file: PathBuf::from("/etc/hosts"),
        }
    }
}

impl Default for NginxSection {
    fn default() -> Self {
        Self {
            enable: false,
            service: "nginx".to_string(),
        }
    }
}

impl AgentConfig {
    /// Parse a YAML document; blank documents yield the default config
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AgentConfig = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// An empty key means "not configured yet"; anything else must be a valid AES key size
    pub fn validate(&self) -> Result<(), ConfigError> {
        let len = self.encrypted.len();
        if len != 0 && !VALID_KEY_LENGTHS.contains(&len) {
            return Err(ConfigError::InvalidKey(len));
        }
        Ok(())
    }

    pub fn encryption_key(&self) -> &[u8] {
        self.encrypted.as_bytes()
    }

    /// Both a collector URL and a key are required before anything is sent
    pub fn is_configured(&self) -> bool {
        !self.agent.metrics_url.trim().is_empty() && !self.encrypted.is_empty()
    }

    pub fn metrics_endpoint(&self) -> String {
        format!("{}/metrics_data", self.base_url())
    }

    pub fn version_endpoint(&self) -> String {
        format!("{}/version", self.base_url())
    }

    pub fn binary_endpoint(&self) -> String {
        format!("{}/agent/agent", self.base_url())
    }

    fn base_url(&self) -> &str {
        self.agent.metrics_url.trim().trim_end_matches('/')
    }
}

struct CachedConfig {
    outcome: Result<Arc<AgentConfig>, String>,
    loaded_at: Instant,
}

/// Cached access to the config file, safe to share across tasks
pub struct ConfigStore {
    path: PathBuf,
    ttl: Duration,
    cache: RwLock<Option<CachedConfig>>,
    physical_reads: AtomicU64,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_ttl(path, CONFIG_CACHE_TTL)
    }

    pub fn with_ttl(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: RwLock::new(None),
            physical_reads: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached config, reloading from disk at most once per TTL window.
    /// A failed load is remembered too, so a broken file is not re-read every tick.
    pub fn load(&self) -> Result<Arc<AgentConfig>, ConfigError> {
        if let Some(result) = self.fresh(&self.cache.read()) {
            return result;
        }

        let mut cache = self.cache.write();
        // Another caller may have reloaded while we waited for the write lock
        if let Some(result) = self.fresh(&cache) {
            return result;
        }

        let result = self.read_from_disk().map(Arc::new);
        *cache = Some(CachedConfig {
            outcome: result.as_ref().map(Arc::clone).map_err(|e| e.to_string()),
            loaded_at: Instant::now(),
        });
        result
    }

    /// Number of times the file system was actually consulted
    pub fn physical_reads(&self) -> u64 {
        self.physical_reads.load(Ordering::Relaxed)
    }

    fn fresh(&self, cache: &Option<CachedConfig>) -> Option<Result<Arc<AgentConfig>, ConfigError>> {
        let cached = cache.as_ref().filter(|cached| cached.loaded_at.elapsed() < self.ttl)?;
        Some(match &cached.outcome {
            Ok(config) => Ok(Arc::clone(config)),
            Err(reason) => Err(ConfigError::StillInvalid {
                path: self.path.clone(),
                reason: reason.clone(),
            }),
        })
    }

    fn read_from_disk(&self) -> Result<AgentConfig, ConfigError> {
        self.physical_reads.fetch_add(1, Ordering::Relaxed);

        if !self.path.exists() {
            info!(path = %self.path.display(), "Config file not found, writing default template");
            self.write_template()?;
            info!("Default config written, fill it in and the agent will pick it up");
            return Ok(AgentConfig::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let config = AgentConfig::from_yaml(&content, &self.path)?;
        debug!(path = %self.path.display(), project = %config.agent.project, "Config reloaded");
        Ok(config)
    }

    fn write_template(&self) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&self.path, CONFIG_TEMPLATE).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
agent:
  project: "prod-eu"
  metrics_url: "https://collector.example.com/"
  auto_update: true
metrics:
  ssl:
    enable: true
  nginx:
    enable: true
  harbor:
    enable: false
  k8s:
    enable: true
    config_path: "admin.conf"
encrypted: "0123456789abcdef"
"#;

    fn store_with(content: &str, ttl: Duration) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, ConfigStore::with_ttl(path, ttl))
    }

    #[test]
    fn test_missing_file_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let store = ConfigStore::new(&path);

        let config = store.load().unwrap();
        assert_eq!(*config, AgentConfig::default());
        assert!(!config.is_configured());
        assert!(path.exists());

        // The template itself must parse back into the default config
        let written = std::fs::read_to_string(&path).unwrap();
        let reparsed = AgentConfig::from_yaml(&written, &path).unwrap();
        assert_eq!(reparsed, AgentConfig::default());
    }

    #[test]
    fn test_full_config_parses() {
        let (_dir, store) = store_with(FULL_CONFIG, CONFIG_CACHE_TTL);
        let config = store.load().unwrap();

        assert_eq!(config.agent.project, "prod-eu");
        assert!(config.agent.auto_update);
        assert!(config.metrics.ssl.enable);
        assert!(config.metrics.k8s.enable);
        assert_eq!(config.metrics.k8s.config_path, "admin.conf");
        assert_eq!(config.metrics.nginx.service, "nginx");
        assert_eq!(config.agent.max_inflight_sends, 64);
        assert!(config.is_configured());
        assert_eq!(config.metrics_endpoint(), "https://collector.example.com/metrics_data");
        assert_eq!(config.version_endpoint(), "https://collector.example.com/version");
        assert_eq!(config.binary_endpoint(), "https://collector.example.com/agent/agent");
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let (_dir, store) = store_with("agent: [not, a, map", CONFIG_CACHE_TTL);
        assert!(matches!(store.load(), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_malformed_config_read_once_per_window() {
        let (dir, store) = store_with("agent: [not, a, map", Duration::from_millis(50));
        assert!(matches!(store.load(), Err(ConfigError::Parse { .. })));
        for _ in 0..9 {
            assert!(matches!(store.load(), Err(ConfigError::StillInvalid { .. })));
        }
        assert_eq!(store.physical_reads(), 1);

        std::fs::write(dir.path().join("config.yaml"), FULL_CONFIG).unwrap();
        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(store.load().unwrap().agent.project, "prod-eu");
        assert_eq!(store.physical_reads(), 2);
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let (_dir, store) = store_with("encrypted: \"short\"\n", CONFIG_CACHE_TTL);
        assert!(matches!(store.load(), Err(ConfigError::InvalidKey(5))));
    }

    #[test]
    fn test_cache_hit_skips_filesystem() {
        let (_dir, store) = store_with(FULL_CONFIG, CONFIG_CACHE_TTL);
        for _ in 0..10 {
            store.load().unwrap();
        }
        assert_eq!(store.physical_reads(), 1);
    }

    #[test]
    fn test_expired_cache_reloads_once_under_contention() {
        let (_dir, store) = store_with(FULL_CONFIG, Duration::from_millis(50));
        store.load().unwrap();
        assert_eq!(store.physical_reads(), 1);

        std::thread::sleep(Duration::from_millis(80));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| store.load().unwrap());
            }
        });
        assert_eq!(store.physical_reads(), 2);
    }
}
