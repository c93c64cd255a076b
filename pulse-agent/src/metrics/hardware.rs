//! Host hardware sampler
//!
//! CPU usage is a delta between two `/proc/stat` snapshots. Memory, load and
//! disk figures are point-in-time reads from `/proc/meminfo`, `/proc/loadavg`
//! and `df -B1 /`. Static facts (core count, CPU model, OS and kernel version)
//! come from `sysinfo` once at startup.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::process::Command;
use tracing::debug;

use super::SamplerError;

/// A baseline older than this is discarded and the cold-start estimate is used
pub const BASELINE_MAX_AGE: Duration = Duration::from_secs(60);

/// One row of the `hard` source
#[derive(Debug, Clone, Serialize)]
pub struct HostRecord {
    pub cpu_percent: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,
    pub disk_used_percent: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub memory_buffered: u64,
    pub memory_cached: u64,
    pub memory_shared: u64,
    pub memory_available: u64,
    pub memory_used_percent: f64,
    pub cpu_load_1: f64,
    pub cpu_load_5: f64,
    pub cpu_load_15: f64,
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub cpu_count: usize,
    pub cpu_model: String,
    pub os_version: String,
    pub kernel_version: String,
}

/// Aggregate jiffies from the first `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub total: u64,
    pub idle: u64,
}

impl CpuSnapshot {
    /// total = user + nice + system + idle
    pub fn parse(proc_stat: &str) -> Option<Self> {
        let line = proc_stat.lines().next()?;
        let mut fields = line.split_whitespace();
        if fields.next()? != "cpu" {
            return None;
        }
        let values: Vec<u64> = fields.take(4).map(|f| f.parse().unwrap_or(0)).collect();
        if values.len() < 4 {
            return None;
        }
        Some(Self {
            total: values.iter().sum(),
            idle: values[3],
        })
    }
}

/// Usage since boot, used when no usable baseline exists
pub fn cold_start_percent(snapshot: CpuSnapshot) -> f64 {
    if snapshot.total == 0 {
        return 0.0;
    }
    let busy = snapshot.total.saturating_sub(snapshot.idle);
    clamp_percent(100.0 * busy as f64 / snapshot.total as f64)
}

/// Usage over the interval between two snapshots
pub fn delta_percent(previous: CpuSnapshot, current: CpuSnapshot) -> f64 {
    let total_delta = current.total.saturating_sub(previous.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle.saturating_sub(previous.idle);
    let busy = total_delta.saturating_sub(idle_delta);
    clamp_percent(100.0 * busy as f64 / total_delta as f64)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

struct Baseline {
    snapshot: CpuSnapshot,
    taken_at: Instant,
}

/// Keeps the previous `/proc/stat` snapshot between samples
#[derive(Default)]
pub struct CpuTracker {
    baseline: Mutex<Option<Baseline>>,
}

impl CpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` as the new baseline and return the usage percentage
    pub fn observe(&self, current: CpuSnapshot, now: Instant) -> f64 {
        let mut baseline = self.baseline.lock();
        let previous = baseline.replace(Baseline {
            snapshot: current,
            taken_at: now,
        });

        match previous {
            Some(prev)
                if now.saturating_duration_since(prev.taken_at) <= BASELINE_MAX_AGE
                    && current.total >= prev.snapshot.total =>
            {
                delta_percent(prev.snapshot, current)
            }
            _ => cold_start_percent(current),
        }
    }
}

/// Memory figures in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    pub buffered: u64,
    pub cached: u64,
    pub shared: u64,
    pub available: u64,
}

impl MemInfo {
    pub fn parse(meminfo: &str) -> Self {
        let mut info = MemInfo::default();
        for line in meminfo.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            // /proc/meminfo reports kB
            let bytes = value.parse::<u64>().unwrap_or(0) * 1024;
            match key {
                "MemTotal:" => info.total = bytes,
                "MemFree:" => info.free = bytes,
                "Buffers:" => info.buffered = bytes,
                "Cached:" => info.cached = bytes,
                "Shmem:" => info.shared = bytes,
                "MemAvailable:" => info.available = bytes,
                _ => {}
            }
        }
        info
    }

    /// total - free - buffers - cached, clamped at zero when the kernel's
    /// counters are momentarily inconsistent
    pub fn used(&self) -> u64 {
        self.total
            .saturating_sub(self.free)
            .saturating_sub(self.buffered)
            .saturating_sub(self.cached)
    }

    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used() as f64 / self.total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

impl DiskUsage {
    /// Parse the data line of `df -B1 /`
    pub fn parse_df(output: &str) -> Option<Self> {
        let line = output.lines().nth(1)?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return None;
        }
        let total: u64 = fields[1].parse().ok()?;
        let used: u64 = fields[2].parse().ok()?;
        let free: u64 = fields[3].parse().ok()?;
        let used_percent = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Some(Self {
            total,
            used,
            free,
            used_percent,
        })
    }
}

pub fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut fields = content.split_whitespace().map(|f| f.parse::<f64>());
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(one)), Some(Ok(five)), Some(Ok(fifteen))) => Some([one, five, fifteen]),
        _ => None,
    }
}

/// Facts that do not change while the agent runs
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub cpu_count: usize,
    pub cpu_model: String,
    pub os_version: String,
    pub kernel_version: String,
}

impl HostFacts {
    pub fn discover() -> Self {
        let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));
        let cpus = sys.cpus();
        Self {
            cpu_count: cpus.len(),
            cpu_model: cpus
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_default(),
            os_version: System::long_os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
        }
    }
}

pub struct HardwareSampler {
    proc_root: PathBuf,
    cpu: CpuTracker,
    facts: HostFacts,
}

impl HardwareSampler {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            cpu: CpuTracker::new(),
            facts: HostFacts::discover(),
        }
    }

    pub async fn collect(&self, host_name: String) -> Result<HostRecord, SamplerError> {
        let stat = self.read_proc("stat").await?;
        let snapshot = CpuSnapshot::parse(&stat).ok_or_else(|| SamplerError::Format("/proc/stat".into()))?;
        let cpu_percent = self.cpu.observe(snapshot, Instant::now());

        let disk = Self::disk_usage().await?;
        let memory = MemInfo::parse(&self.read_proc("meminfo").await?);
        let [load1, load5, load15] = parse_loadavg(&self.read_proc("loadavg").await?)
            .ok_or_else(|| SamplerError::Format("/proc/loadavg".into()))?;

        debug!(cpu_percent, memory_used = memory.used(), "Hardware sample taken");

        Ok(HostRecord {
            cpu_percent,
            disk_total: disk.total,
            disk_used: disk.used,
            disk_free: disk.free,
            disk_used_percent: disk.used_percent,
            memory_total: memory.total,
            memory_used: memory.used(),
            memory_free: memory.free,
            memory_buffered: memory.buffered,
            memory_cached: memory.cached,
            memory_shared: memory.shared,
            memory_available: memory.available,
            memory_used_percent: memory.used_percent(),
            cpu_load_1: load1,
            cpu_load_5: load5,
            cpu_load_15: load15,
            host_name,
            cpu_count: self.facts.cpu_count,
            cpu_model: self.facts.cpu_model.clone(),
            os_version: self.facts.os_version.clone(),
            kernel_version: self.facts.kernel_version.clone(),
        })
    }

    async fn read_proc(&self, name: &str) -> Result<String, SamplerError> {
        let path = self.proc_root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SamplerError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    async fn disk_usage() -> Result<DiskUsage, SamplerError> {
        let output = Command::new("df")
            .args(["-B1", "/"])
            .output()
            .await
            .map_err(|e| SamplerError::command("df -B1 /", e))?;
        if !output.status.success() {
            return Err(SamplerError::command(
                "df -B1 /",
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        DiskUsage::parse_df(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| SamplerError::Format("df -B1 /".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_parse() {
        let stat = "cpu  100 20 30 850 5 0 0 0 0 0\ncpu0 50 10 15 425 2 0 0 0 0 0\n";
        let snap = CpuSnapshot::parse(stat).unwrap();
        assert_eq!(snap, CpuSnapshot { total: 1000, idle: 850 });
        assert!(CpuSnapshot::parse("intr 1 2 3").is_none());
    }

    #[test]
    fn test_delta_formula() {
        let first = CpuSnapshot { total: 1000, idle: 800 };
        let second = CpuSnapshot { total: 1200, idle: 950 };
        // 100 * ((200) - (150)) / 200
        assert!((delta_percent(first, second) - 25.0).abs() < f64::EPSILON);
        assert_eq!(delta_percent(first, first), 0.0);
    }

    #[test]
    fn test_delta_is_clamped() {
        // Idle grew more than total: inconsistent counters
        let first = CpuSnapshot { total: 1000, idle: 800 };
        let second = CpuSnapshot { total: 1010, idle: 900 };
        assert_eq!(delta_percent(first, second), 0.0);
    }

    #[test]
    fn test_tracker_cold_start_then_delta() {
        let tracker = CpuTracker::new();
        let t0 = Instant::now();

        let first = tracker.observe(CpuSnapshot { total: 1000, idle: 750 }, t0);
        assert!((first - 25.0).abs() < 1e-9);

        let second = tracker.observe(
            CpuSnapshot { total: 1100, idle: 840 },
            t0 + Duration::from_secs(15),
        );
        assert!((second - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_resets_after_gap() {
        let tracker = CpuTracker::new();
        let t0 = Instant::now();
        tracker.observe(CpuSnapshot { total: 1000, idle: 750 }, t0);

        // More than a minute later the baseline is stale: cold-start formula
        let later = CpuSnapshot { total: 2000, idle: 1000 };
        let usage = tracker.observe(later, t0 + Duration::from_secs(61));
        assert!((usage - cold_start_percent(later)).abs() < 1e-9);
        assert!((usage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_meminfo_used_clamps() {
        let info = MemInfo::parse(
            "MemTotal:  1000 kB\nMemFree:  600 kB\nBuffers:  300 kB\nCached:  400 kB\nShmem: 10 kB\nMemAvailable: 900 kB\n",
        );
        assert_eq!(info.total, 1000 * 1024);
        assert_eq!(info.shared, 10 * 1024);
        assert_eq!(info.used(), 0);
        assert_eq!(info.used_percent(), 0.0);

        let normal = MemInfo::parse("MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 200 kB\n");
        assert_eq!(normal.used(), 500 * 1024);
        assert!((normal.used_percent() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_df() {
        let output = "Filesystem        1B-blocks        Used   Available Use% Mounted on\n\
                      /dev/sda1      100000000000 25000000000 75000000000  25% /\n";
        let disk = DiskUsage::parse_df(output).unwrap();
        assert_eq!(disk.total, 100_000_000_000);
        assert_eq!(disk.free, 75_000_000_000);
        assert!((disk.used_percent - 25.0).abs() < 1e-9);
        assert!(DiskUsage::parse_df("Filesystem only\n").is_none());
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.41 0.30 1/345 12345\n"), Some([0.52, 0.41, 0.30]));
        assert_eq!(parse_loadavg("garbage"), None);
    }
}
