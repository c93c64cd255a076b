//! Web-server and connection statistics
//!
//! Provides:
//! - Service state via `systemctl is-active`
//! - Logged-in terminal sessions via `who -q`
//! - Per-protocol socket counts and TCP sub-states via `ss -s`
//!
//! Every command failure degrades to zeroed fields; only the hostname lookup
//! can fail a sample.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{compiled, SamplerError};

/// One row of the `nginx` source
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NginxRecord {
    pub is_run: u8,
    pub re_total: u64,
    pub login_user_count: u32,
    pub raw_total: u64,
    #[serde(rename = "udptotal")]
    pub udp_total: u64,
    pub tcp_total: u64,
    #[serde(rename = "totaltcp")]
    pub total_tcp: u64,
    pub inet_total: u64,
    pub frag_total: u64,
    pub tcp_estab: u64,
    pub tcp_closed: u64,
    pub tcp_orphaned: u64,
    pub tcp_timewait: u64,
    pub host_name: String,
}

/// One row of the `harbor` source
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborRecord {
    pub host_name: String,
    pub login_user_count: u32,
}

/// Counters extracted from `ss -s`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketSummary {
    pub total: u64,
    pub raw: u64,
    pub udp: u64,
    pub tcp: u64,
    pub inet: u64,
    pub frag: u64,
    pub tcp_all_states: u64,
    pub tcp_estab: u64,
    pub tcp_closed: u64,
    pub tcp_orphaned: u64,
    pub tcp_timewait: u64,
}

fn total_pattern() -> Result<&'static Regex, SamplerError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    compiled(&RE, r"Total:\s+(\d+)")
}

fn protocol_pattern() -> Result<&'static Regex, SamplerError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    compiled(&RE, r"(?m)^(\w+)\s+(\d+)")
}

fn tcp_states_pattern() -> Result<&'static Regex, SamplerError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    compiled(
        &RE,
        r"TCP:\s+(\d+)\s+\(estab (\d+),\s+closed (\d+),\s+orphaned (\d+),\s+timewait (\d+)",
    )
}

impl SocketSummary {
    pub fn parse(output: &str) -> Result<Self, SamplerError> {
        let mut summary = SocketSummary::default();
        let number = |s: &str| s.parse::<u64>().unwrap_or(0);

        if let Some(caps) = total_pattern()?.captures(output) {
            summary.total = number(&caps[1]);
        }

        for caps in protocol_pattern()?.captures_iter(output) {
            let value = number(&caps[2]);
            match &caps[1] {
                "RAW" => summary.raw = value,
                "UDP" => summary.udp = value,
                "TCP" => summary.tcp = value,
                "INET" => summary.inet = value,
                "FRAG" => summary.frag = value,
                _ => {}
            }
        }

        if let Some(caps) = tcp_states_pattern()?.captures(output) {
            summary.tcp_all_states = number(&caps[1]);
            summary.tcp_estab = number(&caps[2]);
            summary.tcp_closed = number(&caps[3]);
            summary.tcp_orphaned = number(&caps[4]);
            summary.tcp_timewait = number(&caps[5]);
        }

        Ok(summary)
    }
}

/// `who -q` prints the names on the first line and `# users=N` on the second
pub fn parse_who_count(output: &str) -> u32 {
    output
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|field| field.strip_prefix("users="))
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

pub async fn service_is_active(service: &str) -> bool {
    match Command::new("systemctl").args(["is-active", service]).output().await {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!(service, error = %e, "systemctl unavailable");
            false
        }
    }
}

pub async fn login_user_count() -> u32 {
    match Command::new("who").arg("-q").output().await {
        Ok(output) if output.status.success() => parse_who_count(&String::from_utf8_lossy(&output.stdout)),
        Ok(_) => 0,
        Err(e) => {
            debug!(error = %e, "who -q failed");
            0
        }
    }
}

pub async fn socket_summary() -> SocketSummary {
    match Command::new("ss").arg("-s").output().await {
        Ok(output) if output.status.success() => {
            SocketSummary::parse(&String::from_utf8_lossy(&output.stdout)).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to parse ss -s output");
                SocketSummary::default()
            })
        }
        Ok(_) => SocketSummary::default(),
        Err(e) => {
            debug!(error = %e, "ss -s failed");
            SocketSummary::default()
        }
    }
}

pub async fn collect_nginx(service: &str, host_name: String) -> NginxRecord {
    let (active, logins, sockets) = tokio::join!(service_is_active(service), login_user_count(), socket_summary());

    NginxRecord {
        is_run: u8::from(active),
        re_total: sockets.total,
        login_user_count: logins,
        raw_total: sockets.raw,
        udp_total: sockets.udp,
        tcp_total: sockets.tcp,
        total_tcp: sockets.tcp_all_states,
        inet_total: sockets.inet,
        frag_total: sockets.frag,
        tcp_estab: sockets.tcp_estab,
        tcp_closed: sockets.tcp_closed,
        tcp_orphaned: sockets.tcp_orphaned,
        tcp_timewait: sockets.tcp_timewait,
        host_name,
    }
}

pub async fn collect_harbor(host_name: String) -> HarborRecord {
    HarborRecord {
        host_name,
        login_user_count: login_user_count().await,
    }
}
