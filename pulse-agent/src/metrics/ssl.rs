//! SSL certificate expiry sampler
//!
//! Candidate domains come from three places, scanned in order and
//! deduplicated by name (first source wins):
//! 1. nginx virtual-host `server_name` directives
//! 2. the hosts file (localhost and `.local` names excluded)
//! 3. an optional user domain list (`domains.txt`)
//!
//! Each domain gets its own task that opens a TLS connection on port 443
//! without validating the chain and reads the leaf certificate's `notAfter`.

use chrono::{DateTime, Utc};
use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use super::{compiled, SamplerError};
use crate::config::SslSection;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const TLS_PORT: u16 = 443;

const DEFAULT_COMMENT: &str = "no comment";
const STATUS_OK: &str = "ok";
const STATUS_UNRESOLVED: &str = "unresolved";

/// One row of the `ssl` source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainRecord {
    pub domain: String,
    pub comment: String,
    pub expiration: Option<DateTime<Utc>>,
    pub days_left: i64,
    pub status: String,
    pub resolve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub domain: String,
    pub comment: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid server name: {0}")]
    InvalidName(String),
    #[error("Connection failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("No peer certificate presented")]
    NoCertificate,
    #[error("Certificate parse error: {0}")]
    Parse(String),
}

#[derive(Clone, Copy)]
enum LineFormat {
    NginxServerName,
    HostsFile,
    DomainList,
}

impl LineFormat {
    fn pattern(self) -> Result<&'static Regex, SamplerError> {
        static NGINX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
        static HOSTS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
        static LIST: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
        match self {
            LineFormat::NginxServerName => compiled(&NGINX, r"server_name\s+([^;]+);[^#]*(#.*)?$"),
            LineFormat::HostsFile => compiled(&HOSTS, r"^\s*\d+\.\d+\.\d+\.\d+\s+([^\s#]+)[^#]*(#.*)?$"),
            LineFormat::DomainList => compiled(&LIST, r"^\s*([^\s#]+)\s*(#.*)?$"),
        }
    }

    fn excludes_local(self) -> bool {
        !matches!(self, LineFormat::NginxServerName)
    }
}

fn is_local_name(domain: &str) -> bool {
    domain == "localhost" || domain.ends_with(".local")
}

/// Extract candidates from one file's content
fn extract_domains(content: &str, format: LineFormat) -> Result<Vec<Candidate>, SamplerError> {
    let pattern = format.pattern()?;
    let mut candidates = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(caps) = pattern.captures(line) else {
            continue;
        };
        let comment = caps
            .get(2)
            .map(|m| m.as_str().trim_start_matches('#').trim())
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_COMMENT)
            .to_string();

        // A server_name directive may list several names; `_` and wildcard
        // or regex names cannot be probed
        for domain in caps[1].split_whitespace() {
            if domain == "_" || domain.starts_with('*') || domain.starts_with('~') {
                continue;
            }
            if format.excludes_local() && is_local_name(domain) {
                continue;
            }
            candidates.push(Candidate {
                domain: domain.to_string(),
                comment: comment.clone(),
            });
        }
    }
    Ok(candidates)
}

/// Ordered, name-unique candidate list
#[derive(Default)]
pub struct DomainSet {
    seen: HashSet<String>,
    candidates: Vec<Candidate>,
}

impl DomainSet {
    pub fn merge(&mut self, candidates: impl IntoIterator<Item = Candidate>) {
        for candidate in candidates {
            if self.seen.insert(candidate.domain.clone()) {
                self.candidates.push(candidate);
            }
        }
    }

    pub fn into_vec(self) -> Vec<Candidate> {
        self.candidates
    }
}

fn collect_conf_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Symlinked directories are not descended into; symlinked files are still read
        if entry.file_type()?.is_dir() {
            collect_conf_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "conf") {
            out.push(path);
        }
    }
    Ok(())
}

fn scan_file(path: &Path, format: LineFormat) -> Result<Vec<Candidate>, SamplerError> {
    match std::fs::read_to_string(path) {
        Ok(content) => extract_domains(&content, format),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read domain source");
            Ok(Vec::new())
        }
    }
}

/// Build the candidate list from every configured source
pub fn discover_domains(config: &SslSection) -> Result<Vec<Candidate>, SamplerError> {
    let mut set = DomainSet::default();

    let mut conf_files = Vec::new();
    match collect_conf_files(&config.nginx_conf_dir, &mut conf_files) {
        Ok(()) => {
            conf_files.sort();
            for file in &conf_files {
                set.merge(scan_file(file, LineFormat::NginxServerName)?);
            }
        }
        Err(e) => debug!(dir = %config.nginx_conf_dir.display(), error = %e, "No nginx vhost directory"),
    }

    set.merge(scan_file(&config.hosts_file, LineFormat::HostsFile)?);

    if config.domains_file.exists() {
        set.merge(scan_file(&config.domains_file, LineFormat::DomainList)?);
    } else {
        debug!(path = %config.domains_file.display(), "Domain list not present");
    }

    Ok(set.into_vec())
}

/// Liveness probe verifier: accepts any chain, still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn probe_connector() -> Result<TlsConnector, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Read the leaf certificate's expiry from `domain:port`
pub async fn certificate_expiration(
    connector: &TlsConnector,
    domain: &str,
    port: u16,
    timeout: Duration,
) -> Result<DateTime<Utc>, ProbeError> {
    let server_name =
        ServerName::try_from(domain.to_string()).map_err(|e| ProbeError::InvalidName(e.to_string()))?;

    let handshake = async {
        let tcp = TcpStream::connect((domain, port)).await?;
        Ok::<_, std::io::Error>(connector.connect(server_name, tcp).await?)
    };
    let tls = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    let (_, session) = tls.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or(ProbeError::NoCertificate)?;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| ProbeError::Parse(e.to_string()))?;
    let not_after = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(not_after, 0).ok_or_else(|| ProbeError::Parse(format!("notAfter out of range: {not_after}")))
}

/// Whole days until `expiration`, truncated toward zero
pub fn days_until(expiration: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiration - now).num_days()
}

fn to_record(candidate: Candidate, probe: Result<DateTime<Utc>, ProbeError>) -> DomainRecord {
    match probe {
        Ok(expiration) => DomainRecord {
            domain: candidate.domain,
            comment: candidate.comment,
            expiration: Some(expiration),
            days_left: days_until(expiration, Utc::now()),
            status: STATUS_OK.to_string(),
            resolve: true,
        },
        Err(e) => {
            debug!(domain = %candidate.domain, error = %e, "Certificate probe failed");
            DomainRecord {
                domain: candidate.domain,
                comment: candidate.comment,
                expiration: None,
                days_left: -1,
                status: STATUS_UNRESOLVED.to_string(),
                resolve: false,
            }
        }
    }
}

/// Probe every candidate concurrently; wall time is bounded by the slowest single probe
pub async fn probe_all(candidates: Vec<Candidate>, port: u16, timeout: Duration) -> Result<Vec<DomainRecord>, SamplerError> {
    let connector = probe_connector().map_err(|e| SamplerError::Tls(e.to_string()))?;

    let handles: Vec<_> = candidates
        .into_iter()
        .map(|candidate| {
            let connector = connector.clone();
            tokio::spawn(async move {
                let probe = certificate_expiration(&connector, &candidate.domain, port, timeout).await;
                to_record(candidate, probe)
            })
        })
        .collect();

    let mut records = Vec::with_capacity(handles.len());
    for joined in futures::future::join_all(handles).await {
        records.push(joined?);
    }
    Ok(records)
}

pub async fn collect(config: &SslSection) -> Result<Vec<DomainRecord>, SamplerError> {
    let config = config.clone();
    let candidates = tokio::task::spawn_blocking(move || discover_domains(&config)).await??;
    debug!(count = candidates.len(), "SSL candidates discovered");
    probe_all(candidates, TLS_PORT, PROBE_TIMEOUT).await
}
