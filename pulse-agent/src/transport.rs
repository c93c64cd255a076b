//! Sealed sample delivery
//!
//! A sample is wrapped in an envelope, serialized to JSON, gzip-compressed and
//! encrypted with AES-GCM (random 12-byte nonce prepended to the ciphertext).
//! The resulting blob is POSTed to `<metrics_url>/metrics_data`. Delivery is
//! fire-and-forget: failures are logged and the sample is dropped.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics::{Sample, SourceKind};

pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const NONCE_LEN: usize = 12;

type Aes192Gcm = AesGcm<Aes192, U12>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Gzip stream error: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("AES-GCM encryption failed")]
    Encrypt,

    #[error("AES-GCM authentication failed")]
    Decrypt,

    #[error("Payload of {0} bytes is shorter than the nonce")]
    Truncated(usize),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collector responded with {0}")]
    Status(reqwest::StatusCode),
}

/// Wrapper sent for every sample
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub project: &'a str,
    pub data: &'a T,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub source: SourceKind,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    pub fn new(project: &'a str, source: SourceKind, data: &'a T) -> Self {
        Self {
            project,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            source,
        }
    }
}

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl Cipher {
    fn new(key: &[u8]) -> Result<Self, TransportError> {
        let invalid = |_| TransportError::InvalidKey(key.len());
        match key.len() {
            16 => Ok(Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?)),
            24 => Ok(Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?)),
            32 => Ok(Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?)),
            other => Err(TransportError::InvalidKey(other)),
        }
    }

    fn encrypt(&self, nonce: &Nonce<U12>, plaintext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        match self {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes192(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        }
    }

    fn decrypt(&self, nonce: &Nonce<U12>, ciphertext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes192(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(TransportError::Compression)?;
    encoder.finish().map_err(TransportError::Compression)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .map_err(TransportError::Compression)?;
    Ok(decoded)
}

/// Encrypt with a fresh nonce; output is `nonce || ciphertext`
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
    let cipher = Cipher::new(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| TransportError::Encrypt)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn decrypt(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, TransportError> {
    let cipher = Cipher::new(key)?;
    if blob.len() < NONCE_LEN {
        return Err(TransportError::Truncated(blob.len()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TransportError::Decrypt)
}

/// JSON → gzip → AES-GCM
pub fn seal<T: Serialize>(key: &[u8], envelope: &Envelope<'_, T>) -> Result<Vec<u8>, TransportError> {
    let raw = serde_json::to_vec(envelope)?;
    let compressed = compress(&raw)?;
    let sealed = encrypt(key, &compressed)?;
    debug!(
        source = %envelope.source,
        raw = raw.len(),
        compressed = compressed.len(),
        encrypted = sealed.len(),
        "Envelope sealed"
    );
    Ok(sealed)
}

/// Inverse of [`seal`], returning the serialized envelope bytes
pub fn open(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, TransportError> {
    decompress(&decrypt(key, blob)?)
}

/// Pooled HTTP client with a cap on concurrently running sends
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    inflight: Arc<Semaphore>,
}

impl Transport {
    pub fn new(max_inflight: usize) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(16)
            .build()?;
        Ok(Self {
            client,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        })
    }

    /// Seal and POST one sample, draining the response body
    pub async fn send(&self, endpoint: &str, key: &[u8], project: &str, sample: &Sample) -> Result<(), TransportError> {
        let envelope = Envelope::new(project, sample.kind(), sample);
        let body = seal(key, &envelope)?;

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        response.bytes().await?;
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        Ok(())
    }

    /// Fire-and-forget send on its own task
    ///
    /// Returns false when the in-flight cap is reached and the sample was dropped.
    pub fn dispatch(&self, endpoint: String, key: Vec<u8>, project: String, sample: Sample) -> bool {
        let permit = match self.inflight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(source = %sample.kind(), "Too many sends in flight, dropping sample");
                return false;
            }
        };

        let transport = self.clone();
        tokio::spawn(async move {
            let kind = sample.kind();
            match transport.send(&endpoint, &key, &project, &sample).await {
                Ok(()) => debug!(source = %kind, records = sample.len(), "Sample delivered"),
                Err(e) => warn!(source = %kind, error = %e, "Failed to deliver sample"),
            }
            drop(permit);
        });
        true
    }

    pub fn available_slots(&self) -> usize {
        self.inflight.available_permits()
    }
}
