//! HashiCorp Vault backup job.
//!
//! Downloads a Raft snapshot over the Vault HTTP API into a single slot
//! named after the Vault hostname, then CRC-checks the gzip payload before
//! calling the backup good. Restore exists in the API but is intentionally
//! not implemented here.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::{Job, JobError};
use crate::backend::{Backend, BackendError};
use crate::outcome::SlotOutcome;

/// API path of the Raft snapshot endpoint.
const SNAPSHOT_ENDPOINT: &str = "/v1/sys/storage/raft/snapshot";

/// File name the snapshot is stored under inside the slot.
const SNAPSHOT_FILE: &str = "vault.snapshot";

/// CA bundle locations probed when no explicit bundle is configured.
const CA_BUNDLE_PATHS: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",             // Debian / Ubuntu / Gentoo
    "/etc/pki/tls/certs/ca-bundle.crt",               // RHEL 6
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem", // RHEL 7
    "/etc/ssl/ca-bundle.pem",                         // OpenSUSE
    "/etc/pki/tls/cacert.pem",                        // OpenELEC
    "/etc/ssl/cert.pem",                              // Alpine Linux
];

/// Authentication methods supported against Vault.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum VaultAuth {
    /// Static token authentication.
    Token {
        /// The Vault token.
        token: String,
    },
}

/// Options accepted by the vault job.
#[derive(Clone, Debug, Deserialize)]
pub struct VaultOptions {
    /// Base URL of the Vault cluster, e.g. `https://vault.example.com:8200`.
    pub url: String,
    /// Authentication settings.
    pub auth: VaultAuth,
    /// Explicit CA bundle; falls back to probing well-known system paths.
    #[serde(default)]
    pub ca: Option<Utf8PathBuf>,
    /// Seconds to wait for the slot lock; absent waits indefinitely.
    #[serde(default)]
    pub lock_timeout: Option<u64>,
}

/// Errors raised while building or running the vault job.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Raised when the URL or client settings are invalid.
    #[error("invalid vault configuration: {message}")]
    Configuration {
        /// Human-readable description of the problem.
        message: String,
    },
    /// Raised when the snapshot request fails.
    #[error("vault snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Raised when the snapshot file cannot be written or read back.
    #[error("cannot access snapshot file {path}: {message}")]
    Io {
        /// Snapshot file path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the downloaded snapshot fails gzip verification.
    #[error("snapshot {path} failed integrity check: {message}")]
    Corrupt {
        /// Snapshot file path.
        path: Utf8PathBuf,
        /// Decoder error message.
        message: String,
    },
}

/// Backs up one Vault cluster through its REST API.
pub struct VaultJob {
    url: String,
    token: String,
    client: reqwest::blocking::Client,
    slot: crate::backend::SlotHandle,
    backend: Arc<dyn Backend>,
    lock_timeout: Option<Duration>,
}

impl VaultJob {
    /// Builds the job, the HTTP client, and the single slot named after the
    /// Vault hostname.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Configuration`] for unusable URLs or CA
    /// bundles, and configuration-level backend failures when the slot
    /// cannot be materialised.
    pub fn new(options: VaultOptions, backend: Arc<dyn Backend>) -> Result<Self, VaultError> {
        let url = reqwest::Url::parse(&options.url).map_err(|err| VaultError::Configuration {
            message: format!("invalid url {}: {err}", options.url),
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| VaultError::Configuration {
                message: format!("url {} has no hostname", options.url),
            })?
            .to_owned();

        let mut builder = reqwest::blocking::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(300));
        let explicit_ca = options.ca.is_some();
        if let Some(bundle) = options.ca.or_else(ca_bundle) {
            match load_certificate(&bundle) {
                Ok(certificate) => builder = builder.add_root_certificate(certificate),
                // A probed system bundle that rustls cannot digest must not
                // break the job; an explicitly configured one must.
                Err(err) if !explicit_ca => {
                    warn!(%bundle, error = %err, "ignoring unusable system CA bundle");
                }
                Err(err) => return Err(err),
            }
        }
        let client = builder.build()?;

        let slot = backend
            .ensure_slot(&host)
            .map_err(|err| VaultError::Configuration {
                message: err.to_string(),
            })?;

        let VaultAuth::Token { token } = options.auth;
        Ok(Self {
            url: options.url.trim_end_matches('/').to_owned(),
            token,
            client,
            slot,
            backend,
            lock_timeout: options.lock_timeout.map(Duration::from_secs),
        })
    }

    /// Downloads the snapshot into the slot and verifies it.
    fn take_snapshot(&self) -> Result<(), VaultError> {
        let snapshot_file = self.slot.path().join(SNAPSHOT_FILE);
        let endpoint = format!("{}{SNAPSHOT_ENDPOINT}", self.url);
        info!(%endpoint, file = %snapshot_file, "downloading vault snapshot");

        let mut response = self
            .client
            .get(&endpoint)
            .header("X-Vault-Token", &self.token)
            .send()?
            .error_for_status()?;

        let mut file =
            std::fs::File::create(snapshot_file.as_std_path()).map_err(|err| VaultError::Io {
                path: snapshot_file.clone(),
                message: err.to_string(),
            })?;
        response.copy_to(&mut file)?;

        verify_gzip(&snapshot_file)
    }
}

impl Job for VaultJob {
    fn name(&self) -> &'static str {
        "vault"
    }

    fn backup(&self) -> Result<Vec<SlotOutcome>, JobError> {
        let lock = match self.backend.lock(&self.slot, self.lock_timeout) {
            Ok(lock) => lock,
            Err(err @ BackendError::LockTimeout { .. }) => {
                return Ok(vec![SlotOutcome::locked(self.slot.clone(), err.to_string())]);
            }
            Err(err) => {
                return Ok(vec![SlotOutcome::unknown(
                    self.slot.clone(),
                    err.to_string(),
                )]);
            }
        };

        let outcome = match self.take_snapshot() {
            Ok(()) => SlotOutcome::success(self.slot.clone()),
            Err(err) => {
                error!(error = %err, "vault snapshot failed");
                SlotOutcome::failure(self.slot.clone(), err.to_string())
            }
        };
        drop(lock);
        Ok(vec![outcome])
    }
}

/// Verifies the gzip CRC by decoding the whole file into a sink.
fn verify_gzip(path: &Utf8Path) -> Result<(), VaultError> {
    let file = std::fs::File::open(path.as_std_path()).map_err(|err| VaultError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let mut decoder = GzDecoder::new(file);
    io::copy(&mut decoder, &mut io::sink()).map_err(|err| VaultError::Corrupt {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(())
}

/// Reads and parses one PEM certificate (or bundle) for the HTTP client.
fn load_certificate(bundle: &Utf8Path) -> Result<reqwest::Certificate, VaultError> {
    let pem = std::fs::read(bundle.as_std_path()).map_err(|err| VaultError::Configuration {
        message: format!("cannot read CA bundle {bundle}: {err}"),
    })?;
    reqwest::Certificate::from_pem(&pem).map_err(|err| VaultError::Configuration {
        message: format!("invalid CA bundle {bundle}: {err}"),
    })
}

/// Returns the system CA bundle, honouring `SSL_CERT_FILE` first.
fn ca_bundle() -> Option<Utf8PathBuf> {
    if let Ok(bundle) = std::env::var("SSL_CERT_FILE") {
        return Some(Utf8PathBuf::from(bundle));
    }
    CA_BUNDLE_PATHS
        .iter()
        .map(Utf8PathBuf::from)
        .find(|path| path.exists())
}
