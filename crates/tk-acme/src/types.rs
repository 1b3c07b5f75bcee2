use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Key reserved for the fallback certificate
pub const DEFAULT_CERTIFICATE: &str = "default";

/// Private key alias used when a record names none
pub const DEFAULT_KEY_ALIAS: &str = "domain";

/// Certificates with fewer days left than this are renewed
pub const RENEWAL_THRESHOLD_DAYS: i64 = 15;

/// Let's Encrypt directory URLs
pub const URL_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org";
pub const URL_TESTING: &str = "https://acme-staging-v02.api.letsencrypt.org";

/// CA settings, stored in the `config` section of the persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeConfig {
    /// Certificate authority name, only "letsencrypt" is supported
    #[serde(default = "default_ca")]
    pub ca: String,
    /// Use the production directory instead of staging
    #[serde(default)]
    pub production: bool,
    /// Account contact e-mail
    #[serde(default)]
    pub email: Option<String>,
    /// Subscriber agreement acceptance
    #[serde(rename = "accept-agreement", default)]
    pub accept_agreement: bool,
    /// Key size used when generating private keys.
    ///
    /// Keys are ECDSA: 256 or less selects P-256, anything larger P-384.
    #[serde(default = "default_key_size")]
    pub default_key_size: u32,
    /// Whether the default (fallback) certificate is managed here
    #[serde(default = "default_true")]
    pub allow_default_certificate: bool,
    /// Account registration URL, rewritten when it does not match the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_url: Option<String>,
}

fn default_ca() -> String {
    "letsencrypt".to_string()
}

fn default_key_size() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            ca: default_ca(),
            production: false,
            email: None,
            accept_agreement: false,
            default_key_size: default_key_size(),
            allow_default_certificate: true,
            registration_url: None,
        }
    }
}

impl AcmeConfig {
    /// Check the settings the CA requires before issuing anything
    pub fn validate(&self) -> AcmeResult<()> {
        if self.ca != "letsencrypt" {
            return Err(AcmeError::ConfigError(format!(
                "only the Let's Encrypt certificate authority is supported, but 'config.ca' is set to '{}'",
                self.ca
            )));
        }

        if !self.accept_agreement {
            return Err(AcmeError::ConfigError(
                "Let's Encrypt requires accepting its subscriber agreement, set 'config.accept-agreement' to true"
                    .into(),
            ));
        }

        if self.email.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(AcmeError::ConfigError(
                "Let's Encrypt requires a valid e-mail address, see 'config.email'".into(),
            ));
        }

        Ok(())
    }

    /// Directory URL of the selected environment
    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.base_url())
    }

    fn base_url(&self) -> &'static str {
        if self.production {
            URL_PRODUCTION
        } else {
            URL_TESTING
        }
    }

    /// True when `url` belongs to the selected environment
    pub fn registration_matches(&self, url: &str) -> bool {
        // The staging URL is not a prefix of the production one, so one check is enough
        url.starts_with(self.base_url())
    }

    /// Contact list sent with the registration
    pub fn contacts(&self) -> Vec<String> {
        self.email
            .iter()
            .map(|email| format!("mailto:{}", email.trim()))
            .collect()
    }

    /// Environment sub-directory, so staging and production never share files
    pub fn environment_dir(&self) -> &'static str {
        if self.production { "production" } else { "testing" }
    }
}

/// Runtime settings of a certificate store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root for key files and `<key>/fullchain.pem` certificates
    pub data_dir: PathBuf,
    pub default_key_size: u32,
    pub allow_default_certificate: bool,
    /// Pause between two download attempts while an order is pending
    pub renew_poll_interval: Duration,
}

impl StoreConfig {
    pub fn new(storage_root: &Path, config: &AcmeConfig) -> Self {
        Self {
            data_dir: storage_root.join(config.environment_dir()),
            default_key_size: config.default_key_size,
            allow_default_certificate: config.allow_default_certificate,
            renew_poll_interval: Duration::from_secs(2),
        }
    }

    /// Canonical location of a certificate chain
    pub fn certificate_path(&self, key: &str) -> PathBuf {
        self.certificate_dir(key).join("fullchain.pem")
    }

    pub fn certificate_dir(&self, key: &str) -> PathBuf {
        self.data_dir.join(key)
    }

    pub fn key_path(&self, alias: &str) -> PathBuf {
        self.data_dir.join(format!("{}.key", alias))
    }
}

/// Answer of the CA to a domain verification query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Success,
    Pending,
    Failed,
}

/// State of a signing request (order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Success,
    Failed,
}

/// Result of one attempt to download the certificate of an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    /// Certificate chain written to the given file
    Issued(PathBuf),
    /// The CA has not produced the certificate yet
    Pending,
    /// The order is no longer pending and nothing was issued
    Failed(String),
}

/// Certificate produced by a completed signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Full chain written by the CA client
    pub path: PathBuf,
    /// URI used to download renewed certificates later
    pub uri: String,
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("ACME protocol error: {0}")]
    ProtocolError(String),

    #[error("CA rejected the request: {0}")]
    Rejected(String),

    #[error("Certificate {0} is pending an update")]
    PendingUpdate(String),

    #[error("Certificate {0} has no CA order to renew")]
    NoOrder(String),

    #[error("Certificate parsing error: {0}")]
    ParsingError(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Unsupported by this certificate authority: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type AcmeResult<T> = Result<T, AcmeError>;
