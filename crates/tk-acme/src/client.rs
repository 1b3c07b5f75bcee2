//! Seams to the certificate authority.
//!
//! The ACME wire protocol (JWS, nonces, challenge serving) lives behind these
//! traits. The store only needs verification answers, signing requests and
//! order downloads.

use crate::types::{AcmeResult, DownloadState, IssuedCertificate, OrderState, VerificationState};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Ask the CA whether `subdomain.domain` (or `domain`) is verified.
    ///
    /// `force_challenge` restarts the challenge even if one is already known.
    async fn check_domain_verification(
        &self,
        domain: &str,
        subdomain: Option<&str>,
        force_challenge: bool,
    ) -> AcmeResult<VerificationState>;

    /// Register the account and return its URL
    async fn new_registration(&self) -> AcmeResult<String>;

    /// Submit an order for `domains`; `key_file` is the certificate key to use,
    /// `None` lets the client use its domain key.
    async fn new_signing_request(
        &self,
        domains: &[String],
        key_file: Option<&Path>,
    ) -> AcmeResult<Box<dyn SigningRequest>>;

    /// Download the latest certificate issued for an order into `dir`
    async fn download_certificate(&self, uri: &str, dir: &Path) -> AcmeResult<DownloadState>;

    /// Wrap `payload` in a JWS signed with the account key
    fn new_jwt(&self, payload: &serde_json::Value) -> AcmeResult<String>;

    /// Record the `Replay-Nonce` returned by the CA
    fn nonce(&self, value: Option<&str>);

    /// Endpoint for certificate revocation
    fn revoke_url(&self) -> AcmeResult<String>;
}

/// An order submitted to the CA
#[async_trait]
pub trait SigningRequest: Send {
    fn state(&self) -> OrderState;

    /// Resolves once the CA has finished with the order
    async fn wait(&mut self) -> OrderState;

    /// Write the issued chain into `dir`
    async fn save(&mut self, dir: &Path) -> AcmeResult<IssuedCertificate>;

    /// Last status message reported by the CA
    fn last_message(&self) -> String;
}
