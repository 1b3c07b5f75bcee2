//! One managed certificate: files, CA order, domain coverage and its own
//! validate/renew/sign/revoke logic.

use crate::certificate::ParsedCertificate;
use crate::store::{CertificateStore, SigningCompletion};
use crate::storage::{CertificateRecord, file_digest};
use crate::types::{
    AcmeError, AcmeResult, DEFAULT_CERTIFICATE, DEFAULT_KEY_ALIAS, DownloadState, OrderState,
    RENEWAL_THRESHOLD_DAYS,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct EntityRecord {
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    key_alias: Option<String>,
    uri: Option<String>,
    hash: Option<String>,
    mapping: Vec<String>,
    domains: BTreeSet<String>,
}

pub struct CertificateEntity {
    key: String,
    record: Mutex<EntityRecord>,
    parsed: RwLock<Option<Arc<ParsedCertificate>>>,
    pending: AtomicBool,
}

impl std::fmt::Debug for CertificateEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateEntity")
            .field("key", &self.key)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl CertificateEntity {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            record: Mutex::new(EntityRecord::default()),
            parsed: RwLock::new(None),
            pending: AtomicBool::new(false),
        }
    }

    /// Rebuild an entity from its persisted record
    pub fn from_record(key: &str, record: &CertificateRecord) -> Self {
        let entity = Self::new(key);
        {
            let mut state = entity.record.lock();
            state.cert_file = record.cert_file.clone();
            state.key_alias = record.private_key.clone();
            state.uri = record.uri.clone();
            state.hash = record.hash.clone();
            state.mapping = record.mapping.clone();
        }
        entity
    }

    /// New entity serving the sites in `mapping`
    pub fn mapped(key: &str, key_alias: &str, mapping: Vec<String>) -> Self {
        let entity = Self::new(key);
        {
            let mut state = entity.record.lock();
            state.key_alias = Some(key_alias.to_string());
            state.mapping = mapping;
        }
        entity
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_default(&self) -> bool {
        self.key == DEFAULT_CERTIFICATE
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn cert_file(&self) -> Option<PathBuf> {
        self.record.lock().cert_file.clone()
    }

    pub fn key_file(&self) -> Option<PathBuf> {
        self.record.lock().key_file.clone()
    }

    pub fn uri(&self) -> Option<String> {
        self.record.lock().uri.clone()
    }

    pub fn mapping(&self) -> Vec<String> {
        self.record.lock().mapping.clone()
    }

    pub fn domains(&self) -> BTreeSet<String> {
        self.record.lock().domains.clone()
    }

    /// Persisted form, with `key_alias` as the private key reference
    pub fn to_record(&self, key_alias: Option<String>) -> CertificateRecord {
        let state = self.record.lock();
        CertificateRecord {
            cert_file: state.cert_file.clone(),
            private_key: key_alias.or_else(|| state.key_alias.clone()),
            uri: state.uri.clone(),
            hash: state.hash.clone(),
            mapping: state.mapping.clone(),
        }
    }

    /// Parsed certificate, loaded on first use.
    ///
    /// A successful parse adds the certificate's SAN names to the domain set.
    pub fn certificate(&self) -> Option<Arc<ParsedCertificate>> {
        if let Some(parsed) = self.parsed.read().as_ref() {
            return Some(Arc::clone(parsed));
        }

        let (cert_file, key_file) = {
            let state = self.record.lock();
            (state.cert_file.clone()?, state.key_file.clone()?)
        };

        match ParsedCertificate::load(&cert_file, &key_file) {
            Ok(parsed) => {
                let parsed = Arc::new(parsed);
                self.record
                    .lock()
                    .domains
                    .extend(parsed.subject_alt_dns_names().iter().cloned());
                *self.parsed.write() = Some(Arc::clone(&parsed));
                Some(parsed)
            }
            Err(e) => {
                debug!(key = %self.key, file = %cert_file.display(), error = %e, "Certificate not loadable");
                None
            }
        }
    }

    /// Drop the parsed certificate so the next access reloads the files
    pub fn invalidate(&self) {
        *self.parsed.write() = None;
    }

    /// Stored digest of the certificate file, computed from the file when unset
    pub fn content_hash(&self) -> Option<String> {
        let mut state = self.record.lock();
        if state.hash.is_none() {
            if let Some(file) = &state.cert_file {
                state.hash = file_digest(file).ok();
            }
        }
        state.hash.clone()
    }

    fn digest_matches(&self) -> bool {
        let Some(expected) = self.content_hash() else {
            return false;
        };
        let Some(file) = self.cert_file() else {
            return false;
        };
        file_digest(&file).is_ok_and(|actual| actual == expected)
    }

    /// Check the certificate and start whatever CA work it needs.
    ///
    /// Returns true only when a valid certificate covering every domain is in
    /// place and nothing is pending.
    pub async fn validate(self: &Arc<Self>, store: &CertificateStore) -> bool {
        match self.check(store).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Certificate validation failed");
                false
            }
        }
    }

    async fn check(self: &Arc<Self>, store: &CertificateStore) -> AcmeResult<bool> {
        if self.is_pending() {
            return Ok(false);
        }

        self.resolve_key_file(store)?;
        self.refresh_domains(store);

        if !self.digest_matches() {
            let has_order = {
                let mut state = self.record.lock();
                if state.cert_file.is_none() {
                    state.cert_file = Some(store.config().certificate_path(&self.key));
                }
                state.uri.is_some()
            };

            if !has_order {
                self.sign_new(store).await?;
                return Ok(false);
            }
            self.renew(store).await?;
        }

        let expiring = match self.certificate() {
            Some(certificate) => certificate.days_remaining() < RENEWAL_THRESHOLD_DAYS,
            None => true,
        };
        if expiring && !self.is_pending() {
            if self.uri().is_none() {
                self.sign_new(store).await?;
                return Ok(false);
            }
            self.renew(store).await?;
        }

        if self.is_pending() {
            return Ok(false);
        }

        if self.is_default() {
            if let Some(certificate) = self.certificate() {
                let names: BTreeSet<String> =
                    certificate.subject_alt_dns_names().iter().cloned().collect();
                let domains = self.domains();

                if !domains.is_subset(&names) {
                    debug!(
                        key = %self.key,
                        wanted = ?domains,
                        covered = ?names,
                        "Default certificate is missing domains"
                    );
                    self.revoke(store).await;
                    self.sign_new(store).await?;
                    return Ok(false);
                }
            }
        }

        Ok(match self.certificate() {
            Some(certificate) => certificate.check_validity().is_ok() && !self.is_pending(),
            None => false,
        })
    }

    fn resolve_key_file(&self, store: &CertificateStore) -> AcmeResult<()> {
        let alias = {
            let state = self.record.lock();
            if state.key_file.is_some() {
                return Ok(());
            }
            state
                .key_alias
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_ALIAS.to_string())
        };

        let path = store.private_key(&alias)?;

        let mut state = self.record.lock();
        state.key_file = Some(path);
        state.key_alias = Some(alias);
        Ok(())
    }

    fn refresh_domains(&self, store: &CertificateStore) {
        if self.is_default() {
            let verified = store.verified_domains();
            self.record.lock().domains = verified;
        } else {
            let mapped = store.mapped_domains(&self.mapping());
            self.record.lock().domains.extend(mapped);
        }
    }

    /// Download the latest certificate of the existing CA order
    pub async fn renew(self: &Arc<Self>, store: &CertificateStore) -> AcmeResult<()> {
        if self.is_pending() {
            return Err(AcmeError::PendingUpdate(self.key.clone()));
        }

        let uri = self
            .uri()
            .ok_or_else(|| AcmeError::NoOrder(self.key.clone()))?;

        info!(key = %self.key, "Attempting to renew certificate");

        let dir = store.config().certificate_dir(&self.key);
        let path = loop {
            match store.acme().download_certificate(&uri, &dir).await? {
                DownloadState::Issued(path) => break path,
                DownloadState::Pending => {
                    tokio::time::sleep(store.config().renew_poll_interval).await;
                }
                DownloadState::Failed(reason) => return Err(AcmeError::Rejected(reason)),
            }
        };

        let fresh_hash = file_digest(&path)?;
        if self.content_hash().as_deref() == Some(fresh_hash.as_str()) {
            warn!(
                key = %self.key,
                "The CA did not provide a renewed certificate, requesting revocation and a new one"
            );
            self.revoke(store).await;
            self.sign_new(store).await?;
        }

        {
            let mut state = self.record.lock();
            state.cert_file = Some(path);
            state.hash = Some(fresh_hash);
        }
        self.invalidate();
        store.persist_entity(self)?;
        store.mark_dirty();

        info!(key = %self.key, "Certificate renewed");
        Ok(())
    }

    /// Submit a new signing request for the current domain set.
    ///
    /// The outcome is applied by the store's signing worker once the CA is done.
    pub async fn sign_new(self: &Arc<Self>, store: &CertificateStore) -> AcmeResult<()> {
        if self.pending.swap(true, Ordering::AcqRel) {
            return Err(AcmeError::PendingUpdate(self.key.clone()));
        }

        let domains: Vec<String> = self.domains().into_iter().collect();
        if domains.is_empty() {
            self.pending.store(false, Ordering::Release);
            return Err(AcmeError::Invariant(format!(
                "Certificate {} has no domain to sign",
                self.key
            )));
        }

        let key_file = if self.is_default() { None } else { self.key_file() };

        let request = match store
            .acme()
            .new_signing_request(&domains, key_file.as_deref())
            .await
        {
            Ok(request) => request,
            Err(e) => {
                self.pending.store(false, Ordering::Release);
                return Err(e);
            }
        };

        info!(key = %self.key, domains = ?domains, "Requested certificate signature");

        let dir = store.config().certificate_dir(&self.key);
        let completions = store.begin_signing();
        let entity = Arc::clone(self);

        tokio::spawn(async move {
            let mut request = request;
            let outcome = match request.wait().await {
                OrderState::Success => request.save(&dir).await.map_err(|e| e.to_string()),
                _ => Err(request.last_message()),
            };

            if completions
                .send(SigningCompletion { entity, outcome })
                .is_err()
            {
                error!("Signing completed after the certificate store was dropped");
            }
        });

        Ok(())
    }

    /// Record the certificate produced by a completed signing request
    pub(crate) fn apply_issued(&self, path: PathBuf, uri: String) {
        {
            let mut state = self.record.lock();
            state.hash = file_digest(&path).ok();
            state.cert_file = Some(path);
            state.uri = Some(uri);
        }
        self.invalidate();
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Ask the CA to revoke the current certificate
    pub async fn revoke(&self, store: &CertificateStore) -> bool {
        if self.is_pending() {
            return false;
        }

        let Some(certificate) = self.certificate() else {
            return false;
        };

        self.pending.store(true, Ordering::Release);
        let result = send_revocation(store, certificate.encoded()).await;
        self.pending.store(false, Ordering::Release);

        match result {
            Ok(true) => {
                info!(key = %self.key, "Certificate revoked");
                self.invalidate();
                true
            }
            Ok(false) => {
                warn!(key = %self.key, "The CA refused to revoke the certificate");
                false
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Certificate revocation failed");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_files(&self, cert_file: &std::path::Path, key_file: &std::path::Path) {
        let mut state = self.record.lock();
        state.cert_file = Some(cert_file.to_path_buf());
        state.key_file = Some(key_file.to_path_buf());
    }
}

async fn send_revocation(store: &CertificateStore, der: &[u8]) -> AcmeResult<bool> {
    let payload = serde_json::json!({
        "resource": "revoke-cert",
        "certificate": URL_SAFE_NO_PAD.encode(der),
    });

    let body = store.acme().new_jwt(&payload)?;
    let url = store.acme().revoke_url()?;

    let response = store
        .http()
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;

    let nonce = response
        .headers()
        .get("Replay-Nonce")
        .and_then(|value| value.to_str().ok());
    store.acme().nonce(nonce);

    Ok(response.status() == reqwest::StatusCode::OK)
}
