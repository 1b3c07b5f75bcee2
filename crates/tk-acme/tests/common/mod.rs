#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tk_acme::{
    AcmeClient, AcmeConfig, AcmeError, AcmeResult, CertificateEntity, CertificateRecord,
    CertificateStore, DownloadState, IssuedCertificate, JsonRepository, OrderState,
    SigningRequest, StoreConfig, VerificationState,
};
use tk_common::SiteMap;

/// Self-signed PEM for `domains`, keyed with the PEM key at `key_file`
pub fn mint(domains: &[String], key_file: &Path, days: i64) -> String {
    let key_pem = std::fs::read_to_string(key_file).unwrap();
    let key = rcgen::KeyPair::from_pem(&key_pem).unwrap();

    let mut params = rcgen::CertificateParams::new(domains.to_vec()).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, domains[0].as_str());
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(days);

    params.self_signed(&key).unwrap().pem()
}

/// Scripted CA: verification answers per FQDN, counted signings and downloads
pub struct FakeCa {
    domain_key: PathBuf,
    verification: Mutex<HashMap<String, VerificationState>>,
    orders: Mutex<HashMap<String, (Vec<String>, PathBuf)>>,
    stale: Mutex<HashMap<String, String>>,
    pub signings: AtomicUsize,
    pub downloads: AtomicUsize,
    /// Downloads answered `Pending` before the chain is issued
    pub pending_downloads: AtomicUsize,
    pub checks: Mutex<Vec<(String, Option<String>, bool)>>,
    pub nonces: Mutex<Vec<Option<String>>>,
    pub fail_signing: AtomicBool,
    pub validity_days: AtomicI64,
    pub revoke_endpoint: Mutex<Option<String>>,
}

impl FakeCa {
    pub fn new(domain_key: PathBuf) -> Self {
        Self {
            domain_key,
            verification: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            stale: Mutex::new(HashMap::new()),
            signings: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            pending_downloads: AtomicUsize::new(0),
            checks: Mutex::new(Vec::new()),
            nonces: Mutex::new(Vec::new()),
            fail_signing: AtomicBool::new(false),
            validity_days: AtomicI64::new(90),
            revoke_endpoint: Mutex::new(None),
        }
    }

    /// Answer for `fqdn`; unknown names verify successfully
    pub fn answer(&self, fqdn: &str, state: VerificationState) {
        self.verification.lock().insert(fqdn.to_string(), state);
    }

    pub fn register_order(&self, uri: &str, domains: Vec<String>, key_file: PathBuf) {
        self.orders.lock().insert(uri.to_string(), (domains, key_file));
    }

    /// Serve `pem` unchanged for every download of `uri`
    pub fn serve_stale(&self, uri: &str, pem: String) {
        self.stale.lock().insert(uri.to_string(), pem);
    }

    fn chain(&self, domains: &[String], key_file: &Path) -> String {
        mint(domains, key_file, self.validity_days.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl AcmeClient for FakeCa {
    async fn check_domain_verification(
        &self,
        domain: &str,
        subdomain: Option<&str>,
        force_challenge: bool,
    ) -> AcmeResult<VerificationState> {
        self.checks.lock().push((
            domain.to_string(),
            subdomain.map(str::to_string),
            force_challenge,
        ));

        let fqdn = match subdomain {
            Some(sub) => format!("{}.{}", sub, domain),
            None => domain.to_string(),
        };
        Ok(self
            .verification
            .lock()
            .get(&fqdn)
            .copied()
            .unwrap_or(VerificationState::Success))
    }

    async fn new_registration(&self) -> AcmeResult<String> {
        Ok("https://acme-staging-v02.api.letsencrypt.org/acme/acct/42".to_string())
    }

    async fn new_signing_request(
        &self,
        domains: &[String],
        key_file: Option<&Path>,
    ) -> AcmeResult<Box<dyn SigningRequest>> {
        let number = self.signings.fetch_add(1, Ordering::SeqCst) + 1;

        if self.fail_signing.load(Ordering::SeqCst) {
            return Ok(Box::new(FakeRequest {
                state: OrderState::Failed,
                chain: None,
                uri: String::new(),
                message: "rate limited".into(),
            }));
        }

        let key_file = key_file.map(Path::to_path_buf).unwrap_or_else(|| self.domain_key.clone());
        let uri = format!("https://ca.test/cert/{}", number);
        let chain = self.chain(domains, &key_file);
        self.register_order(&uri, domains.to_vec(), key_file);

        Ok(Box::new(FakeRequest {
            state: OrderState::Success,
            chain: Some(chain),
            uri,
            message: "valid".into(),
        }))
    }

    async fn download_certificate(&self, uri: &str, dir: &Path) -> AcmeResult<DownloadState> {
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let still_pending = self
            .pending_downloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if still_pending {
            return Ok(DownloadState::Pending);
        }

        let order = self.orders.lock().get(uri).cloned();
        let Some((domains, key_file)) = order else {
            return Ok(DownloadState::Failed(format!("unknown order {}", uri)));
        };

        let chain = match self.stale.lock().get(uri) {
            Some(pem) => pem.clone(),
            None => self.chain(&domains, &key_file),
        };

        std::fs::create_dir_all(dir)?;
        let path = dir.join("fullchain.pem");
        std::fs::write(&path, chain)?;
        Ok(DownloadState::Issued(path))
    }

    fn new_jwt(&self, payload: &serde_json::Value) -> AcmeResult<String> {
        Ok(payload.to_string())
    }

    fn nonce(&self, value: Option<&str>) {
        self.nonces.lock().push(value.map(str::to_string));
    }

    fn revoke_url(&self) -> AcmeResult<String> {
        self.revoke_endpoint
            .lock()
            .clone()
            .ok_or_else(|| AcmeError::Unsupported("no revoke endpoint".into()))
    }
}

struct FakeRequest {
    state: OrderState,
    chain: Option<String>,
    uri: String,
    message: String,
}

#[async_trait]
impl SigningRequest for FakeRequest {
    fn state(&self) -> OrderState {
        self.state
    }

    async fn wait(&mut self) -> OrderState {
        tokio::task::yield_now().await;
        self.state
    }

    async fn save(&mut self, dir: &Path) -> AcmeResult<IssuedCertificate> {
        let chain = self
            .chain
            .clone()
            .ok_or_else(|| AcmeError::Rejected(self.message.clone()))?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join("fullchain.pem");
        std::fs::write(&path, chain)?;
        Ok(IssuedCertificate {
            path,
            uri: self.uri.clone(),
        })
    }

    fn last_message(&self) -> String {
        self.message.clone()
    }
}

pub fn acme_config() -> AcmeConfig {
    AcmeConfig {
        email: Some("ops@example.com".into()),
        accept_agreement: true,
        default_key_size: 256,
        ..AcmeConfig::default()
    }
}

pub fn site_map(json: &str) -> SiteMap {
    serde_json::from_str(json).unwrap()
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<CertificateStore>,
    pub ca: Arc<FakeCa>,
    pub repository: Arc<JsonRepository>,
}

impl Harness {
    pub fn new(sites: &str) -> Self {
        Self::with_config(sites, acme_config())
    }

    pub fn with_config(sites: &str, config: AcmeConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("acme");
        let repository = Arc::new(JsonRepository::open(dir.path().join("acme.json"), &root).unwrap());

        let mut store_config = StoreConfig::new(&root, &config);
        store_config.renew_poll_interval = Duration::from_millis(10);

        let ca = Arc::new(FakeCa::new(store_config.key_path("domain")));
        let store = Arc::new(
            CertificateStore::new(
                store_config,
                ca.clone(),
                repository.clone(),
                Arc::new(site_map(sites)),
            )
            .unwrap(),
        );
        store.start();

        Self {
            dir,
            store,
            ca,
            repository,
        }
    }

    /// Write a certificate for `domains` at the canonical path of `key` and
    /// return an entity for it, known to the CA under an order URI
    pub fn seed(&self, key: &str, domains: &[&str], days: i64) -> Arc<CertificateEntity> {
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let key_file = self.store.private_key("domain").unwrap();

        let cert_file = self.store.config().certificate_path(key);
        std::fs::create_dir_all(cert_file.parent().unwrap()).unwrap();
        std::fs::write(&cert_file, mint(&domains, &key_file, days)).unwrap();

        let uri = format!("https://ca.test/cert/{}", key);
        self.ca.register_order(&uri, domains, key_file);

        Arc::new(CertificateEntity::from_record(
            key,
            &CertificateRecord {
                cert_file: Some(cert_file),
                private_key: Some("domain".into()),
                uri: Some(uri),
                ..CertificateRecord::default()
            },
        ))
    }
}
