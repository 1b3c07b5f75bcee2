//! Owner of every managed certificate and of the SNI lookup built from them.

use crate::client::AcmeClient;
use crate::entity::CertificateEntity;
use crate::keys::generate_private_key;
use crate::scheduler::Reconcile;
use crate::sni::SniIndex;
use crate::storage::{CertificateRecord, CertificateRepository, KeyRecord, file_digest};
use crate::types::{
    AcmeError, AcmeResult, DEFAULT_CERTIFICATE, DEFAULT_KEY_ALIAS, IssuedCertificate, StoreConfig,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustls::sign::CertifiedKey;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tk_common::{CertificateEvent, SiteRegistry};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives the default certificate whenever it changes
pub trait TlsContextSink: Send + Sync {
    fn install_default(&self, context: Arc<CertifiedKey>) -> AcmeResult<()>;
}

/// Outcome of a signing request, applied by the store's worker
pub(crate) struct SigningCompletion {
    pub entity: Arc<CertificateEntity>,
    pub outcome: Result<IssuedCertificate, String>,
}

#[derive(Default)]
struct DefaultSlot {
    entity: Option<Arc<CertificateEntity>>,
    /// Set once the entity went through `set_default`
    installed: bool,
}

pub struct CertificateStore {
    config: StoreConfig,
    acme: Arc<dyn AcmeClient>,
    repository: Arc<dyn CertificateRepository>,
    sites: Arc<dyn SiteRegistry>,
    http: reqwest::Client,

    entities: RwLock<BTreeMap<String, Arc<CertificateEntity>>>,
    default: RwLock<DefaultSlot>,
    keys: RwLock<BTreeMap<String, KeyRecord>>,
    verified: RwLock<BTreeSet<String>>,

    index: ArcSwap<SniIndex>,
    dirty: AtomicBool,
    rebuild_lock: Mutex<()>,
    generation: AtomicU64,

    completions: mpsc::UnboundedSender<SigningCompletion>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<SigningCompletion>>>,
    in_flight: watch::Sender<usize>,

    tls: RwLock<Option<Arc<dyn TlsContextSink>>>,
    events: Option<broadcast::Sender<CertificateEvent>>,
}

impl CertificateStore {
    pub fn new(
        config: StoreConfig,
        acme: Arc<dyn AcmeClient>,
        repository: Arc<dyn CertificateRepository>,
        sites: Arc<dyn SiteRegistry>,
    ) -> AcmeResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tlskeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0usize);

        Ok(Self {
            config,
            acme,
            repository,
            sites,
            http,
            entities: RwLock::new(BTreeMap::new()),
            default: RwLock::new(DefaultSlot::default()),
            keys: RwLock::new(BTreeMap::new()),
            verified: RwLock::new(BTreeSet::new()),
            index: ArcSwap::from_pointee(SniIndex::new()),
            dirty: AtomicBool::new(false),
            rebuild_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            completions,
            completions_rx: Mutex::new(Some(completions_rx)),
            in_flight,
            tls: RwLock::new(None),
            events: None,
        })
    }

    /// Publish certificate events on `sender`
    pub fn with_events(mut self, sender: broadcast::Sender<CertificateEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn attach_tls(&self, sink: Arc<dyn TlsContextSink>) {
        *self.tls.write() = Some(sink);
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn acme(&self) -> &dyn AcmeClient {
        self.acme.as_ref()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Start the worker applying signing completions.
    ///
    /// Returns `None` when the worker was already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.completions_rx.lock().take()?;
        let store = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(completion) = rx.recv().await {
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.apply_completion(completion);
            }
            debug!("Signing worker stopped");
        }))
    }

    /// Load the key registry and every persisted certificate
    pub async fn initialize(&self) -> AcmeResult<()> {
        let document = self.repository.load()?;

        for (alias, record) in &document.keys {
            let matches = match (&record.hash, file_digest(&record.file)) {
                (Some(expected), Ok(actual)) => *expected == actual,
                _ => false,
            };

            if matches {
                self.keys.write().insert(alias.clone(), record.clone());
            } else {
                warn!(
                    alias = %alias,
                    file = %record.file.display(),
                    "Private key is missing or does not match its stored hash, dropping it"
                );
            }
        }

        for (key, record) in &document.certificates {
            let entity = Arc::new(CertificateEntity::from_record(key, record));
            let valid = entity.validate(self).await;

            let result = if entity.is_default() {
                self.default.write().entity = Some(Arc::clone(&entity));
                if valid {
                    self.set_default(entity)
                } else {
                    Ok(())
                }
            } else {
                self.load(entity)
            };

            if let Err(e) = result {
                error!(key = %key, error = %e, "There was a problem loading certificate");
            }
        }

        info!(
            certificates = self.entities.read().len(),
            default = self.default.read().installed,
            "Certificate store initialized"
        );
        Ok(())
    }

    /// Path of the private key registered as `alias`, generated on first use
    pub fn private_key(&self, alias: &str) -> AcmeResult<PathBuf> {
        let registered = self.keys.read().get(alias).map(|record| record.file.clone());
        if let Some(file) = &registered {
            if file.exists() {
                return Ok(file.clone());
            }
        }

        let path = self.config.key_path(alias);
        if let Some(previous) = registered.filter(|file| *file != path) {
            warn!(
                alias = %alias,
                previous = %previous.display(),
                file = %path.display(),
                "Registered private key file is gone, moving the alias to its default location"
            );
        }
        if !path.exists() {
            generate_private_key(&path, self.config.default_key_size)?;
            info!(alias = %alias, file = %path.display(), "Generated private key");
        }

        let record = KeyRecord {
            file: path.clone(),
            hash: file_digest(&path).ok(),
        };
        self.keys.write().insert(alias.to_string(), record.clone());
        self.repository.save_key(alias, &record)?;

        Ok(path)
    }

    /// Alias under which `path` is registered
    pub fn private_key_alias(&self, path: &Path) -> Option<String> {
        self.keys
            .read()
            .iter()
            .find(|(_, record)| record.file == path)
            .map(|(alias, _)| alias.clone())
    }

    /// Add a non-default certificate to the SNI lookup
    pub fn load(&self, entity: Arc<CertificateEntity>) -> AcmeResult<()> {
        if entity.is_default() {
            return Err(AcmeError::Invariant(
                "the default certificate is installed through set_default".into(),
            ));
        }

        {
            let mut entities = self.entities.write();
            if entities.contains_key(entity.key()) {
                return Err(AcmeError::Invariant(format!(
                    "certificate {} is already loaded",
                    entity.key()
                )));
            }
            entities.insert(entity.key().to_string(), entity);
        }

        self.mark_dirty();
        Ok(())
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        if key == DEFAULT_CERTIFICATE {
            return self.default.read().installed;
        }
        self.entities.read().contains_key(key)
    }

    pub fn certificate(&self, key: &str) -> Option<Arc<CertificateEntity>> {
        if key == DEFAULT_CERTIFICATE {
            return self.default_certificate();
        }
        self.entities.read().get(key).cloned()
    }

    /// The installed default certificate
    pub fn default_certificate(&self) -> Option<Arc<CertificateEntity>> {
        let slot = self.default.read();
        if slot.installed { slot.entity.clone() } else { None }
    }

    /// Install `entity` as the default certificate and push it to the TLS layer
    pub fn set_default(&self, entity: Arc<CertificateEntity>) -> AcmeResult<()> {
        if !entity.is_default() {
            return Err(AcmeError::Invariant(format!(
                "certificate key {} is not {}",
                entity.key(),
                DEFAULT_CERTIFICATE
            )));
        }

        if !self.config.allow_default_certificate {
            return Err(AcmeError::Invariant(
                "the default certificate is not managed here, set 'config.allowDefaultCertificate' to true"
                    .into(),
            ));
        }

        let certificate = entity.certificate().ok_or_else(|| {
            AcmeError::Invariant("the default certificate has no usable certificate".into())
        })?;

        let sink = self.tls.read().clone();
        if let Some(sink) = sink {
            if let Err(e) = sink.install_default(certificate.context()) {
                error!(error = %e, "Failed to push the default certificate to the TLS layer");
            }
        }

        *self.default.write() = DefaultSlot {
            entity: Some(entity),
            installed: true,
        };

        let domains = certificate.served_names();
        info!(domains = ?domains, "Default certificate installed");
        self.emit(CertificateEvent::DefaultChanged { domains });
        Ok(())
    }

    /// Certificate context for `hostname`, rebuilding the lookup if needed
    pub fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.ensure_index();
        self.index.load().lookup(hostname)
    }

    pub fn resolve_default(&self) -> Option<Arc<CertifiedKey>> {
        if !self.config.allow_default_certificate {
            return None;
        }
        let entity = self.default_certificate()?;
        entity.certificate().map(|certificate| certificate.context())
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn ensure_index(&self) {
        if !self.dirty.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.rebuild_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        self.rebuild();
    }

    /// Rebuild the SNI lookup from the loaded certificates and swap it in
    pub fn rebuild(&self) {
        let entities: Vec<Arc<CertificateEntity>> =
            self.entities.read().values().cloned().collect();

        let mut index = SniIndex::new();
        for entity in entities {
            let Some(certificate) = entity.certificate() else {
                continue;
            };
            let context = certificate.context();
            for name in certificate.served_names() {
                index.insert(&name, Arc::clone(&context));
            }
        }

        let names = index.len();
        self.index.store(Arc::new(index));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, names, "SNI index rebuilt");
    }

    /// Number of rebuilds so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Domains found verified by the last sweep
    pub fn verified_domains(&self) -> BTreeSet<String> {
        self.verified.read().clone()
    }

    /// Every domain served by the given sites
    pub fn mapped_domains(&self, sites: &[String]) -> BTreeSet<String> {
        let mut domains = BTreeSet::new();
        for site in sites {
            let Some(map) = self.sites.site_domains(site) else {
                debug!(site = %site, "Mapped site is not registered");
                continue;
            };
            for (domain, subdomains) in map {
                for sub in &subdomains {
                    domains.insert(format!("{}.{}", sub, domain));
                }
                domains.insert(domain);
            }
        }
        domains
    }

    /// Validate every certificate against the verified domain set
    pub async fn reconcile_all(&self, verified: BTreeSet<String>) {
        *self.verified.write() = verified;

        let entities: Vec<Arc<CertificateEntity>> =
            self.entities.read().values().cloned().collect();
        for entity in entities {
            entity.validate(self).await;
        }

        let candidate = self.default.read().entity.clone();
        match candidate {
            None if self.config.allow_default_certificate => {
                if let Err(e) = self.generate_default_certificate().await {
                    warn!(error = %e, "Could not generate the default certificate");
                }
            }
            None => {
                warn!(
                    "Default certificate is not managed here, set 'config.allowDefaultCertificate' to true to allow"
                );
            }
            Some(entity) => {
                let valid = entity.validate(self).await;
                if valid && !self.default.read().installed {
                    if let Err(e) = self.set_default(entity) {
                        warn!(error = %e, "Could not install the default certificate");
                    }
                }
            }
        }

        info!("Certificate check and sign process has finished");
    }

    /// Create and load the certificate serving `site_id`
    pub async fn generate_certificate(
        &self,
        site_id: &str,
        key_alias: Option<&str>,
    ) -> AcmeResult<Arc<CertificateEntity>> {
        if site_id == DEFAULT_CERTIFICATE {
            return Err(AcmeError::Invariant(
                "a certificate can not be signed for the default site".into(),
            ));
        }

        let key = format!("{}Acme", site_id);
        let alias = key_alias.unwrap_or(DEFAULT_KEY_ALIAS);
        self.private_key(alias)?;

        let entity = Arc::new(CertificateEntity::mapped(
            &key,
            alias,
            vec![site_id.to_string()],
        ));
        self.load(Arc::clone(&entity))?;
        self.persist_entity(&entity)?;

        info!(key = %key, site = %site_id, "Certificate created");
        Ok(entity)
    }

    /// Create the default certificate and install it once valid
    pub async fn generate_default_certificate(&self) -> AcmeResult<Arc<CertificateEntity>> {
        let existing = {
            let slot = self.default.read();
            if slot.installed {
                return Err(AcmeError::Invariant(
                    "there is already a default certificate loaded".into(),
                ));
            }
            slot.entity.clone()
        };

        let entity = match existing {
            Some(entity) => entity,
            None => {
                let record = CertificateRecord {
                    private_key: Some(DEFAULT_KEY_ALIAS.to_string()),
                    ..CertificateRecord::default()
                };
                let entity = Arc::new(CertificateEntity::from_record(DEFAULT_CERTIFICATE, &record));
                self.default.write().entity = Some(Arc::clone(&entity));
                self.persist_entity(&entity)?;
                entity
            }
        };

        if entity.validate(self).await {
            self.set_default(Arc::clone(&entity))?;
        }
        Ok(entity)
    }

    /// Write the key registry and every certificate record
    pub fn persist(&self) -> AcmeResult<()> {
        let keys: Vec<(String, PathBuf)> = self
            .keys
            .read()
            .iter()
            .map(|(alias, record)| (alias.clone(), record.file.clone()))
            .collect();

        for (alias, file) in keys {
            let record = KeyRecord {
                hash: file_digest(&file).ok(),
                file,
            };
            self.repository.save_key(&alias, &record)?;
        }

        let mut entities: Vec<Arc<CertificateEntity>> =
            self.entities.read().values().cloned().collect();
        if let Some(default) = self.default.read().entity.clone() {
            entities.push(default);
        }

        for entity in entities {
            self.persist_entity(&entity)?;
        }

        Ok(())
    }

    pub(crate) fn persist_entity(&self, entity: &CertificateEntity) -> AcmeResult<()> {
        let alias = entity
            .key_file()
            .and_then(|path| self.private_key_alias(&path));
        self.repository
            .save_record(entity.key(), &entity.to_record(alias))
    }

    /// Count a signing request and hand out the completion channel
    pub(crate) fn begin_signing(&self) -> mpsc::UnboundedSender<SigningCompletion> {
        self.in_flight.send_modify(|count| *count += 1);
        self.completions.clone()
    }

    /// Signing requests not yet applied
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Resolves once every submitted signing request has been applied
    pub async fn signing_settled(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    fn apply_completion(&self, completion: SigningCompletion) {
        let SigningCompletion { entity, outcome } = completion;
        entity.clear_pending();

        match outcome {
            Ok(issued) => {
                if let Err(e) = self.install_issued(&entity, issued) {
                    error!(key = %entity.key(), error = %e, "Unexpected error installing a signed certificate");
                }
            }
            Err(reason) => {
                error!(key = %entity.key(), reason = %reason, "Failed certificate signing");
                self.emit(CertificateEvent::SigningFailed {
                    key: entity.key().to_string(),
                    reason,
                });
            }
        }

        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    fn install_issued(
        &self,
        entity: &Arc<CertificateEntity>,
        issued: IssuedCertificate,
    ) -> AcmeResult<()> {
        entity.apply_issued(issued.path, issued.uri);
        self.persist_entity(entity)?;

        if entity.is_default() {
            self.set_default(Arc::clone(entity))?;
        } else if self.is_loaded(entity.key()) {
            self.mark_dirty();
        } else {
            self.load(Arc::clone(entity))?;
        }

        let domains: Vec<String> = entity.domains().into_iter().collect();
        info!(key = %entity.key(), domains = ?domains, "Signed certificate installed");
        self.emit(CertificateEvent::Installed {
            key: entity.key().to_string(),
            domains,
        });
        Ok(())
    }

    fn emit(&self, event: CertificateEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Reconcile for CertificateStore {
    async fn reconcile_all(&self, verified: BTreeSet<String>) {
        CertificateStore::reconcile_all(self, verified).await
    }

    fn persist(&self) -> AcmeResult<()> {
        CertificateStore::persist(self)
    }
}
