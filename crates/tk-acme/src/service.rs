//! Owning component: validates the CA settings and runs the store and the
//! verification scheduler between `enable` and `disable`.

use crate::client::AcmeClient;
use crate::scheduler::DomainVerificationScheduler;
use crate::storage::CertificateRepository;
use crate::store::{CertificateStore, TlsContextSink};
use crate::types::{AcmeError, AcmeResult, StoreConfig};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tk_common::{CertificateEvent, ComponentStatus, SiteRegistry};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Running {
    store: Arc<CertificateStore>,
    scheduler: Arc<DomainVerificationScheduler>,
    _scheduler_task: JoinHandle<()>,
    _worker: Option<JoinHandle<()>>,
}

pub struct AcmeService {
    repository: Arc<dyn CertificateRepository>,
    storage_root: PathBuf,
    acme: Arc<dyn AcmeClient>,
    sites: Arc<dyn SiteRegistry>,
    status: Arc<ComponentStatus>,
    events: Option<broadcast::Sender<CertificateEvent>>,
    tls: Option<Arc<dyn TlsContextSink>>,
    renew_poll_interval: Option<Duration>,
    running: Mutex<Option<Running>>,
}

impl AcmeService {
    pub fn new(
        repository: Arc<dyn CertificateRepository>,
        storage_root: impl Into<PathBuf>,
        acme: Arc<dyn AcmeClient>,
        sites: Arc<dyn SiteRegistry>,
        status: Arc<ComponentStatus>,
    ) -> Self {
        Self {
            repository,
            storage_root: storage_root.into(),
            acme,
            sites,
            status,
            events: None,
            tls: None,
            renew_poll_interval: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, sender: broadcast::Sender<CertificateEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn with_tls(mut self, sink: Arc<dyn TlsContextSink>) -> Self {
        self.tls = Some(sink);
        self
    }

    pub fn with_renew_poll_interval(mut self, interval: Duration) -> Self {
        self.renew_poll_interval = Some(interval);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    /// Store of the running component
    pub fn store(&self) -> Option<Arc<CertificateStore>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.store))
    }

    /// Validate the configuration, load the store and start the scheduler
    pub async fn enable(&self) -> AcmeResult<Arc<CertificateStore>> {
        if let Some(store) = self.store() {
            debug!("ACME service already enabled");
            return Ok(store);
        }

        let mut config = self.repository.load()?.config;
        config.validate()?;

        if !self.status.is_https_running() {
            return Err(AcmeError::ConfigError(
                "the HTTPS server is not running, certificate management needs it".into(),
            ));
        }

        if !config.production {
            warn!(
                "Certificates are requested from the staging environment, set 'config.production' to true for trusted certificates"
            );
        }

        let registered = config
            .registration_url
            .as_deref()
            .is_some_and(|url| config.registration_matches(url));
        if !registered {
            let url = self.acme.new_registration().await?;
            info!(url = %url, contacts = ?config.contacts(), "Registered CA account");
            config.registration_url = Some(url);
            self.repository.save_config(&config)?;
        }

        let mut store_config = StoreConfig::new(&self.storage_root, &config);
        if let Some(interval) = self.renew_poll_interval {
            store_config.renew_poll_interval = interval;
        }

        let mut store = CertificateStore::new(
            store_config,
            Arc::clone(&self.acme),
            Arc::clone(&self.repository),
            Arc::clone(&self.sites),
        )?;
        if let Some(events) = &self.events {
            store = store.with_events(events.clone());
        }
        let store = Arc::new(store);
        if let Some(tls) = &self.tls {
            store.attach_tls(Arc::clone(tls));
        }

        let worker = store.start();
        self.status.set_enabled(true);
        if let Err(e) = store.initialize().await {
            self.status.set_enabled(false);
            return Err(e);
        }

        let scheduler = Arc::new(DomainVerificationScheduler::new(
            Arc::clone(&self.acme),
            Arc::clone(&self.sites),
            store.clone(),
            Arc::clone(&self.status),
        ));
        let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

        *self.running.lock() = Some(Running {
            store: Arc::clone(&store),
            scheduler,
            _scheduler_task: scheduler_task,
            _worker: worker,
        });

        info!(directory = %config.directory_url(), "ACME certificate management enabled");
        Ok(store)
    }

    /// Stop the scheduler and persist the store.
    ///
    /// A signing request already submitted may still complete afterwards.
    pub fn disable(&self) -> AcmeResult<()> {
        let running = self.running.lock().take();
        self.status.set_enabled(false);

        let Some(running) = running else {
            return Ok(());
        };

        running.scheduler.cancel();
        running.store.persist()?;

        let in_flight = running.store.in_flight();
        if in_flight > 0 {
            warn!(in_flight, "Signing requests still in flight, they complete after disable");
        }

        info!("ACME certificate management disabled");
        Ok(())
    }

    /// Run a verification sweep now
    pub fn run_now(&self) {
        match self.running.lock().as_ref() {
            Some(running) => running.scheduler.trigger(),
            None => debug!("ACME service is not enabled, nothing to run"),
        }
    }
}
