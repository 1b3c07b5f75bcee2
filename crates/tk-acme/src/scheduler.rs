//! Periodic domain verification sweep driving store reconciliation.

use crate::client::AcmeClient;
use crate::types::{AcmeResult, VerificationState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tk_common::{ComponentStatus, SiteRegistry};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

/// Delay before retrying while some domain verification is pending
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Regular cadence of the sweep
pub const DAILY: Duration = Duration::from_secs(24 * 60 * 60);

/// What a sweep hands its results to
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile_all(&self, verified: BTreeSet<String>);

    fn persist(&self) -> AcmeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every verification answered, certificates reconciled
    Reconciled,
    /// Some verification is still pending
    Deferred,
    /// The owning component is down, the scheduler stopped
    Cancelled,
    Failed,
}

/// Result of the latest sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainVerificationState {
    pub verified: BTreeSet<String>,
    pub pending: bool,
}

pub struct DomainVerificationScheduler {
    acme: Arc<dyn AcmeClient>,
    sites: Arc<dyn SiteRegistry>,
    target: Arc<dyn Reconcile>,
    status: Arc<ComponentStatus>,
    state: Mutex<DomainVerificationState>,
    trigger: Notify,
    shutdown: watch::Sender<bool>,
    retry_delay: Duration,
    daily_delay: Duration,
}

impl DomainVerificationScheduler {
    pub fn new(
        acme: Arc<dyn AcmeClient>,
        sites: Arc<dyn SiteRegistry>,
        target: Arc<dyn Reconcile>,
        status: Arc<ComponentStatus>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            acme,
            sites,
            target,
            status,
            state: Mutex::new(DomainVerificationState::default()),
            trigger: Notify::new(),
            shutdown,
            retry_delay: RETRY_DELAY,
            daily_delay: DAILY,
        }
    }

    pub fn with_delays(mut self, retry: Duration, daily: Duration) -> Self {
        self.retry_delay = retry;
        self.daily_delay = daily;
        self
    }

    pub fn state(&self) -> DomainVerificationState {
        self.state.lock().clone()
    }

    /// Delay before the run following `outcome`, `None` once cancelled
    pub fn next_delay(&self, outcome: RunOutcome) -> Option<Duration> {
        match outcome {
            RunOutcome::Deferred => Some(self.retry_delay),
            RunOutcome::Cancelled => None,
            RunOutcome::Reconciled | RunOutcome::Failed => Some(self.daily_delay),
        }
    }

    /// Run a sweep now instead of waiting for the next one
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One sweep: verify every registered domain, then reconcile
    pub async fn run_once(&self) -> RunOutcome {
        if !self.status.is_enabled() || !self.status.is_https_running() {
            error!(
                enabled = self.status.is_enabled(),
                https_running = self.status.is_https_running(),
                "Certificate management requires an enabled component and a running HTTPS server, disabling"
            );
            self.status.set_enabled(false);
            self.cancel();
            return RunOutcome::Cancelled;
        }

        *self.state.lock() = DomainVerificationState::default();

        let mut state = DomainVerificationState::default();
        for entry in self.sites.domains() {
            let fqdn = entry.full_domain();
            let answer = self
                .acme
                .check_domain_verification(&entry.domain, entry.subdomain.as_deref(), false)
                .await;

            match answer {
                Ok(VerificationState::Success) => {
                    state.verified.insert(fqdn);
                }
                Ok(VerificationState::Pending) => {
                    debug!(site = %entry.site, domain = %fqdn, "Domain verification pending");
                    state.pending = true;
                }
                Ok(VerificationState::Failed) => {
                    debug!(site = %entry.site, domain = %fqdn, "Domain verification failed");
                }
                Err(e) => {
                    warn!(site = %entry.site, domain = %fqdn, error = %e, "Domain verification error");
                }
            }
        }

        *self.state.lock() = state.clone();

        if state.pending {
            info!(
                verified = state.verified.len(),
                retry = ?self.retry_delay,
                "Some domain verifications are pending, retrying later"
            );
            return RunOutcome::Deferred;
        }

        self.target.reconcile_all(state.verified).await;

        match self.target.persist() {
            Ok(()) => RunOutcome::Reconciled,
            Err(e) => {
                error!(error = %e, "Failed to persist certificate state");
                RunOutcome::Failed
            }
        }
    }

    /// Sweep at startup, then daily, on retry, or when triggered, until cancelled
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        info!("Domain verification scheduler started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let scheduler = Arc::clone(&self);
            let outcome = match tokio::spawn(async move { scheduler.run_once().await }).await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    error!("Domain verification run panicked: {join_error}");
                    RunOutcome::Failed
                }
            };

            let Some(delay) = self.next_delay(outcome) else {
                break;
            };
            debug!(?outcome, ?delay, "Next domain verification scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.trigger.notified() => {
                    info!("Domain verification triggered");
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("Domain verification scheduler stopped");
    }
}
