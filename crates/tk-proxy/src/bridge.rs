//! Forwards site registry changes to the CA as domain verification requests.

use std::sync::Arc;
use tk_acme::{AcmeClient, VerificationState};
use tk_common::{ComponentStatus, SiteEvent};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct SiteEventListener {
    acme: Arc<dyn AcmeClient>,
    status: Arc<ComponentStatus>,
}

impl SiteEventListener {
    pub fn new(acme: Arc<dyn AcmeClient>, status: Arc<ComponentStatus>) -> Self {
        Self { acme, status }
    }

    /// Start verification for every domain the event adds.
    ///
    /// Returns the number of domains submitted to the CA.
    pub async fn handle(&self, event: &SiteEvent) -> usize {
        if !self.status.is_enabled() {
            debug!("Certificate management disabled, ignoring site event");
            return 0;
        }

        let (site, domains) = match event {
            SiteEvent::DomainAdded {
                site,
                domain,
                subdomain,
            } => (site, vec![(domain.clone(), subdomain.clone())]),
            SiteEvent::SiteLoaded { site, domains } => (site, domains.clone()),
        };

        for (domain, subdomain) in &domains {
            match self
                .acme
                .check_domain_verification(domain, subdomain.as_deref(), false)
                .await
            {
                Ok(state) => debug!(
                    site = %site,
                    domain = %domain,
                    subdomain = subdomain.as_deref().unwrap_or(""),
                    verified = state == VerificationState::Success,
                    "Domain verification requested"
                ),
                Err(e) => warn!(
                    site = %site,
                    domain = %domain,
                    subdomain = subdomain.as_deref().unwrap_or(""),
                    error = %e,
                    "Domain verification request failed"
                ),
            }
        }

        domains.len()
    }

    /// Consume site events until the bus closes
    pub async fn run(&self, mut events: broadcast::Receiver<SiteEvent>) -> anyhow::Result<()> {
        info!("Site event listener started");
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.handle(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Site event listener lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Site event listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tk_acme::{AcmeError, AcmeResult, DownloadState, SigningRequest};

    #[derive(Default)]
    struct Recording {
        checks: Mutex<Vec<(String, Option<String>, bool)>>,
    }

    #[async_trait]
    impl AcmeClient for Recording {
        async fn check_domain_verification(
            &self,
            domain: &str,
            subdomain: Option<&str>,
            force_challenge: bool,
        ) -> AcmeResult<VerificationState> {
            self.checks.lock().unwrap().push((
                domain.to_string(),
                subdomain.map(str::to_string),
                force_challenge,
            ));
            if domain == "down.test" {
                return Err(AcmeError::ProtocolError("timeout".into()));
            }
            Ok(VerificationState::Pending)
        }

        async fn new_registration(&self) -> AcmeResult<String> {
            Err(AcmeError::Unsupported("registration".into()))
        }

        async fn new_signing_request(
            &self,
            _domains: &[String],
            _key_file: Option<&Path>,
        ) -> AcmeResult<Box<dyn SigningRequest>> {
            Err(AcmeError::Unsupported("signing".into()))
        }

        async fn download_certificate(&self, _uri: &str, _dir: &Path) -> AcmeResult<DownloadState> {
            Err(AcmeError::Unsupported("download".into()))
        }

        fn new_jwt(&self, _payload: &serde_json::Value) -> AcmeResult<String> {
            Err(AcmeError::Unsupported("jwt".into()))
        }

        fn nonce(&self, _value: Option<&str>) {}

        fn revoke_url(&self) -> AcmeResult<String> {
            Err(AcmeError::Unsupported("revoke".into()))
        }
    }

    fn enabled() -> Arc<ComponentStatus> {
        let status = Arc::new(ComponentStatus::new());
        status.set_enabled(true);
        status
    }

    #[tokio::test]
    async fn test_domain_added_is_checked_without_force() {
        let acme = Arc::new(Recording::default());
        let listener = SiteEventListener::new(acme.clone(), enabled());

        let handled = listener
            .handle(&SiteEvent::DomainAdded {
                site: "blog".into(),
                domain: "blog.test".into(),
                subdomain: Some("www".into()),
            })
            .await;

        assert_eq!(handled, 1);
        assert_eq!(
            acme.checks.lock().unwrap().as_slice(),
            &[("blog.test".to_string(), Some("www".to_string()), false)]
        );
    }

    #[tokio::test]
    async fn test_site_loaded_checks_every_domain_despite_errors() {
        let acme = Arc::new(Recording::default());
        let listener = SiteEventListener::new(acme.clone(), enabled());

        let handled = listener
            .handle(&SiteEvent::SiteLoaded {
                site: "shop".into(),
                domains: vec![
                    ("down.test".into(), None),
                    ("shop.test".into(), None),
                    ("shop.test".into(), Some("api".into())),
                ],
            })
            .await;

        assert_eq!(handled, 3);
        assert_eq!(acme.checks.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_component_ignores_events() {
        let acme = Arc::new(Recording::default());
        let listener = SiteEventListener::new(acme.clone(), Arc::new(ComponentStatus::new()));

        let handled = listener
            .handle(&SiteEvent::DomainAdded {
                site: "blog".into(),
                domain: "blog.test".into(),
                subdomain: None,
            })
            .await;

        assert_eq!(handled, 0);
        assert!(acme.checks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_bus_closes() {
        let acme = Arc::new(Recording::default());
        let listener = SiteEventListener::new(acme.clone(), enabled());
        let (tx, rx) = broadcast::channel(8);

        tx.send(SiteEvent::DomainAdded {
            site: "blog".into(),
            domain: "blog.test".into(),
            subdomain: None,
        })
        .unwrap();
        drop(tx);

        listener.run(rx).await.unwrap();
        assert_eq!(acme.checks.lock().unwrap().len(), 1);
    }
}
