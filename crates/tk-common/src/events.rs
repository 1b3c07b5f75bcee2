use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Bus d'événements pour la communication inter-services
pub struct EventBus {
    /// Changements du registre des sites (registre → pont ACME)
    pub sites: broadcast::Sender<SiteEvent>,
    /// Certificats émis ou remplacés (store → journalisation, TLS)
    pub certificates: broadcast::Sender<CertificateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sites: broadcast::channel(256).0,
            certificates: broadcast::channel(64).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SiteEvent {
    /// A domain (or a subdomain of it) was mapped to a site
    DomainAdded {
        site: String,
        domain: String,
        subdomain: Option<String>,
    },
    /// A site was (re)loaded with its full domain map
    SiteLoaded {
        site: String,
        domains: Vec<(String, Option<String>)>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CertificateEvent {
    Installed { key: String, domains: Vec<String> },
    DefaultChanged { domains: Vec<String> },
    SigningFailed { key: String, reason: String },
}
