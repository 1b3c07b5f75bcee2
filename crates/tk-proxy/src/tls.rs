use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::path::Path;
use std::sync::Arc;
use tk_acme::{AcmeResult, CertificateStore, ParsedCertificate, TlsContextSink};
use tracing::{debug, info, warn};

/// SNI-based certificate resolver for rustls
///
/// Asks the certificate store first, then its default certificate, then the
/// fallback held here (the last default pushed, or a static certificate).
#[derive(Default)]
pub struct SniResolver {
    store: ArcSwapOption<CertificateStore>,
    fallback: ArcSwapOption<CertifiedKey>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("store", &self.store.load().is_some())
            .field("fallback", &self.fallback.load().is_some())
            .finish()
    }
}

impl SniResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_store(&self, store: Arc<CertificateStore>) {
        self.store.store(Some(store));
    }

    pub fn detach_store(&self) {
        self.store.store(None);
    }

    pub fn set_fallback(&self, key: Arc<CertifiedKey>) {
        self.fallback.store(Some(key));
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.load().is_some()
    }

    /// Certificate for `server_name`, `None` when nothing can answer
    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(store) = self.store.load_full() {
            if let Some(key) = server_name.and_then(|name| store.resolve(name)) {
                return Some(key);
            }
            if let Some(key) = store.resolve_default() {
                return Some(key);
            }
        }

        let key = self.fallback.load_full();
        if key.is_none() {
            warn!("No certificate found for SNI: {}", server_name.unwrap_or("<none>"));
        }
        key
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// TLS Manager - owns the SNI resolver and receives default certificate updates
#[derive(Debug, Default)]
pub struct TlsManager {
    /// SNI resolver (shared with the TLS acceptor)
    pub resolver: Arc<SniResolver>,
}

impl TlsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve certificates from `store`
    pub fn attach(&self, store: Arc<CertificateStore>) {
        self.resolver.attach_store(store);
        debug!("Certificate store attached to the TLS resolver");
    }

    /// Load a static certificate served when nothing else matches
    pub fn load_fallback(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        let certificate = ParsedCertificate::load(cert_path, key_path).with_context(|| {
            format!("Failed to load fallback certificate {:?}", cert_path)
        })?;

        if let Err(e) = certificate.check_validity() {
            warn!("Fallback certificate {:?} is not valid: {}", cert_path, e);
        }

        self.resolver.set_fallback(certificate.context());
        info!(
            "Loaded fallback TLS certificate {:?} (expires {})",
            cert_path,
            certificate.not_after()
        );
        Ok(())
    }

    /// Build the rustls ServerConfig with our SNI resolver
    pub fn build_server_config(&self) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

impl TlsContextSink for TlsManager {
    fn install_default(&self, context: Arc<CertifiedKey>) -> AcmeResult<()> {
        self.resolver.set_fallback(context);
        info!("Default TLS certificate updated");
        Ok(())
    }
}
