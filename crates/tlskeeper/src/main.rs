mod supervisor;

use anyhow::Context;
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{ServicePriority, spawn_supervised};
use tk_acme::types::DEFAULT_KEY_ALIAS;
use tk_acme::{AcmeService, CertificateRepository, JsonRepository, LocalAuthority, StoreConfig};
use tk_common::{
    CertificateEvent, ComponentStatus, EnvConfig, EventBus, SharedSiteMap, SiteEvent, SiteMap,
};
use tk_proxy::{SiteEventListener, TlsManager};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, broadcast};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Contact filled in for the local authority when the document has none
const LOCAL_CONTACT: &str = "admin@localhost";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tlskeeper=debug")),
        )
        .init();

    info!("tlskeeper starting...");

    // Install rustls crypto provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    let env = EnvConfig::load(None);
    info!(
        data_dir = %env.data_dir.display(),
        tls_mode = %env.tls_mode,
        "Configuration loaded"
    );

    let events = Arc::new(EventBus::new());
    let status = Arc::new(ComponentStatus::new());

    // ── Persisted document + certificate authority ─────────────────────

    let repository = Arc::new(
        JsonRepository::open(&env.acme_config_path, &env.acme_storage_path)
            .with_context(|| format!("Failed to open {}", env.acme_config_path.display()))?,
    );

    let authority = match env.tls_mode.as_str() {
        "local-ca" => local_authority(&env, &repository)?,
        other => anyhow::bail!("Unsupported TLS mode '{}'", other),
    };

    // ── Site registry ──────────────────────────────────────────────────

    let sites = Arc::new(SharedSiteMap::default());
    let initial_events = sites.replace(SiteMap::load_from_file(&env.sites_config_path)?);
    info!("Site registry loaded ({} sites)", sites.snapshot().sites.len());

    // ── TLS ────────────────────────────────────────────────────────────

    let tls_manager = Arc::new(TlsManager::new());
    if let Some((cert, key)) = env.static_certificate() {
        tls_manager.load_fallback(cert, key)?;
    }
    let tls_config = tls_manager.build_server_config()?;

    // HTTPS listener (Critical)
    let listening = Arc::new(Notify::new());
    {
        let status = status.clone();
        let listening = listening.clone();
        let port = env.https_port;
        spawn_supervised("https", ServicePriority::Critical, move || {
            let status = status.clone();
            let listening = listening.clone();
            let tls_config = tls_config.clone();
            async move { run_https_server(tls_config, port, status, listening).await }
        });
    }

    tokio::time::timeout(Duration::from_secs(10), listening.notified())
        .await
        .context("HTTPS listener did not start")?;

    // ── Certificate management ─────────────────────────────────────────

    let service = Arc::new(
        AcmeService::new(
            repository,
            env.acme_storage_path.clone(),
            authority.clone(),
            sites.clone(),
            status.clone(),
        )
        .with_events(events.certificates.clone())
        .with_tls(tls_manager.clone()),
    );

    // Subscribe before enable so the initial installs are logged
    let certificate_events = events.certificates.subscribe();
    tokio::spawn(log_certificate_events(certificate_events));

    let store = service
        .enable()
        .await
        .context("Failed to enable certificate management")?;
    tls_manager.attach(store);

    // Site events → domain verification (Important)
    {
        let listener = Arc::new(SiteEventListener::new(authority.clone(), status.clone()));
        let bus = events.clone();
        spawn_supervised("site-events", ServicePriority::Important, move || {
            let listener = listener.clone();
            let rx = bus.sites.subscribe();
            async move { listener.run(rx).await }
        });
    }
    publish(&events.sites, initial_events);

    // ── SIGHUP handler ─────────────────────────────────────────────────

    {
        let sites_path = env.sites_config_path.clone();
        let sites = sites.clone();
        let events = events.clone();
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_sighup(sites_path, sites, events, service).await {
                error!("SIGHUP handler error: {}", e);
            }
        });
    }

    info!("tlskeeper started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    if let Err(e) = service.disable() {
        error!("Failed to persist certificate state: {}", e);
    }

    Ok(())
}

/// Build the local development CA and make the document usable with it
fn local_authority(
    env: &EnvConfig,
    repository: &JsonRepository,
) -> anyhow::Result<Arc<LocalAuthority>> {
    let mut config = repository.config();
    if config.email.is_none() || !config.accept_agreement {
        config.email.get_or_insert_with(|| LOCAL_CONTACT.to_string());
        config.accept_agreement = true;
        repository.save_config(&config)?;
        info!("Local CA mode: contact and agreement filled in");
    }

    let store_config = StoreConfig::new(&env.acme_storage_path, &config);
    let authority = LocalAuthority::new(
        env.data_dir.join("ca"),
        store_config.key_path(DEFAULT_KEY_ALIAS),
    );
    authority.init().context("Failed to initialize the local CA")?;

    info!("Local Certificate Authority ready");
    Ok(Arc::new(authority))
}

async fn run_https_server(
    tls_config: Arc<rustls::ServerConfig>,
    port: u16,
    status: Arc<ComponentStatus>,
    listening: Arc<Notify>,
) -> anyhow::Result<()> {
    use tokio_rustls::TlsAcceptor;

    let addr: SocketAddr = format!("[::]:{}", port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls_config);

    status.set_https_running(true);
    listening.notify_one();
    info!("HTTPS listening on {}", addr);

    loop {
        let (tcp_stream, remote_addr) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                warn!("TCP accept error: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let mut tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(s) => s,
                Err(e) => {
                    // TLS handshake failures are common (scanners, invalid SNI)
                    debug!("TLS handshake failed from {}: {}", remote_addr, e);
                    return;
                }
            };

            let sni = tls_stream.get_ref().1.server_name().map(str::to_string);
            debug!(
                remote = %remote_addr,
                sni = sni.as_deref().unwrap_or("<none>"),
                "TLS handshake completed"
            );
            let _ = tls_stream.shutdown().await;
        });
    }
}

fn publish(sender: &broadcast::Sender<SiteEvent>, events: Vec<SiteEvent>) {
    for event in events {
        // No receiver yet is not an error: the next sweep covers it
        let _ = sender.send(event);
    }
}

async fn log_certificate_events(mut rx: broadcast::Receiver<CertificateEvent>) {
    loop {
        match rx.recv().await {
            Ok(CertificateEvent::Installed { key, domains }) => {
                info!(key = %key, domains = ?domains, "Certificate installed")
            }
            Ok(CertificateEvent::DefaultChanged { domains }) => {
                info!(domains = ?domains, "Default certificate changed")
            }
            Ok(CertificateEvent::SigningFailed { key, reason }) => {
                warn!(key = %key, reason = %reason, "Certificate signing failed")
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Certificate event log lagged, {} events skipped", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── SIGHUP handler ─────────────────────────────────────────────────────

async fn handle_sighup(
    sites_path: PathBuf,
    sites: Arc<SharedSiteMap>,
    events: Arc<EventBus>,
    service: Arc<AcmeService>,
) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading site registry...");

            match SiteMap::load_from_file(&sites_path) {
                Ok(next) => {
                    let changes = sites.replace(next);
                    info!("Site registry reloaded ({} changes)", changes.len());
                    publish(&events.sites, changes);
                }
                Err(e) => {
                    error!("Failed to reload site registry: {}", e);
                }
            }

            service.run_now();
        }
    }

    Ok(())
}
