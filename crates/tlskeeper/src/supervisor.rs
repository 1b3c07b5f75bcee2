use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Durée de fonctionnement après laquelle le compteur de redémarrages repart à zéro
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// Priorité d'un service, détermine le comportement de restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePriority {
    /// Listener HTTPS : restart immédiat, retries illimités
    Critical,
    /// Pont d'événements, journal des certificats : backoff, max 10 retries
    Important,
}

impl ServicePriority {
    fn max_retries(self) -> u32 {
        match self {
            Self::Critical => u32::MAX,
            Self::Important => 10,
        }
    }

    fn backoff(self, retry: u32) -> Duration {
        match self {
            Self::Critical => Duration::from_millis(100 * retry as u64),
            Self::Important => Duration::from_secs(retry as u64),
        }
    }
}

/// Lance un service supervisé dans une tâche tokio
///
/// Le service est redémarré en cas d'erreur ou de panic, selon sa priorité.
/// Une sortie `Ok(())` termine la supervision.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    priority: ServicePriority,
    factory: F,
) -> JoinHandle<u32>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let max_retries = priority.max_retries();
        let mut retries: u32 = 0;
        let mut restarts: u32 = 0;

        loop {
            info!(service = name, "[supervisor] Starting service");
            let started = Instant::now();

            let f = Arc::clone(&factory);
            match tokio::spawn(async move { f().await }).await {
                Ok(Ok(())) => {
                    info!(service = name, "[supervisor] Service exited cleanly");
                    break;
                }
                Ok(Err(e)) => error!(service = name, "[supervisor] Service failed: {e:#}"),
                Err(join_error) => {
                    error!(service = name, "[supervisor] Service panicked: {join_error}")
                }
            }

            if started.elapsed() > STABLE_AFTER {
                retries = 0;
            }
            retries = retries.saturating_add(1);

            if retries > max_retries {
                error!(
                    service = name,
                    "[supervisor] Exceeded max retries ({max_retries}), giving up"
                );
                break;
            }

            let backoff = priority.backoff(retries);
            warn!(
                service = name,
                "[supervisor] Restarting in {backoff:?} (attempt {retries}/{max_retries})"
            );
            tokio::time::sleep(backoff).await;
            restarts += 1;
        }

        restarts
    })
}
