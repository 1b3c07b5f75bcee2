use std::sync::atomic::{AtomicBool, Ordering};

/// État partagé du composant ACME, consulté par le planificateur
///
/// `enabled` is flipped by the owning service's enable/disable hooks,
/// `https_running` by the HTTPS listener once it is bound.
#[derive(Debug, Default)]
pub struct ComponentStatus {
    enabled: AtomicBool,
    https_running: AtomicBool,
}

impl ComponentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_https_running(&self) -> bool {
        self.https_running.load(Ordering::Acquire)
    }

    pub fn set_https_running(&self, running: bool) {
        self.https_running.store(running, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_defaults_to_stopped() {
        let status = ComponentStatus::new();
        assert!(!status.is_enabled());
        assert!(!status.is_https_running());

        status.set_enabled(true);
        status.set_https_running(true);
        assert!(status.is_enabled());
        assert!(status.is_https_running());
    }
}
