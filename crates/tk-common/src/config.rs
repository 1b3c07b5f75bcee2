use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration principale chargée depuis les variables d'environnement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Répertoire des données applicatives
    pub data_dir: PathBuf,
    /// Répertoire ACME (certificats, clés, sous-dossiers par certificat)
    pub acme_storage_path: PathBuf,
    /// Document JSON persistant (config CA, clés, certificats)
    pub acme_config_path: PathBuf,
    /// Registre des sites et de leurs domaines
    pub sites_config_path: PathBuf,
    /// Port d'écoute HTTPS
    pub https_port: u16,
    /// Certificat statique servi quand aucun certificat géré ne correspond
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Mode TLS : "local-ca" (autorité locale de développement)
    pub tls_mode: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tlskeeper"),
            acme_storage_path: PathBuf::from("/var/lib/tlskeeper/acme"),
            acme_config_path: PathBuf::from("/var/lib/tlskeeper/acme.json"),
            sites_config_path: PathBuf::from("/var/lib/tlskeeper/sites.json"),
            https_port: 443,
            tls_cert_path: None,
            tls_key_path: None,
            tls_mode: "local-ca".to_string(),
        }
    }
}

impl EnvConfig {
    /// Charge la configuration depuis les variables d'environnement
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(&v);
            config.acme_storage_path = config.data_dir.join("acme");
            config.acme_config_path = config.data_dir.join("acme.json");
            config.sites_config_path = config.data_dir.join("sites.json");
        }
        if let Ok(v) = std::env::var("ACME_STORAGE_PATH") {
            config.acme_storage_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ACME_CONFIG_PATH") {
            config.acme_config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SITES_CONFIG_PATH") {
            config.sites_config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HTTPS_PORT") {
            if let Ok(port) = v.parse() {
                config.https_port = port;
            }
        }
        if let Ok(v) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("TLS_MODE") {
            config.tls_mode = v.to_lowercase();
        }

        config
    }

    /// Charge le fichier .env puis les variables d'environnement
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            // Chercher .env dans le répertoire courant ou /etc/tlskeeper
            let candidates = [
                PathBuf::from("/etc/tlskeeper/.env"),
                PathBuf::from(".env"),
            ];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    /// Certificat statique de secours, si les deux chemins sont configurés
    pub fn static_certificate(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Charge un fichier .env basique (KEY=VALUE par ligne)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}
