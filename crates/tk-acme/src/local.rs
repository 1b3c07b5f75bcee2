//! Local development authority.
//!
//! Signs certificates with a self-managed root so the daemon runs end to end
//! without reaching a public CA. Every syntactically valid domain counts as
//! verified and revocation is not supported.

use crate::client::{AcmeClient, SigningRequest};
use crate::keys::load_private_key;
use crate::types::{
    AcmeError, AcmeResult, DownloadState, IssuedCertificate, OrderState, VerificationState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const ORGANIZATION: &str = "tlskeeper";
const ROOT_COMMON_NAME: &str = "tlskeeper Local Root CA";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalOrder {
    domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_file: Option<PathBuf>,
}

struct Root {
    cert: Certificate,
    key: KeyPair,
}

pub struct LocalAuthority {
    storage_path: PathBuf,
    /// Key used for requests that do not name one
    domain_key: PathBuf,
    root: Mutex<Option<Root>>,
    orders: Mutex<BTreeMap<String, LocalOrder>>,
}

impl LocalAuthority {
    pub fn new(storage_path: impl AsRef<Path>, domain_key: impl AsRef<Path>) -> Self {
        Self {
            storage_path: storage_path.as_ref().to_path_buf(),
            domain_key: domain_key.as_ref().to_path_buf(),
            root: Mutex::new(None),
            orders: Mutex::new(BTreeMap::new()),
        }
    }

    fn root_cert_path(&self) -> PathBuf {
        self.storage_path.join("root.crt")
    }

    fn root_key_path(&self) -> PathBuf {
        self.storage_path.join("root.key")
    }

    fn orders_path(&self) -> PathBuf {
        self.storage_path.join("orders.json")
    }

    /// Load the root certificate and known orders, creating the root on first run
    pub fn init(&self) -> AcmeResult<()> {
        fs::create_dir_all(&self.storage_path)?;

        let key_path = self.root_key_path();
        let root = if key_path.exists() {
            let key = load_private_key(&key_path)?;
            let cert = root_params(time::OffsetDateTime::now_utc())?
                .self_signed(&key)
                .map_err(|e| {
                    AcmeError::ParsingError(format!("Failed to reconstruct root certificate: {}", e))
                })?;
            debug!(path = %key_path.display(), "Loaded local root CA");
            Root { cert, key }
        } else {
            let key = KeyPair::generate().map_err(|e| {
                AcmeError::KeyGeneration(format!("Failed to generate root key pair: {}", e))
            })?;
            let cert = root_params(time::OffsetDateTime::now_utc())?
                .self_signed(&key)
                .map_err(|e| {
                    AcmeError::KeyGeneration(format!("Failed to generate root certificate: {}", e))
                })?;

            fs::write(self.root_cert_path(), cert.pem())?;
            fs::write(&key_path, key.serialize_pem())?;
            info!(path = %self.root_cert_path().display(), "Generated local root CA");
            Root { cert, key }
        };
        *self.root.lock() = Some(root);

        let orders_path = self.orders_path();
        if orders_path.exists() {
            let content = fs::read_to_string(&orders_path)?;
            *self.orders.lock() = serde_json::from_str(&content)?;
        }

        Ok(())
    }

    fn save_orders(&self, orders: &BTreeMap<String, LocalOrder>) -> AcmeResult<()> {
        let content = serde_json::to_string_pretty(orders)?;
        let path = self.orders_path();
        let temp_path = path.with_extension("json.tmp");

        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Sign `order` and return the PEM chain (leaf then root)
    fn sign(&self, order: &LocalOrder) -> AcmeResult<String> {
        let Some(common_name) = order.domains.first() else {
            return Err(AcmeError::Rejected("No domains provided".into()));
        };

        let mut params = CertificateParams::new(order.domains.clone())
            .map_err(|e| AcmeError::Rejected(format!("Failed to create params: {}", e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let key_file = order.key_file.as_deref().unwrap_or(&self.domain_key);
        let key = load_private_key(key_file)?;

        let root = self.root.lock();
        let root = root
            .as_ref()
            .ok_or_else(|| AcmeError::ConfigError("local authority is not initialized".into()))?;

        let cert = params
            .signed_by(&key, &root.cert, &root.key)
            .map_err(|e| AcmeError::Rejected(format!("Failed to sign certificate: {}", e)))?;

        Ok(format!("{}{}", cert.pem(), root.cert.pem()))
    }
}

#[async_trait]
impl AcmeClient for LocalAuthority {
    async fn check_domain_verification(
        &self,
        domain: &str,
        subdomain: Option<&str>,
        _force_challenge: bool,
    ) -> AcmeResult<VerificationState> {
        let fqdn = match subdomain {
            Some(sub) => format!("{}.{}", sub, domain),
            None => domain.to_string(),
        };

        Ok(if is_valid_domain(&fqdn) {
            VerificationState::Success
        } else {
            VerificationState::Failed
        })
    }

    async fn new_registration(&self) -> AcmeResult<String> {
        Ok(format!("urn:tlskeeper:local:account:{}", uuid::Uuid::new_v4()))
    }

    async fn new_signing_request(
        &self,
        domains: &[String],
        key_file: Option<&Path>,
    ) -> AcmeResult<Box<dyn SigningRequest>> {
        if let Some(invalid) = domains.iter().find(|d| !is_valid_domain(d)) {
            return Ok(Box::new(LocalSigningRequest::failed(format!(
                "invalid domain: {}",
                invalid
            ))));
        }

        let order = LocalOrder {
            domains: domains.to_vec(),
            key_file: key_file.map(Path::to_path_buf),
        };

        let chain = match self.sign(&order) {
            Ok(chain) => chain,
            Err(e) => return Ok(Box::new(LocalSigningRequest::failed(e.to_string()))),
        };

        let uri = format!("urn:tlskeeper:local:order:{}", uuid::Uuid::new_v4());
        {
            let mut orders = self.orders.lock();
            orders.insert(uri.clone(), order);
            self.save_orders(&orders)?;
        }

        debug!(uri = %uri, domains = ?domains, "Local certificate signed");
        Ok(Box::new(LocalSigningRequest {
            state: OrderState::Success,
            chain: Some(chain),
            uri,
            message: "certificate issued".into(),
        }))
    }

    async fn download_certificate(&self, uri: &str, dir: &Path) -> AcmeResult<DownloadState> {
        let order = self.orders.lock().get(uri).cloned();
        let Some(order) = order else {
            return Ok(DownloadState::Failed(format!("unknown order {}", uri)));
        };

        let chain = self.sign(&order)?;
        let path = write_chain(dir, &chain)?;
        Ok(DownloadState::Issued(path))
    }

    fn new_jwt(&self, _payload: &serde_json::Value) -> AcmeResult<String> {
        Err(AcmeError::Unsupported("the local authority does not sign JWS".into()))
    }

    fn nonce(&self, _value: Option<&str>) {}

    fn revoke_url(&self) -> AcmeResult<String> {
        Err(AcmeError::Unsupported("the local authority does not revoke certificates".into()))
    }
}

struct LocalSigningRequest {
    state: OrderState,
    chain: Option<String>,
    uri: String,
    message: String,
}

impl LocalSigningRequest {
    fn failed(message: String) -> Self {
        Self {
            state: OrderState::Failed,
            chain: None,
            uri: String::new(),
            message,
        }
    }
}

#[async_trait]
impl SigningRequest for LocalSigningRequest {
    fn state(&self) -> OrderState {
        self.state
    }

    async fn wait(&mut self) -> OrderState {
        self.state
    }

    async fn save(&mut self, dir: &Path) -> AcmeResult<IssuedCertificate> {
        let chain = self
            .chain
            .as_deref()
            .ok_or_else(|| AcmeError::Rejected(self.message.clone()))?;

        Ok(IssuedCertificate {
            path: write_chain(dir, chain)?,
            uri: self.uri.clone(),
        })
    }

    fn last_message(&self) -> String {
        self.message.clone()
    }
}

fn write_chain(dir: &Path, chain: &str) -> AcmeResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join("fullchain.pem");
    fs::write(&path, chain)?;
    Ok(path)
}

fn root_params(now: time::OffsetDateTime) -> AcmeResult<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| AcmeError::KeyGeneration(format!("Failed to create params: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.not_before = now;
    params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

    Ok(params)
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    let name = domain.strip_prefix("*.").unwrap_or(domain);
    !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::ParsedCertificate;
    use crate::keys::generate_private_key;

    fn authority(dir: &Path) -> LocalAuthority {
        let domain_key = dir.join("data/domain.key");
        generate_private_key(&domain_key, 256).unwrap();
        let authority = LocalAuthority::new(dir.join("ca"), &domain_key);
        authority.init().unwrap();
        authority
    }

    #[test]
    fn test_is_valid_domain() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("sub.example.com"));
        assert!(is_valid_domain("*.example.com"));
        assert!(is_valid_domain("test-123.example.com"));

        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("-example.com"));
        assert!(!is_valid_domain("example-.com"));
        assert!(!is_valid_domain("*."));
        assert!(!is_valid_domain("example..com"));
    }

    #[tokio::test]
    async fn test_sign_then_download_again() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority(dir.path());

        let mut request = authority
            .new_signing_request(&["example.com".into(), "www.example.com".into()], None)
            .await
            .unwrap();
        assert_eq!(request.wait().await, OrderState::Success);

        let out = dir.path().join("data/default");
        let issued = request.save(&out).await.unwrap();
        assert_eq!(issued.path, out.join("fullchain.pem"));

        let parsed =
            ParsedCertificate::load(&issued.path, &dir.path().join("data/domain.key")).unwrap();
        assert_eq!(parsed.subject_alt_dns_names(), &["example.com", "www.example.com"]);
        assert!(parsed.days_remaining() >= 89);

        let first = fs::read(&issued.path).unwrap();
        let state = authority
            .download_certificate(&issued.uri, &out)
            .await
            .unwrap();
        assert_eq!(state, DownloadState::Issued(out.join("fullchain.pem")));
        assert_ne!(first, fs::read(&issued.path).unwrap());
    }

    #[tokio::test]
    async fn test_orders_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let uri = {
            let authority = authority(dir.path());
            let mut request = authority
                .new_signing_request(&["example.com".into()], None)
                .await
                .unwrap();
            request.save(&dir.path().join("out")).await.unwrap().uri
        };

        let authority = LocalAuthority::new(dir.path().join("ca"), dir.path().join("data/domain.key"));
        authority.init().unwrap();
        let state = authority
            .download_certificate(&uri, &dir.path().join("out"))
            .await
            .unwrap();
        assert!(matches!(state, DownloadState::Issued(_)));

        let state = authority
            .download_certificate("urn:tlskeeper:local:order:unknown", &dir.path().join("out"))
            .await
            .unwrap();
        assert!(matches!(state, DownloadState::Failed(_)));
    }

    #[tokio::test]
    async fn test_invalid_domain_fails_order() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority(dir.path());

        assert_eq!(
            authority
                .check_domain_verification("bad..name", None, false)
                .await
                .unwrap(),
            VerificationState::Failed
        );

        let mut request = authority
            .new_signing_request(&["-bad.example".into()], None)
            .await
            .unwrap();
        assert_eq!(request.wait().await, OrderState::Failed);
        assert!(request.last_message().contains("-bad.example"));
        assert!(request.save(dir.path()).await.is_err());
        assert!(authority.revoke_url().is_err());
    }
}
