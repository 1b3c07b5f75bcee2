//! Parsed certificate/key pair, the unit served to the TLS layer.

use crate::types::{AcmeError, AcmeResult};
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use x509_parser::extensions::GeneralName;

/// Certificate chain and private key ready for a handshake, plus the
/// leaf metadata the lifecycle checks need.
#[derive(Debug)]
pub struct ParsedCertificate {
    context: Arc<CertifiedKey>,
    leaf: CertificateDer<'static>,
    dns_names: Vec<String>,
    common_name: Option<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl ParsedCertificate {
    /// Load a PEM chain and its private key from disk
    pub fn load(cert_file: &Path, key_file: &Path) -> AcmeResult<Self> {
        let certs = load_certs(&mut BufReader::new(File::open(cert_file)?))?;
        let key = load_private_key(&mut BufReader::new(File::open(key_file)?))?;
        Self::from_parts(certs, key)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> AcmeResult<Self> {
        let certs = load_certs(&mut cert_pem.as_bytes())?;
        let key = load_private_key(&mut key_pem.as_bytes())?;
        Self::from_parts(certs, key)
    }

    fn from_parts(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> AcmeResult<Self> {
        let leaf = certs[0].clone();

        let (dns_names, common_name, not_before, not_after) = {
            let (_, x509) = x509_parser::parse_x509_certificate(leaf.as_ref())
                .map_err(|e| AcmeError::ParsingError(format!("Failed to parse certificate: {}", e)))?;

            let dns_names = match x509.subject_alternative_name() {
                Ok(Some(san)) => san
                    .value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_lowercase()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };

            let common_name = x509
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string);

            let validity = x509.validity();
            (
                dns_names,
                common_name,
                timestamp(validity.not_before.timestamp())?,
                timestamp(validity.not_after.timestamp())?,
            )
        };

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| AcmeError::ParsingError(format!("Failed to parse signing key: {}", e)))?;

        Ok(Self {
            context: Arc::new(CertifiedKey::new(certs, signing_key)),
            leaf,
            dns_names,
            common_name,
            not_before,
            not_after,
        })
    }

    /// Fails when the current time is outside the validity window
    pub fn check_validity(&self) -> AcmeResult<()> {
        let now = Utc::now();
        if now < self.not_before {
            return Err(AcmeError::InvalidCertificate(format!(
                "not valid before {}",
                self.not_before
            )));
        }
        if now > self.not_after {
            return Err(AcmeError::InvalidCertificate(format!(
                "expired on {}",
                self.not_after
            )));
        }
        Ok(())
    }

    /// Whole days until expiry, negative once expired
    pub fn days_remaining(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }

    pub fn subject_alt_dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Handshake context handed to rustls
    pub fn context(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.context)
    }

    /// DER encoding of the leaf certificate
    pub fn encoded(&self) -> &[u8] {
        self.leaf.as_ref()
    }

    /// Names this certificate is served under: every SAN, plus the common
    /// name when it is a hostname rather than a display label
    pub fn served_names(&self) -> Vec<String> {
        let mut names = self.dns_names.clone();
        if let Some(cn) = &self.common_name {
            if !cn.is_empty() && !cn.contains(' ') {
                names.push(cn.to_lowercase());
            }
        }
        names
    }
}

fn timestamp(secs: i64) -> AcmeResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AcmeError::ParsingError(format!("Invalid validity timestamp: {}", secs)))
}

fn load_certs(reader: &mut dyn BufRead) -> AcmeResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(AcmeError::ParsingError("No certificates found in file".into()));
    }

    Ok(certs)
}

fn load_private_key(reader: &mut dyn BufRead) -> AcmeResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(reader)?
        .ok_or_else(|| AcmeError::ParsingError("No private key found in file".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn mint(names: &[&str], common_name: &str, days: i64) -> (String, String) {
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(days);

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_parse_names_and_validity() {
        let (cert, key) = mint(&["example.com", "www.example.com"], "example.com", 60);
        let parsed = ParsedCertificate::from_pem(&cert, &key).unwrap();

        assert_eq!(parsed.subject_alt_dns_names(), &["example.com", "www.example.com"]);
        assert_eq!(parsed.common_name(), Some("example.com"));
        assert!(parsed.check_validity().is_ok());
        assert!((58..=60).contains(&parsed.days_remaining()));
        assert!(!parsed.encoded().is_empty());
    }

    #[test]
    fn test_display_common_name_is_not_served() {
        let (cert, key) = mint(&["example.com"], "Example Web Server", 30);
        let parsed = ParsedCertificate::from_pem(&cert, &key).unwrap();
        assert_eq!(parsed.served_names(), vec!["example.com"]);
    }

    #[test]
    fn test_expired_certificate_fails_validity() {
        let (cert, key) = mint(&["old.example.com"], "old.example.com", -2);
        let parsed = ParsedCertificate::from_pem(&cert, &key).unwrap();
        assert!(parsed.check_validity().is_err());
        assert!(parsed.days_remaining() < 0);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let (cert, _) = mint(&["example.com"], "example.com", 30);
        assert!(ParsedCertificate::from_pem(&cert, "").is_err());
        assert!(ParsedCertificate::from_pem("", &cert).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = ParsedCertificate::load(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(result.is_err());
    }
}
