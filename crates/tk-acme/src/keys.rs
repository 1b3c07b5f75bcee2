use crate::types::{AcmeError, AcmeResult};
use rcgen::KeyPair;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Generate a private key and write it as PEM to `path`.
///
/// Sizes up to 256 bits select ECDSA P-256, anything larger P-384.
pub fn generate_private_key(path: &Path, key_size: u32) -> AcmeResult<()> {
    let algorithm = if key_size <= 256 {
        &rcgen::PKCS_ECDSA_P256_SHA256
    } else {
        if key_size > 384 {
            warn!(
                key_size,
                "Key size looks like an RSA size, generating an ECDSA P-384 key instead"
            );
        }
        &rcgen::PKCS_ECDSA_P384_SHA384
    };

    let key_pair = KeyPair::generate_for(algorithm)
        .map_err(|e| AcmeError::KeyGeneration(format!("Failed to generate key pair: {}", e)))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Read back a PEM private key
pub fn load_private_key(path: &Path) -> AcmeResult<KeyPair> {
    let pem = fs::read_to_string(path)?;
    KeyPair::from_pem(&pem)
        .map_err(|e| AcmeError::ParsingError(format!("Failed to parse private key: {}", e)))
}
