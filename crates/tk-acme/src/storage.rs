//! Persisted document: CA settings, private key registry and certificate records.

use crate::types::{AcmeConfig, AcmeResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Registered private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub file: PathBuf,
    /// Hex SHA-256 of the key file (historical field name)
    #[serde(rename = "md5", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Persisted state of one certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// Alias of the private key in the key registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "md5", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Sites served by this certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcmeDocument {
    #[serde(default)]
    pub config: AcmeConfig,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyRecord>,
    #[serde(default)]
    pub certificates: BTreeMap<String, CertificateRecord>,
}

/// Where the store keeps its metadata
pub trait CertificateRepository: Send + Sync {
    fn load(&self) -> AcmeResult<AcmeDocument>;

    fn save_record(&self, key: &str, record: &CertificateRecord) -> AcmeResult<()>;

    fn save_key(&self, alias: &str, record: &KeyRecord) -> AcmeResult<()>;

    fn save_config(&self, config: &AcmeConfig) -> AcmeResult<()>;
}

/// JSON file repository; every save rewrites the whole document atomically
pub struct JsonRepository {
    path: PathBuf,
    /// Paths under this root are stored relative to it
    root: PathBuf,
    document: Mutex<AcmeDocument>,
}

impl JsonRepository {
    /// Open the document at `path`; a missing file is an empty document
    pub fn open(path: impl AsRef<Path>, root: impl AsRef<Path>) -> AcmeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let root = root.as_ref().to_path_buf();

        let document = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            AcmeDocument::default()
        };

        Ok(Self {
            path,
            root,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> AcmeConfig {
        self.document.lock().config.clone()
    }

    fn write(&self, document: &AcmeDocument) -> AcmeResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(document)?;
        let temp_path = self.path.with_extension("json.tmp");

        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl CertificateRepository for JsonRepository {
    fn load(&self) -> AcmeResult<AcmeDocument> {
        let mut document = self.document.lock().clone();

        for key in document.keys.values_mut() {
            key.file = self.absolute(&key.file);
        }
        for record in document.certificates.values_mut() {
            if let Some(file) = record.cert_file.take() {
                record.cert_file = Some(self.absolute(&file));
            }
        }

        Ok(document)
    }

    fn save_record(&self, key: &str, record: &CertificateRecord) -> AcmeResult<()> {
        let mut stored = record.clone();
        if let Some(file) = stored.cert_file.take() {
            stored.cert_file = Some(self.relative(&file));
        }

        let mut document = self.document.lock();
        if document.certificates.get(key) == Some(&stored) {
            return Ok(());
        }
        document.certificates.insert(key.to_string(), stored);
        self.write(&document)
    }

    fn save_key(&self, alias: &str, record: &KeyRecord) -> AcmeResult<()> {
        let stored = KeyRecord {
            file: self.relative(&record.file),
            hash: record.hash.clone(),
        };

        let mut document = self.document.lock();
        if document.keys.get(alias) == Some(&stored) {
            return Ok(());
        }
        document.keys.insert(alias.to_string(), stored);
        self.write(&document)
    }

    fn save_config(&self, config: &AcmeConfig) -> AcmeResult<()> {
        let mut document = self.document.lock();
        document.config = config.clone();
        self.write(&document)
    }
}

/// Hex SHA-256 digest of a file's content
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let content = fs::read(path)?;
    let digest = ring::digest::digest(&ring::digest::SHA256, &content);
    Ok(hex::encode(digest.as_ref()))
}
