//! Certificate lifecycle management
//!
//! Keeps a set of certificates signed by an ACME-compatible CA: domain
//! verification sweeps, validation, renewal and re-issuance, and the SNI
//! lookup the TLS layer queries on every handshake.

pub mod certificate;
pub mod client;
pub mod entity;
pub mod keys;
pub mod local;
pub mod scheduler;
pub mod service;
pub mod sni;
pub mod storage;
pub mod store;
pub mod types;

pub use certificate::ParsedCertificate;
pub use client::{AcmeClient, SigningRequest};
pub use entity::CertificateEntity;
pub use local::LocalAuthority;
pub use scheduler::{DomainVerificationScheduler, DomainVerificationState, Reconcile, RunOutcome};
pub use service::AcmeService;
pub use storage::{
    AcmeDocument, CertificateRecord, CertificateRepository, JsonRepository, KeyRecord, file_digest,
};
pub use store::{CertificateStore, TlsContextSink};
pub use types::{
    AcmeConfig, AcmeError, AcmeResult, DownloadState, IssuedCertificate, OrderState, StoreConfig,
    VerificationState,
};
