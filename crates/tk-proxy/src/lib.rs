//! Bridge between the certificate store and the TLS layer.

pub mod bridge;
pub mod tls;

pub use bridge::SiteEventListener;
pub use tls::{SniResolver, TlsManager};
