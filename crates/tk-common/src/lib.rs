pub mod config;
pub mod error;
pub mod events;
pub mod sites;
pub mod state;

pub use config::EnvConfig;
pub use error::AppError;
pub use events::{CertificateEvent, EventBus, SiteEvent};
pub use sites::{DomainMap, SharedSiteMap, SiteDomain, SiteMap, SiteRegistry};
pub use state::ComponentStatus;
