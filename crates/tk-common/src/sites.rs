//! Site registry: which base domains and subdomains belong to which site.

use crate::error::AppError;
use crate::events::SiteEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Base domain → subdomain labels mapped under it
pub type DomainMap = BTreeMap<String, BTreeSet<String>>;

/// One `(site, baseDomain[, subdomain])` entry of the registry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SiteDomain {
    pub site: String,
    pub domain: String,
    pub subdomain: Option<String>,
}

impl SiteDomain {
    /// Fully-qualified name, e.g. `www.example.com`
    pub fn full_domain(&self) -> String {
        match &self.subdomain {
            Some(sub) => format!("{}.{}", sub, self.domain),
            None => self.domain.clone(),
        }
    }
}

/// Read access to the site/domain registry
pub trait SiteRegistry: Send + Sync {
    /// Domain map of a single site, `None` when the site is unknown
    fn site_domains(&self, site: &str) -> Option<DomainMap>;

    /// Every `(site, domain)` and `(site, domain, subdomain)` entry
    fn domains(&self) -> Vec<SiteDomain>;
}

/// Registry content as stored in `sites.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteMap {
    #[serde(default)]
    pub sites: BTreeMap<String, DomainMap>,
}

impl SiteMap {
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), AppError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Events describing what `next` adds on top of `self`
    pub fn diff(&self, next: &SiteMap) -> Vec<SiteEvent> {
        let mut events = Vec::new();

        for (site, domains) in &next.sites {
            let Some(previous) = self.sites.get(site) else {
                events.push(SiteEvent::SiteLoaded {
                    site: site.clone(),
                    domains: flatten(domains),
                });
                continue;
            };

            for (domain, subdomain) in flatten(domains) {
                let known = match &subdomain {
                    Some(sub) => previous.get(&domain).is_some_and(|s| s.contains(sub)),
                    None => previous.contains_key(&domain),
                };
                if !known {
                    events.push(SiteEvent::DomainAdded {
                        site: site.clone(),
                        domain,
                        subdomain,
                    });
                }
            }
        }

        events
    }
}

impl SiteRegistry for SiteMap {
    fn site_domains(&self, site: &str) -> Option<DomainMap> {
        self.sites.get(site).cloned()
    }

    fn domains(&self) -> Vec<SiteDomain> {
        self.sites
            .iter()
            .flat_map(|(site, domains)| {
                flatten(domains)
                    .into_iter()
                    .map(move |(domain, subdomain)| SiteDomain {
                        site: site.clone(),
                        domain,
                        subdomain,
                    })
            })
            .collect()
    }
}

/// Site map shared between the registry loader (SIGHUP) and its readers
#[derive(Debug, Default)]
pub struct SharedSiteMap {
    inner: RwLock<SiteMap>,
}

impl SharedSiteMap {
    pub fn new(map: SiteMap) -> Self {
        Self {
            inner: RwLock::new(map),
        }
    }

    /// Swap in a new map and return the events for what it added
    pub fn replace(&self, next: SiteMap) -> Vec<SiteEvent> {
        let mut guard = self.inner.write();
        let events = guard.diff(&next);
        *guard = next;
        events
    }

    pub fn snapshot(&self) -> SiteMap {
        self.inner.read().clone()
    }
}

impl SiteRegistry for SharedSiteMap {
    fn site_domains(&self, site: &str) -> Option<DomainMap> {
        self.inner.read().site_domains(site)
    }

    fn domains(&self) -> Vec<SiteDomain> {
        self.inner.read().domains()
    }
}

fn flatten(domains: &DomainMap) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    for (domain, subs) in domains {
        out.push((domain.clone(), None));
        for sub in subs {
            out.push((domain.clone(), Some(sub.clone())));
        }
    }
    out
}
