//! SNI lookup structure: a trie over reversed domain labels.
//!
//! `www.example.com` is stored under `com` → `example` → `www`. A lookup
//! returns the deepest certificate on the path, so a certificate for
//! `example.com` also answers `sub.example.com` when nothing more specific
//! exists. `*.parent` entries answer for one label directly under `parent`.

use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    context: Option<Arc<CertifiedKey>>,
    wildcard: Option<Arc<CertifiedKey>>,
}

#[derive(Default)]
pub struct SniIndex {
    root: Node,
    entries: usize,
}

impl SniIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hostname`. The first certificate inserted for a name keeps it.
    pub fn insert(&mut self, hostname: &str, context: Arc<CertifiedKey>) {
        let Some(host) = normalize(hostname) else {
            return;
        };

        let (wildcard, name) = match host.strip_prefix("*.") {
            Some(parent) => (true, parent),
            None => (false, host.as_str()),
        };

        let mut node = &mut self.root;
        for label in name.rsplit('.') {
            node = node.children.entry(label.to_string()).or_default();
        }

        let slot = if wildcard { &mut node.wildcard } else { &mut node.context };
        if slot.is_none() {
            *slot = Some(context);
            self.entries += 1;
        }
    }

    /// Longest match for `hostname`
    pub fn lookup(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        let host = normalize(hostname)?;
        let labels: Vec<&str> = host.rsplit('.').collect();

        let mut node = &self.root;
        let mut best = None;

        for (depth, label) in labels.iter().enumerate() {
            let leftmost = depth + 1 == labels.len();
            let child = node.children.get(*label);

            if leftmost {
                if let Some(context) = child.and_then(|c| c.context.as_ref()) {
                    return Some(Arc::clone(context));
                }
                if let Some(context) = &node.wildcard {
                    return Some(Arc::clone(context));
                }
                break;
            }

            let Some(child) = child else {
                break;
            };
            if let Some(context) = &child.context {
                best = Some(context);
            }
            node = child;
        }

        best.map(Arc::clone)
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

fn normalize(hostname: &str) -> Option<String> {
    let host = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.split('.').any(str::is_empty) {
        return None;
    }
    Some(host)
}
