//! Ordered, read-only collection of upstream proxies.

use std::sync::Arc;

use crate::policy::Policy;
use crate::proxy::Proxy;

/// Most upstreams a single edge may forward to.
pub const MAX_UPSTREAMS: usize = 15;

/// Proxies in configuration order plus the policy that reorders them.
///
/// The list is fixed at construction; only per-proxy health changes
/// afterwards.
#[derive(Debug, Default)]
pub struct ProxyPool {
    proxies: Vec<Arc<Proxy>>,
    policy: Policy,
}

impl ProxyPool {
    pub fn new(proxies: Vec<Proxy>, policy: Policy) -> Self {
        Self {
            proxies: proxies.into_iter().map(Arc::new).collect(),
            policy,
        }
    }

    /// The candidates for one query, ordered by the policy.
    pub fn list(&self) -> Vec<Arc<Proxy>> {
        self.policy.order(&self.proxies)
    }

    /// First proxy in configuration order.
    pub fn first(&self) -> Option<&Arc<Proxy>> {
        self.proxies.first()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Proxy>> {
        self.proxies.iter()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}
