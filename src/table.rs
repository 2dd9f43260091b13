//! Replicated table of the services advertised by each edge site.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use tokio::sync::RwLock;

use crate::types::{EdgeSite, EventType, Service, ServiceTableUpdate};

/// Thread-safe mapping from site to the set of services it advertises.
///
/// Cloning is cheap and every clone shares the same table.  Each call
/// takes the lock once; nothing is held across network I/O, callers
/// get owned copies back.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    inner: Arc<RwLock<HashMap<EdgeSite, HashSet<Service>>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `service` under `site`.  Returns false if it was already present.
    pub async fn add(&self, site: EdgeSite, service: Service) -> bool {
        let mut map = self.inner.write().await;
        map.entry(site).or_default().insert(service)
    }

    /// Remove `service` from `site`.  Returns false if it was absent.
    ///
    /// The site key stays in the table even when its last service goes.
    pub async fn remove(&self, site: &EdgeSite, service: &Service) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(site) {
            Some(services) => services.remove(service),
            None => false,
        }
    }

    /// Fold one peer update into the table.
    pub async fn apply(&self, update: ServiceTableUpdate) -> bool {
        let ServiceTableUpdate { meta, event } = update;
        let changed = match event.kind {
            EventType::Add => self.add(meta.clone(), event.service).await,
            EventType::Delete => self.remove(&meta, &event.service).await,
        };
        debug!(
            "Applied {:?} from {} (changed: {})",
            event.kind, meta.ip, changed
        );
        changed
    }

    /// Services advertised by `site`, or `None` if the site was never seen.
    pub async fn services(&self, site: &EdgeSite) -> Option<HashSet<Service>> {
        let map = self.inner.read().await;
        map.get(site).cloned()
    }

    /// Look a site up by IP alone.
    pub async fn services_by_ip(&self, ip: &str) -> Option<HashSet<Service>> {
        let map = self.inner.read().await;
        map.iter()
            .find(|(site, _)| site.ip == ip)
            .map(|(_, services)| services.clone())
    }

    pub async fn sites(&self) -> Vec<EdgeSite> {
        let map = self.inner.read().await;
        map.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> HashMap<EdgeSite, HashSet<Service>> {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn site() -> EdgeSite {
        EdgeSite::new("10.0.0.2", 1.0, 2.0)
    }

    fn svc(name: &str) -> Service {
        Service::new(json!({ "name": name }))
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let table = ServiceTable::new();
        assert!(table.add(site(), svc("a")).await);
        assert!(!table.add(site(), svc("a")).await);

        let services = table.services(&site()).await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services.contains(&svc("a")));
    }

    #[tokio::test]
    async fn remove_absent_is_noop() {
        let table = ServiceTable::new();
        assert!(!table.remove(&site(), &svc("a")).await);
        assert!(table.services(&site()).await.is_none());

        table.add(site(), svc("a")).await;
        assert!(!table.remove(&site(), &svc("b")).await);
        assert_eq!(table.services(&site()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removing_last_service_keeps_site() {
        let table = ServiceTable::new();
        table.add(site(), svc("a")).await;
        assert!(table.remove(&site(), &svc("a")).await);

        let services = table.services(&site()).await.unwrap();
        assert!(services.is_empty());
        assert_eq!(table.sites().await, vec![site()]);
    }

    #[tokio::test]
    async fn sites_differing_in_coords_are_distinct() {
        let table = ServiceTable::new();
        table.add(EdgeSite::new("10.0.0.2", 1.0, 2.0), svc("a")).await;
        table.add(EdgeSite::new("10.0.0.2", 1.0, 3.0), svc("a")).await;
        assert_eq!(table.sites().await.len(), 2);
    }

    #[tokio::test]
    async fn apply_dispatches_on_event_type() {
        let table = ServiceTable::new();
        table.apply(ServiceTableUpdate::add(site(), svc("a"))).await;
        table.apply(ServiceTableUpdate::add(site(), svc("b"))).await;
        table.apply(ServiceTableUpdate::delete(site(), svc("a"))).await;

        let services = table.services_by_ip("10.0.0.2").await.unwrap();
        assert_eq!(services, [svc("b")].into_iter().collect());
    }

    #[tokio::test]
    async fn concurrent_adds_all_land() {
        let table = ServiceTable::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.add(site(), svc(&format!("svc-{i}"))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(table.services(&site()).await.unwrap().len(), 32);
    }
}
