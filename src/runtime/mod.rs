use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::table::ServiceTable;
use crate::types::{EdgeSite, Service};

pub mod docker;
pub use docker::DockerServices;

/// Reports the services currently running at this site.
#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn services(&self) -> Result<HashSet<Service>>;
}

/// A service set fixed in configuration or replaced programmatically.
#[derive(Debug, Clone, Default)]
pub struct StaticServices {
    services: Arc<RwLock<HashSet<Service>>>,
}

impl StaticServices {
    pub fn new(services: impl IntoIterator<Item = Service>) -> Self {
        Self {
            services: Arc::new(RwLock::new(services.into_iter().collect())),
        }
    }

    /// Replace the advertised set.
    pub fn set(&self, services: impl IntoIterator<Item = Service>) {
        if let Ok(mut current) = self.services.write() {
            *current = services.into_iter().collect();
        }
    }
}

#[async_trait]
impl ServiceSource for StaticServices {
    async fn services(&self) -> Result<HashSet<Service>> {
        self.services
            .read()
            .map(|s| s.clone())
            .map_err(|_| anyhow::anyhow!("static service set poisoned"))
    }
}

/// Mirrors a [`ServiceSource`] into the local site's table entry.
pub struct ServiceReader {
    source: Arc<dyn ServiceSource>,
    site: EdgeSite,
    table: ServiceTable,
    observed: HashSet<Service>,
}

impl ServiceReader {
    pub fn new(source: Arc<dyn ServiceSource>, site: EdgeSite, table: ServiceTable) -> Self {
        Self {
            source,
            site,
            table,
            observed: HashSet::new(),
        }
    }

    /// Poll the source once and apply the difference to the table.
    /// Returns the number of (added, deleted) services.
    pub async fn read_once(&mut self) -> Result<(usize, usize)> {
        let current = self.source.services().await?;

        let mut added = 0;
        for service in current.difference(&self.observed) {
            info!("Service appeared at {}: {}", self.site.ip, service.as_value());
            self.table.add(self.site.clone(), service.clone()).await;
            added += 1;
        }
        let mut deleted = 0;
        for service in self.observed.difference(&current) {
            info!("Service disappeared at {}: {}", self.site.ip, service.as_value());
            self.table.remove(&self.site, service).await;
            deleted += 1;
        }

        self.observed = current;
        Ok((added, deleted))
    }

    /// Poll every `interval` until `shutdown` flips.  The first poll is immediate.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if interval.is_zero() {
            warn!("Service read interval is zero, not reading local services");
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now(), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.read_once().await {
                        warn!("Failed to read local services: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Service reader stopped");
                    return;
                }
            }
        }
    }
}
