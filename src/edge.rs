//! The edge: one site's service table, its forwarder, and the loops that
//! keep both alive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_server::proto::op::Message;
use hickory_server::proto::rr::{Name, RecordType};
use log::{info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{Config, DiscoveryConfig, DEFAULT_PUSH_PORT};
use crate::error::{ConfigError, ForwardError};
use crate::forward::Forwarder;
use crate::listen::TableListener;
use crate::runtime::{DockerServices, ServiceReader, ServiceSource, StaticServices};
use crate::table::ServiceTable;
use crate::types::{EdgeSite, Service};

/// Loops owned by a started edge.
struct Running {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    listener: TableListener,
}

pub struct Edge {
    site: EdgeSite,
    table: ServiceTable,
    forwarder: Option<Arc<Forwarder>>,
    from: Name,
    ignored: Vec<Name>,
    svc_read_interval: Duration,
    svc_push_interval: Duration,
    push_port: u16,
    listen_addr: SocketAddr,
    source: Arc<dyn ServiceSource>,
    lifecycle: Mutex<Option<Running>>,
    shut_down: AtomicBool,
}

impl Edge {
    /// An edge for `site` with no forwarder, serving the root zone and
    /// advertising no services.
    pub fn new(site: EdgeSite) -> Self {
        Self {
            site,
            table: ServiceTable::new(),
            forwarder: None,
            from: Name::root(),
            ignored: Vec::new(),
            svc_read_interval: Duration::from_secs(5),
            svc_push_interval: Duration::from_secs(10),
            push_port: DEFAULT_PUSH_PORT,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PUSH_PORT)),
            source: Arc::new(StaticServices::default()),
            lifecycle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Validate `config` and build the edge it describes.  Nothing is
    /// started.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let forwarder = config.forwarder()?;
        let source: Arc<dyn ServiceSource> = match &config.discovery {
            DiscoveryConfig::Docker { network } => Arc::new(DockerServices::new(network.clone())),
            DiscoveryConfig::Static { services } => Arc::new(StaticServices::new(
                services.iter().cloned().map(Service::new),
            )),
        };

        Ok(Self {
            site: config.site(),
            table: ServiceTable::new(),
            forwarder: Some(Arc::new(forwarder)),
            from: config.zone()?,
            ignored: config.ignored()?,
            svc_read_interval: Duration::from_secs(config.svc_read_interval),
            svc_push_interval: Duration::from_secs(config.svc_push_interval),
            push_port: config.push_port,
            listen_addr: config.push_listen_addr(),
            source,
            lifecycle: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn with_forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = Some(Arc::new(forwarder));
        self
    }

    pub fn with_source(mut self, source: Arc<dyn ServiceSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_zones(mut self, from: Name, ignored: Vec<Name>) -> Self {
        self.from = from;
        self.ignored = ignored;
        self
    }

    /// Seconds-granularity intervals are the configured norm; tests use
    /// shorter ones.
    pub fn with_intervals(mut self, read: Duration, push: Duration) -> Self {
        self.svc_read_interval = read;
        self.svc_push_interval = push;
        self
    }

    /// Where the table-sync listener binds and which port peers are
    /// pushed to.
    pub fn with_push_addr(mut self, listen_addr: SocketAddr, push_port: u16) -> Self {
        self.listen_addr = listen_addr;
        self.push_port = push_port;
        self
    }

    pub fn site(&self) -> &EdgeSite {
        &self.site
    }

    pub fn table(&self) -> &ServiceTable {
        &self.table
    }

    pub fn forwarder(&self) -> Option<&Arc<Forwarder>> {
        self.forwarder.as_ref()
    }

    /// Whether queries for `name` are ours to forward.
    pub fn is_allowed(&self, name: &Name) -> bool {
        self.from.zone_of(name) && !self.ignored.iter().any(|zone| zone.zone_of(name))
    }

    pub async fn forward(&self, query: &Message) -> Result<Message, ForwardError> {
        match &self.forwarder {
            Some(forwarder) => forwarder.forward(query).await,
            None => Err(ForwardError::NoForwarderConfigured),
        }
    }

    pub async fn lookup(
        &self,
        request: &Message,
        name: Name,
        rtype: RecordType,
    ) -> Result<Message, ForwardError> {
        match &self.forwarder {
            Some(forwarder) => forwarder.lookup(request, name, rtype).await,
            None => Err(ForwardError::NoForwarderConfigured),
        }
    }

    /// Start the service reader, the table-sync listener, and per-upstream
    /// health checks and pushes.  Returns the listener's bound address.
    /// Calling it again on a running edge does nothing.  An edge that has
    /// been shut down stays down: its upstreams are closed.
    pub async fn on_startup(&self) -> std::io::Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(std::io::Error::other(format!(
                "edge {} has been shut down",
                self.site.ip
            )));
        }
        if let Some(running) = lifecycle.as_ref() {
            return Ok(running.listener.local_addr());
        }

        let listener = TableListener::bind(self.listen_addr, self.table.clone()).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = ServiceReader::new(self.source.clone(), self.site.clone(), self.table.clone());
        let reader = tokio::spawn(reader.run(self.svc_read_interval, shutdown_rx));

        match &self.forwarder {
            Some(forwarder) => {
                forwarder.start();
                for proxy in forwarder.pool().iter() {
                    proxy.start_pushing_services(
                        self.svc_push_interval,
                        self.site.clone(),
                        self.table.clone(),
                        self.push_port,
                    );
                }
            }
            None => warn!("No forwarder configured, services will not be pushed"),
        }

        let addr = listener.local_addr();
        info!("Edge {} started", self.site.ip);
        *lifecycle = Some(Running {
            shutdown,
            reader,
            listener,
        });
        Ok(addr)
    }

    /// Stop every loop and close every upstream.  Safe to call more than
    /// once and without a prior startup.
    pub async fn on_shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.shut_down.store(true, Ordering::Release);
        if let Some(mut running) = lifecycle.take() {
            let _ = running.shutdown.send(true);
            running.reader.abort();
            running.listener.stop().await;
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.close();
        }
        info!("Edge {} stopped", self.site.ip);
    }

    pub async fn close(&self) {
        self.on_shutdown().await
    }
}
