//! One upstream resolver: health state, transport, background loops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_server::proto::op::{Message, Query};
use hickory_server::proto::rr::{Name, RecordType};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::TransportError;
use crate::push::Pusher;
use crate::table::ServiceTable;
use crate::transport::{exchange_udp, ConnPool, TlsSettings, Transport};
use crate::types::EdgeSite;

/// Default lifetime of an idle pooled connection.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);

/// Default bound on a single exchange with the upstream.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Health of a proxy relative to a `max_fails` threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Up,
    Suspect,
    Down,
}

pub struct Proxy {
    addr: SocketAddr,
    tls: Option<TlsSettings>,
    timeout: Duration,
    fails: AtomicU32,
    conns: ConnPool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .field("fails", &self.fails())
            .finish()
    }
}

impl Proxy {
    /// Create a proxy for `addr`.  Passing TLS settings makes it a TLS upstream.
    pub fn new(addr: SocketAddr, tls: Option<TlsSettings>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            addr,
            tls,
            timeout: DEFAULT_TIMEOUT,
            fails: AtomicU32::new(0),
            conns: ConnPool::new(addr, DEFAULT_EXPIRE),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_tls(&mut self, tls: TlsSettings) {
        self.tls = Some(tls);
    }

    pub fn set_expire(&mut self, expire: Duration) {
        self.conns.set_expire(expire);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Whether the proxy has failed at least `max_fails` times in a row.
    /// A threshold of 0 disables the check.
    pub fn down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.fails() >= max_fails
    }

    pub fn health(&self, max_fails: u32) -> Health {
        if self.down(max_fails) {
            Health::Down
        } else if self.fails() > 0 {
            Health::Suspect
        } else {
            Health::Up
        }
    }

    /// Reset the failure counter, returning its previous value.
    pub fn record_success(&self) -> u32 {
        self.fails.swap(0, Ordering::Relaxed)
    }

    /// Count one failure, returning the new value.
    pub fn record_failure(&self) -> u32 {
        self.fails
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    fn transport(&self, force_tcp: bool) -> Transport {
        if self.tls.is_some() {
            Transport::Tls
        } else if force_tcp {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }

    /// Send `query` upstream and wait for its reply.
    ///
    /// Health counters are left alone; the caller decides what a
    /// failure means.
    pub async fn connect(&self, query: &Message, force_tcp: bool) -> Result<Message, TransportError> {
        let transport = self.transport(force_tcp);
        let exchange = async {
            match transport {
                Transport::Udp => exchange_udp(self.addr, query).await,
                Transport::Tcp | Transport::Tls => {
                    self.conns.exchange(query, transport, self.tls.as_ref()).await
                }
            }
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    /// Check the upstream once with `. IN NS` and update the failure counter.
    /// Any decodable reply counts as healthy.
    pub async fn healthcheck(&self, max_fails: u32, force_tcp: bool) -> bool {
        let mut ping = Message::new();
        ping.set_id(rand::random());
        ping.add_query(Query::query(Name::root(), RecordType::NS));

        match self.connect(&ping, force_tcp).await {
            Ok(_) => {
                let previous = self.record_success();
                if max_fails != 0 && previous >= max_fails {
                    info!("Upstream {} is healthy again", self.addr);
                }
                true
            }
            Err(e) => {
                let fails = self.record_failure();
                debug!("Health check of {} failed ({}): {}", self.addr, fails, e);
                if max_fails != 0 && fails == max_fails {
                    warn!("Upstream {} marked down after {} failures", self.addr, fails);
                }
                false
            }
        }
    }

    /// Start the periodic health check.  An interval of zero disables it.
    ///
    /// Proxies that talk TCP or TLS also get a loop closing idle pooled
    /// streams once they pass the expiry.
    pub fn start(self: &Arc<Self>, interval: Duration, max_fails: u32, force_tcp: bool) {
        if self.transport(force_tcp) != Transport::Udp {
            self.start_conn_cleanup();
        }
        if interval.is_zero() {
            debug!("Health checking of {} disabled", self.addr);
            return;
        }
        let proxy = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        proxy.healthcheck(max_fails, force_tcp).await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Health check loop for {} stopped", proxy.addr);
                        return;
                    }
                }
            }
        });
    }

    fn start_conn_cleanup(self: &Arc<Self>) {
        let expire = self.conns.expire();
        if expire.is_zero() {
            return;
        }
        let proxy = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + expire, expire);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let closed = proxy.conns.prune();
                        if closed > 0 {
                            debug!("Closed {} expired connections to {}", closed, proxy.addr);
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Start pushing `site`'s services to the peer behind this upstream.
    pub fn start_pushing_services(
        self: &Arc<Self>,
        interval: Duration,
        site: EdgeSite,
        table: ServiceTable,
        push_port: u16,
    ) {
        let peer = SocketAddr::new(self.addr.ip(), push_port);
        let pusher = Pusher::new(peer, site, table);
        let shutdown = self.shutdown.subscribe();
        self.spawn(pusher.run(interval, shutdown));
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            warn!("Upstream {} is closed, not starting background loop", self.addr);
            return;
        }
        let handle = tokio::spawn(task);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Stop all loops and drop pooled connections.  Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.conns.clear();
        debug!("Closed upstream {}", self.addr);
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.close();
    }
}
