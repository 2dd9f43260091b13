//! Periodic push of the local site's services to one peer.
//!
//! Every firing sends an Add for each service the local site currently
//! advertises, and a Delete for each service pushed earlier that is no
//! longer advertised.  Delivery is best effort: failures are logged and
//! the next firing tries again.  A Delete that could not be delivered is
//! kept until it is.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::PushError;
use crate::table::ServiceTable;
use crate::types::{EdgeSite, Service, ServiceTableUpdate};

/// Bound on delivering one update.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one push firing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub added: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Pushes one site's services to one peer.
pub struct Pusher {
    peer: SocketAddr,
    site: EdgeSite,
    table: ServiceTable,
    pushed: HashSet<Service>,
    timeout: Duration,
}

impl Pusher {
    pub fn new(peer: SocketAddr, site: EdgeSite, table: ServiceTable) -> Self {
        Self {
            peer,
            site,
            table,
            pushed: HashSet::new(),
            timeout: PUSH_TIMEOUT,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run one firing.
    pub async fn push_once(&mut self) -> PushReport {
        // Copy out of the table before any network I/O.
        let current = self.table.services(&self.site).await.unwrap_or_default();
        let gone: Vec<Service> = self.pushed.difference(&current).cloned().collect();

        let (peer, timeout) = (self.peer, self.timeout);
        let site = &self.site;
        let adds = join_all(current.iter().map(|service| {
            let update = ServiceTableUpdate::add(site.clone(), service.clone());
            async move { send_update(peer, &update, timeout).await }
        }))
        .await;
        let deletes = join_all(gone.iter().map(|service| {
            let update = ServiceTableUpdate::delete(site.clone(), service.clone());
            async move { send_update(peer, &update, timeout).await }
        }))
        .await;

        let mut report = PushReport::default();
        for result in &adds {
            match result {
                Ok(()) => report.added += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to push service to {}: {}", self.peer, e);
                }
            }
        }

        let mut next = current;
        for (service, result) in gone.into_iter().zip(deletes) {
            match result {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to push service deletion to {}: {}", self.peer, e);
                    next.insert(service);
                }
            }
        }
        self.pushed = next;
        report
    }

    /// Fire every `interval` until `shutdown` flips.  The first firing
    /// happens one interval after start.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if interval.is_zero() {
            warn!("Service push interval is zero, not pushing to {}", self.peer);
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.push_once().await;
                    debug!("Pushed to {}: {:?}", self.peer, report);
                }
                _ = shutdown.changed() => {
                    debug!("Push loop for {} stopped", self.peer);
                    return;
                }
            }
        }
    }
}

/// POST one update as JSON to `peer`.
pub async fn send_update(
    peer: SocketAddr,
    update: &ServiceTableUpdate,
    timeout: Duration,
) -> Result<(), PushError> {
    let body = serde_json::to_vec(update)?;
    match tokio::time::timeout(timeout, post(peer, body)).await {
        Ok(result) => result,
        Err(_) => Err(PushError::Timeout(timeout)),
    }
}

async fn post(peer: SocketAddr, body: Vec<u8>) -> Result<(), PushError> {
    let stream = TcpStream::connect(peer).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Push connection to {} closed: {}", peer, e);
        }
    });

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri("/")
        .header(http::header::HOST, peer.to_string())
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;

    let resp = sender.send_request(req).await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(PushError::Status(resp.status()))
    }
}
