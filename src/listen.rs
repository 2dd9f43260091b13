//! HTTP endpoint receiving table updates pushed by peer sites.
//!
//! `POST /` with a JSON [`ServiceTableUpdate`] body.  A body that does
//! not decode is answered with 400 and changes nothing; anything else
//! is applied to the table and answered with 200.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::table::ServiceTable;
use crate::types::ServiceTableUpdate;

/// How long shutdown waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the table-sync router.
///
/// Service descriptions are opaque and unbounded, so the body is read
/// whole with no size limit.
pub fn router(table: ServiceTable) -> Router {
    Router::new()
        .route("/", post(parse_table_update))
        .layer(DefaultBodyLimit::disable())
        .with_state(table)
}

async fn parse_table_update(State(table): State<ServiceTable>, body: Bytes) -> StatusCode {
    let update = match ServiceTableUpdate::decode(&body) {
        Ok(update) => update,
        Err(e) => {
            error!("Error while decoding table update: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    debug!(
        "Table update from {}: {:?} {}",
        update.meta.ip,
        update.event.kind,
        update.event.service.as_value()
    );
    table.apply(update).await;
    StatusCode::OK
}

/// A running table-sync listener.
pub struct TableListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl TableListener {
    /// Bind `addr` and start serving in the background.
    pub async fn bind(addr: SocketAddr, table: ServiceTable) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for table updates on {}", local_addr);

        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router(table)).with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = server.await {
                error!("Table update listener failed: {}", e);
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain in-flight requests for a bounded time, then
    /// drop whatever is left.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
            warn!("Table update listener did not drain in {:?}", DRAIN_TIMEOUT);
            handle.abort();
        }
        info!("Stopped listening for table updates on {}", self.local_addr);
    }
}

impl Drop for TableListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
