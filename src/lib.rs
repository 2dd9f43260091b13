//! edged - an edge DNS forwarder that keeps a replicated table of the
//! services running at each edge site.
//!
//! Every edge site forwards DNS queries to a small pool of upstream
//! resolvers, failing over between them based on their health.  The same
//! upstreams are the site's peers: each one is periodically sent the
//! services this site runs, and each site accepts those pushes on an HTTP
//! endpoint and folds them into its own copy of the table.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            edged                              │
//! │                                                               │
//! │  UDP/TCP :53 ──▶ DNS front end ──▶ Forwarder ──▶ Proxy pool ──┼──▶ upstreams
//! │                   (zone scoping)   (failover)   (policy,      │
//! │                                                  health)      │
//! │                                                    │          │
//! │  ┌──────────────┐   ┌───────────────┐   push loop  │          │
//! │  │ Service      │──▶│ Service table │─────────────▶┼──────────┼──▶ peers :8053
//! │  │ source       │   │               │◀─────────────┼──────────┼─── peers POST /
//! │  └──────────────┘   └───────────────┘   listener   │          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edged::{Config, Edge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let edge = Arc::new(Edge::from_config(&config)?);
//!     edge.on_startup().await?;
//!     // ... serve DNS with edged::dns_server::run_dns_server ...
//!     edge.on_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dns_server;
pub mod edge;
pub mod error;
pub mod forward;
pub mod listen;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod push;
pub mod runtime;
pub mod table;
pub mod transport;
pub mod types;

pub use config::Config;
pub use edge::Edge;
pub use error::{ConfigError, ForwardError, PushError, TransportError};
pub use forward::Forwarder;
pub use policy::Policy;
pub use pool::ProxyPool;
pub use proxy::Proxy;
pub use table::ServiceTable;
pub use types::{EdgeSite, EventType, GeoCoords, Service, ServiceEvent, ServiceTableUpdate};
