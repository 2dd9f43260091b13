//! Error types for edged.

use std::time::Duration;

use hickory_server::proto::error::ProtoError;
use thiserror::Error;

/// Errors surfaced by [`crate::forward`] to the query caller.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The edge was never given a forwarder.
    #[error("no forwarder configured")]
    NoForwarderConfigured,

    /// Every upstream was down and no attempt produced a reply.
    #[error("no healthy upstream")]
    NoHealthyUpstream,

    /// The last transport failure once all candidates were exhausted.
    #[error("upstream transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A failed exchange with one upstream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
}

/// Invalid configuration.  Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for {directive}: {value:?}")]
    InvalidDuration { directive: &'static str, value: String },

    #[error("{directive} can't be negative: {value}")]
    Negative { directive: &'static str, value: String },

    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),

    #[error("more than {max} upstreams configured: {got}")]
    TooManyUpstreams { max: usize, got: usize },

    #[error("no upstreams configured")]
    NoUpstreams,

    #[error("invalid upstream '{0}'")]
    InvalidUpstream(String),

    #[error("invalid zone '{0}'")]
    InvalidZone(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to deliver one table update to a peer.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("peer answered {0}")]
    Status(http::StatusCode),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
