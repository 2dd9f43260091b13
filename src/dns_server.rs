//! DNS front end.
//!
//! Listens on UDP and TCP with
//! [hickory-server](https://crates.io/crates/hickory-server) and hands
//! each query to the [`Edge`]:
//!
//! * Names under the `from` zone and outside every `except` zone are
//!   forwarded upstream.  A forwarding failure is answered with SERVFAIL.
//! * Everything else goes to the next handler in the chain, which by
//!   default answers SERVFAIL as well.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, Message, MessageType, ResponseCode};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::edge::Edge;
use crate::forward::error_reply;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Whatever answers the queries this edge does not forward.
#[async_trait]
pub trait NextHandler: Send + Sync {
    async fn serve(&self, query: &Message) -> Message;
}

/// End of the chain: answers SERVFAIL.
#[derive(Debug, Default, Clone, Copy)]
pub struct NextOrFailure;

#[async_trait]
impl NextHandler for NextOrFailure {
    async fn serve(&self, query: &Message) -> Message {
        error_reply(query, ResponseCode::ServFail)
    }
}

/// Start the DNS server and run it until it fails.
pub async fn run_dns_server(
    bind_addr: SocketAddr,
    edge: Arc<Edge>,
    next: Arc<dyn NextHandler>,
) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let handler = EdgeDns { edge, next };
    let mut server = ServerFuture::new(handler);

    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    server.block_until_done().await?;
    Ok(())
}

pub struct EdgeDns {
    edge: Arc<Edge>,
    next: Arc<dyn NextHandler>,
}

impl EdgeDns {
    pub fn new(edge: Arc<Edge>, next: Arc<dyn NextHandler>) -> Self {
        Self { edge, next }
    }

    /// Produce the reply for `query`.
    pub async fn resolve(&self, query: &Message) -> Message {
        let allowed = query
            .queries()
            .first()
            .is_some_and(|q| self.edge.is_allowed(q.name()));
        if !allowed {
            return self.next.serve(query).await;
        }

        match self.edge.forward(query).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Forwarding query {} failed: {}", query.id(), e);
                error_reply(query, ResponseCode::ServFail)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for EdgeDns {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = to_message(request);
        let reply = self.resolve(&query).await;
        debug!(
            "{} {} -> {}",
            request.query().name(),
            request.query().query_type(),
            reply.response_code()
        );

        let header = response_header(request.header(), &reply);
        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = reply.extensions() {
            builder.edns(edns.clone());
        }
        let response = builder.build(
            header,
            reply.answers().iter(),
            reply.name_servers().iter(),
            std::iter::empty(),
            reply.additionals().iter(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send response: {}", e);
                header.into()
            }
        }
    }
}

/// Rebuild the downstream request as a plain message.
fn to_message(request: &Request) -> Message {
    let header = request.header();
    let mut msg = Message::new();
    msg.set_id(header.id())
        .set_message_type(MessageType::Query)
        .set_op_code(header.op_code())
        .set_recursion_desired(header.recursion_desired())
        .set_checking_disabled(header.checking_disabled());
    msg.add_query(request.query().original().clone());
    if let Some(edns) = request.edns() {
        msg.set_edns(edns.clone());
    }
    msg
}

/// The downstream response header: the request's identity with the
/// upstream reply's flags and rcode.
fn response_header(request: &Header, reply: &Message) -> Header {
    let mut header = Header::response_from_request(request);
    header
        .set_response_code(reply.response_code())
        .set_authoritative(reply.authoritative())
        .set_truncated(reply.truncated())
        .set_recursion_available(reply.recursion_available())
        .set_authentic_data(reply.authentic_data());
    header
}
