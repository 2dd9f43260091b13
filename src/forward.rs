//! Query forwarding with health-aware failover.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_server::proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_server::proto::rr::{Name, RecordType};
use log::{debug, warn};

use crate::error::ForwardError;
use crate::policy::Policy;
use crate::pool::ProxyPool;
use crate::proxy::Proxy;

pub const DEFAULT_MAX_FAILS: u32 = 2;
pub const DEFAULT_HEALTH_CHECK: Duration = Duration::from_millis(500);

/// Forwards queries to a pool of upstream proxies.
#[derive(Debug)]
pub struct Forwarder {
    pool: ProxyPool,
    max_fails: u32,
    force_tcp: bool,
    hc_interval: Duration,
}

impl Forwarder {
    pub fn new(pool: ProxyPool) -> Self {
        Self {
            pool,
            max_fails: DEFAULT_MAX_FAILS,
            force_tcp: false,
            hc_interval: DEFAULT_HEALTH_CHECK,
        }
    }

    /// Forwarder over plain DNS upstreams with default settings.
    /// The caller must [`close`](Self::close) it.
    pub fn from_addrs(addrs: &[SocketAddr]) -> Self {
        let proxies = addrs.iter().map(|addr| Proxy::new(*addr, None)).collect();
        Self::new(ProxyPool::new(proxies, Policy::default()))
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    pub fn with_force_tcp(mut self, force_tcp: bool) -> Self {
        self.force_tcp = force_tcp;
        self
    }

    pub fn with_health_check(mut self, interval: Duration) -> Self {
        self.hc_interval = interval;
        self
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }

    /// Forward `query` as-is.
    ///
    /// Candidates come from the pool's policy.  Down proxies are skipped;
    /// once every candidate has been skipped the first configured proxy is
    /// tried anyway.  Transport failures move on to the next candidate.
    /// An answer to a different question becomes a FORMERR reply.
    pub async fn forward(&self, query: &Message) -> Result<Message, ForwardError> {
        let candidates = self.pool.list();
        let total = candidates.len();
        let mut skipped = 0;
        let mut last_err = None;

        for candidate in &candidates {
            let mut proxy = candidate;
            if proxy.down(self.max_fails) {
                skipped += 1;
                if skipped < total {
                    debug!("Skipping down upstream {}", proxy.addr());
                    continue;
                }
                // Everything looks down; health checking may itself be broken.
                match self.pool.first() {
                    Some(first) => proxy = first,
                    None => break,
                }
                warn!("All upstreams down, forcing {}", proxy.addr());
            }

            match proxy.connect(query, self.force_tcp).await {
                Ok(reply) => {
                    if !reply_matches(query, &reply) {
                        debug!("Upstream {} answered a different question", proxy.addr());
                        return Ok(error_reply(query, ResponseCode::FormErr));
                    }
                    return Ok(reply);
                }
                Err(e) => {
                    let fails = proxy.record_failure();
                    debug!("Upstream {} failed ({}): {}", proxy.addr(), fails, e);
                    last_err = Some(e);
                    if skipped < total {
                        continue;
                    }
                    break;
                }
            }
        }

        match last_err {
            Some(e) => Err(ForwardError::Transport(e)),
            None => Err(ForwardError::NoHealthyUpstream),
        }
    }

    /// Build a fresh query for `name`/`rtype` and forward it.  EDNS
    /// buffer size and DO bit are copied from `request`.
    pub async fn lookup(
        &self,
        request: &Message,
        name: Name,
        rtype: RecordType,
    ) -> Result<Message, ForwardError> {
        let mut query = Message::new();
        query
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        query.add_query(Query::query(name, rtype));
        size_and_do(request, &mut query);
        self.forward(&query).await
    }

    /// Start health checking every proxy.
    pub fn start(&self) {
        for proxy in self.pool.iter() {
            proxy.start(self.hc_interval, self.max_fails, self.force_tcp);
        }
    }

    /// Close every proxy.
    pub fn close(&self) {
        for proxy in self.pool.iter() {
            proxy.close();
        }
    }
}

/// Whether `reply` answers the question asked in `query`.
pub fn reply_matches(query: &Message, reply: &Message) -> bool {
    if reply.message_type() != MessageType::Response {
        return false;
    }
    match (query.queries().first(), reply.queries()) {
        (Some(asked), [answered]) => {
            asked.name() == answered.name()
                && asked.query_type() == answered.query_type()
                && asked.query_class() == answered.query_class()
        }
        (None, []) => true,
        _ => false,
    }
}

/// A reply to `query` carrying only `rcode`.
pub fn error_reply(query: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::error_msg(query.id(), query.op_code(), rcode);
    reply.set_recursion_desired(query.recursion_desired());
    reply.add_queries(query.queries().to_vec());
    reply
}

fn size_and_do(request: &Message, query: &mut Message) {
    if let Some(edns) = request.extensions() {
        let mut out = Edns::new();
        out.set_max_payload(edns.max_payload());
        out.set_dnssec_ok(edns.dnssec_ok());
        query.set_edns(out);
    }
}
