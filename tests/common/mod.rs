//! Shared test infrastructure for forwarding and table sync tests.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::op::{Message, MessageType, OpCode, Query};
use hickory_server::proto::rr::rdata::A;
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::server::{Protocol, Request, ResponseHandler, ResponseInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use edged::{Policy, Proxy, ProxyPool};

/// Address every fake upstream answers A queries with.
pub const ANSWER_IP: [u8; 4] = [192, 0, 2, 1];

/// Bound on one exchange with a fake upstream.
pub const TEST_TIMEOUT: Duration = Duration::from_millis(200);

// --- Fake upstream ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Reply with the question asked and one A record.
    Answer,
    /// Reply, but to a different question.
    WrongQuestion,
    /// Receive and never reply.
    Silent,
}

/// A loopback UDP DNS server with scripted behaviour.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<Message>>>,
    handle: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn start(behaviour: Behaviour) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));

        let (task_hits, task_last) = (hits.clone(), last.clone());
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_vec(&buf[..n]) else {
                    continue;
                };
                task_hits.fetch_add(1, Ordering::SeqCst);
                *task_last.lock().unwrap() = Some(query.clone());

                let reply = match behaviour {
                    Behaviour::Answer => answer(&query),
                    Behaviour::WrongQuestion => {
                        let mut other = query.clone();
                        other.take_queries();
                        other.add_query(Query::query(
                            Name::from_str("elsewhere.invalid.").unwrap(),
                            RecordType::A,
                        ));
                        answer(&other)
                    }
                    Behaviour::Silent => continue,
                };
                let _ = socket.send_to(&reply.to_vec().unwrap(), from).await;
            }
        });

        Self {
            addr,
            hits,
            last,
            handle,
        }
    }

    /// Queries received so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// The most recent query received.
    pub fn last_query(&self) -> Option<Message> {
        self.last.lock().unwrap().clone()
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A loopback TCP DNS server that always answers, with length framing.
pub struct FakeTcpUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeTcpUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));

        let (task_hits, task_accepted) = (hits.clone(), accepted.clone());
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                task_accepted.fetch_add(1, Ordering::SeqCst);
                let hits = task_hits.clone();
                tokio::spawn(async move {
                    while let Ok(len) = stream.read_u16().await {
                        let mut buf = vec![0u8; len as usize];
                        if stream.read_exact(&mut buf).await.is_err() {
                            return;
                        }
                        let Ok(query) = Message::from_vec(&buf) else {
                            return;
                        };
                        hits.fetch_add(1, Ordering::SeqCst);
                        let out = answer(&query).to_vec().unwrap();
                        let _ = stream.write_u16(out.len() as u16).await;
                        let _ = stream.write_all(&out).await;
                    }
                });
            }
        });

        Self {
            addr,
            hits,
            accepted,
            handle,
        }
    }

    /// Queries answered so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeTcpUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn answer(query: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    reply.add_queries(query.queries().to_vec());
    if let Some(q) = query.queries().first() {
        if q.query_type() == RecordType::A {
            let rdata = RData::A(A(Ipv4Addr::from(ANSWER_IP)));
            reply.add_answer(Record::from_rdata(q.name().clone(), 60, rdata));
        }
    }
    if let Some(edns) = query.extensions() {
        reply.set_edns(edns.clone());
    }
    reply
}

// --- Proxies and queries ---

/// A plain-DNS proxy with a short exchange timeout.
pub fn proxy(addr: SocketAddr) -> Proxy {
    let mut proxy = Proxy::new(addr, None);
    proxy.set_timeout(TEST_TIMEOUT);
    proxy
}

pub fn pool(upstreams: &[&FakeUpstream], policy: Policy) -> ProxyPool {
    ProxyPool::new(upstreams.iter().map(|u| proxy(u.addr)).collect(), policy)
}

pub fn query(name: &str, rtype: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    msg
}

/// Wrap `msg` in a server-side `Request` as if it arrived over UDP.
pub fn request(msg: &Message) -> Request {
    let bytes = msg.to_vec().unwrap();
    let mut decoder = BinDecoder::new(&bytes);
    let parsed = MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest");
    Request::new(parsed, "127.0.0.1:40000".parse().unwrap(), Protocol::Udp)
}

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}
