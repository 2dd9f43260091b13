//! Wire-level exchange with one upstream over UDP, TCP or TLS.
//!
//! UDP exchanges use a fresh ephemeral socket each time.  TCP and TLS
//! streams are kept in a small per-upstream pool and reused while they
//! are younger than the configured expiry.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hickory_server::proto::op::Message;
use log::debug;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::TransportError;

/// Largest UDP datagram we accept.
const MAX_UDP_SIZE: usize = 65_535;

/// Idle streams kept per transport; extras are closed on checkin.
pub(crate) const MAX_IDLE_PER_TRANSPORT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

/// TLS parameters for one upstream.
#[derive(Clone)]
pub struct TlsSettings {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    fn transport(&self) -> Transport {
        match self {
            Stream::Tcp(_) => Transport::Tcp,
            Stream::Tls(_) => Transport::Tls,
        }
    }

    fn is(&self, transport: Transport) -> bool {
        self.transport() == transport
    }
}

struct Idle {
    stream: Stream,
    last_used: Instant,
}

fn retain_fresh(idle: &mut Vec<Idle>, expire: Duration) -> usize {
    let before = idle.len();
    let now = Instant::now();
    idle.retain(|conn| now.duration_since(conn.last_used) < expire);
    before - idle.len()
}

/// Idle TCP/TLS streams to one upstream.
pub(crate) struct ConnPool {
    addr: SocketAddr,
    expire: Duration,
    idle: Mutex<Vec<Idle>>,
}

impl ConnPool {
    pub(crate) fn new(addr: SocketAddr, expire: Duration) -> Self {
        Self {
            addr,
            expire,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_expire(&mut self, expire: Duration) {
        self.expire = expire;
    }

    pub(crate) fn expire(&self) -> Duration {
        self.expire
    }

    /// Take the most recently used stream of the right kind that has not expired.
    fn checkout(&self, transport: Transport) -> Option<Stream> {
        let mut idle = self.idle.lock().ok()?;
        retain_fresh(&mut idle, self.expire);
        let pos = idle.iter().rposition(|conn| conn.stream.is(transport))?;
        Some(idle.remove(pos).stream)
    }

    fn checkin(&self, stream: Stream) {
        if self.expire.is_zero() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            retain_fresh(&mut idle, self.expire);
            let kind = stream.transport();
            if idle.iter().filter(|conn| conn.stream.is(kind)).count() >= MAX_IDLE_PER_TRANSPORT {
                debug!("Idle pool to {} full, closing stream", self.addr);
                return;
            }
            idle.push(Idle {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Close idle streams older than the expiry.  Returns how many were closed.
    pub(crate) fn prune(&self) -> usize {
        match self.idle.lock() {
            Ok(mut idle) => retain_fresh(&mut idle, self.expire),
            Err(_) => 0,
        }
    }

    /// Drop every idle stream.
    pub(crate) fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    async fn dial(&self, transport: Transport, tls: Option<&TlsSettings>) -> Result<Stream, TransportError> {
        let tcp = TcpStream::connect(self.addr).await?;
        tcp.set_nodelay(true)?;
        match (transport, tls) {
            (Transport::Tls, Some(tls)) => {
                let name = match &tls.server_name {
                    Some(name) => ServerName::try_from(name.clone())
                        .map_err(|_| TransportError::InvalidServerName(name.clone()))?,
                    None => ServerName::from(self.addr.ip()),
                };
                let connector = TlsConnector::from(Arc::clone(&tls.config));
                let stream = connector.connect(name, tcp).await?;
                Ok(Stream::Tls(Box::new(stream)))
            }
            _ => Ok(Stream::Tcp(tcp)),
        }
    }

    /// Exchange `query` over a pooled or freshly dialed stream.
    pub(crate) async fn exchange(
        &self,
        query: &Message,
        transport: Transport,
        tls: Option<&TlsSettings>,
    ) -> Result<Message, TransportError> {
        let wire = query.to_vec()?;

        if let Some(mut stream) = self.checkout(transport) {
            match exchange_stream(&mut stream, &wire).await {
                Ok(reply) => {
                    self.checkin(stream);
                    return Ok(reply);
                }
                // The peer may have closed an idle stream; retry once on a new one.
                Err(e) => debug!("Cached connection to {} failed: {}", self.addr, e),
            }
        }

        let mut stream = self.dial(transport, tls).await?;
        let reply = exchange_stream(&mut stream, &wire).await?;
        self.checkin(stream);
        Ok(reply)
    }
}

async fn exchange_stream(stream: &mut Stream, wire: &[u8]) -> Result<Message, TransportError> {
    let bytes = match stream {
        Stream::Tcp(s) => framed_exchange(s, wire).await?,
        Stream::Tls(s) => framed_exchange(s.as_mut(), wire).await?,
    };
    Ok(Message::from_vec(&bytes)?)
}

/// Two-byte length prefixed request/response (RFC 1035 4.2.2).
async fn framed_exchange<S>(stream: &mut S, wire: &[u8]) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(wire.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too large"))?;
    let mut buf = Vec::with_capacity(wire.len() + 2);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(wire);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let len = stream.read_u16().await? as usize;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

/// Send `query` in one datagram and wait for the reply carrying its id.
pub(crate) async fn exchange_udp(addr: SocketAddr, query: &Message) -> Result<Message, TransportError> {
    let bind = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(&query.to_vec()?).await?;

    let mut buf = vec![0u8; MAX_UDP_SIZE];
    loop {
        let n = socket.recv(&mut buf).await?;
        match Message::from_vec(&buf[..n]) {
            Ok(reply) if reply.id() == query.id() => return Ok(reply),
            Ok(reply) => debug!("Ignoring reply with id {} from {}", reply.id(), addr),
            Err(e) => debug!("Ignoring undecodable datagram from {}: {}", addr, e),
        }
    }
}
