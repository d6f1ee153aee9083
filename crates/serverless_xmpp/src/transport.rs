//! Byte-stream transport — listening sockets and outbound connects.
//!
//! The stream layer only needs an async byte pipe per connection. The
//! [`Transport`] trait hides where those pipes come from so the registry can
//! be driven by real TCP in production and by in-memory pipes in tests.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::LinkError;

/// Anything the stream layer can read elements from and write elements to.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// One physical connection, exclusively owned by the stream built on it.
pub struct Channel {
    io: Box<dyn ByteStream>,
    remote: String,
}

impl Channel {
    pub fn new(io: impl ByteStream, remote: impl Into<String>) -> Self {
        Self {
            io: Box::new(io),
            remote: remote.into(),
        }
    }

    /// Human-readable remote endpoint, for logs.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub(crate) fn into_io(self) -> Box<dyn ByteStream> {
        self.io
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("remote", &self.remote).finish()
    }
}

/// Source of inbound channels.
#[async_trait]
pub trait Acceptor: Send {
    /// The port this acceptor is bound to.
    fn local_port(&self) -> u16;

    async fn accept(&mut self) -> Result<Channel, LinkError>;
}

/// Connection factory used by the service and registry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the first free port in `min..=max`.
    ///
    /// Fails with [`LinkError::BindExhausted`] when every port is taken.
    async fn listen(
        &self,
        bind: Option<IpAddr>,
        min: u16,
        max: u16,
    ) -> Result<Box<dyn Acceptor>, LinkError>;

    async fn connect(&self, host: &str, port: u16) -> Result<Channel, LinkError>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Plain TCP transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

struct TcpAcceptor {
    listener: TcpListener,
    port: u16,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn accept(&mut self) -> Result<Channel, LinkError> {
        let (socket, addr) = self.listener.accept().await?;
        let _ = socket.set_nodelay(true);
        debug!("Accepted connection from {addr}");
        Ok(Channel::new(socket, addr.to_string()))
    }
}

/// Bind a TCP listener on the first free port of `min..=max`.
pub async fn bind_range(
    bind: Option<IpAddr>,
    min: u16,
    max: u16,
) -> Result<(TcpListener, u16), LinkError> {
    let ip = bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    for port in min..=max {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                info!("Listening for link-local streams on {ip}:{bound}");
                return Ok((listener, bound));
            }
            Err(e) => {
                debug!("Port {port} unavailable: {e}");
            }
        }
    }
    Err(LinkError::BindExhausted { min, max })
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(
        &self,
        bind: Option<IpAddr>,
        min: u16,
        max: u16,
    ) -> Result<Box<dyn Acceptor>, LinkError> {
        let (listener, port) = bind_range(bind, min, max).await?;
        Ok(Box::new(TcpAcceptor { listener, port }))
    }

    async fn connect(&self, host: &str, port: u16) -> Result<Channel, LinkError> {
        let socket = TcpStream::connect((host, port))
            .await
            .map_err(|e| LinkError::not_connected(format!("connect {host}:{port}: {e}")))?;
        let _ = socket.set_nodelay(true);
        let remote = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{host}:{port}"));
        debug!("Connected to {remote}");
        Ok(Channel::new(socket, remote))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
