//! Opening game sockets.
//!
//! [`SocketConfig`] carries the TCP options every game connection gets, on
//! both ends. [`Connector`] is the seam the reconnect controller opens its
//! transport through: [`TcpConnector`] dials the host from the login grant
//! and writes the cookie upgrade preamble before handing the stream over.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

use crate::codec::{self, FrameError};
use crate::session::BoxedTransport;

/// TCP options applied to every game connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60 s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10 s.
    pub keepalive_interval: Duration,
    /// Give up on a dial after this long. Default: 10 s.
    pub connect_timeout: Duration,
    /// Set `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply `config` to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Bind a listener with `SO_REUSEADDR` per `config`.
pub fn bind_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

/// Errors opening a game transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The dial failed.
    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The dial did not complete in time.
    #[error("timed out connecting to {addr}")]
    Timeout { addr: String },

    /// The upgrade preamble could not be written.
    #[error("failed to send upgrade: {0}")]
    Upgrade(#[from] FrameError),
}

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<BoxedTransport, ConnectError>> + Send + 'a>>;

/// Opens an authenticated transport to the game server.
pub trait Connector: Send + Sync + 'static {
    /// Dial `host:port` and present `cookie`. The returned stream is ready for packets.
    fn connect<'a>(&'a self, host: &'a str, port: u16, cookie: &'a str) -> ConnectFuture<'a>;
}

/// [`Connector`] over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: SocketConfig,
}

impl TcpConnector {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16, cookie: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let addr = format!("{host}:{port}");
            let mut stream =
                match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
                    .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(source)) => return Err(ConnectError::Io { addr, source }),
                    Err(_) => return Err(ConnectError::Timeout { addr }),
                };

            if let Err(e) = configure_stream(&stream, &self.config) {
                tracing::warn!("Failed to configure socket to {addr}: {e}");
            }
            codec::write_upgrade(&mut stream, cookie).await?;
            tracing::debug!("Game socket open to {addr}");

            let boxed: BoxedTransport = Box::new(stream);
            Ok(boxed)
        })
    }
}
