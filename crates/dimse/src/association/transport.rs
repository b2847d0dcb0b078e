//! Byte-stream transport under an association.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{DimseError, Result, TimeoutStage};

/// Any duplex stream an association can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connected byte stream, plain or TLS.
pub struct Connection {
    stream: Box<dyn AsyncStream>,
    encrypted: bool,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap an arbitrary stream, e.g. an in-memory duplex in tests.
    pub fn new(stream: impl AsyncStream + 'static, encrypted: bool) -> Self {
        Self {
            stream: Box::new(stream),
            encrypted,
            peer_addr: None,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            stream: Box::new(stream),
            encrypted: false,
            peer_addr,
        }
    }

    /// Open a TCP connection, failing with a connect-stage timeout.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        debug!("Connecting to {}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DimseError::AssociationTimeout(TimeoutStage::Connect))??;
        Ok(Self::from_tcp(stream))
    }

    /// Remote address for a stream built with [`new`](Self::new), such as
    /// a TLS session over an accepted socket.
    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("encrypted", &self.encrypted)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
