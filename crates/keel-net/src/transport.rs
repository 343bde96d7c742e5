//! The byte-transport capability set.
//!
//! Everything above this layer (secure stream, connection pool, RPC
//! client and server) is polymorphic over [`Transport`]: a plain TCP
//! stream, a TLS stream, or a SOCKS5-tunnelled stream all satisfy the
//! same four capabilities. No deep inheritance — a trait object at the
//! boundary is the whole story.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransportError;

/// A byte-oriented connection.
#[async_trait]
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes. Ok(0) means the peer closed.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write the whole buffer.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Orderly shutdown of the write side.
    async fn shutdown(&mut self) -> Result<(), TransportError>;

    /// Read exactly `buf.len()` bytes.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..]).await?;
            if n == 0 {
                return Err(TransportError::Eof);
            }
            done += n;
        }
        Ok(())
    }
}

pub type BoxedTransport = Box<dyn Transport>;

/// [`Transport`] over any tokio byte stream.
pub struct StreamTransport<T> {
    io: T,
}

impl<T> StreamTransport<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for StreamTransport<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.io.read(buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(buf).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Plain TCP transport.
pub type TcpTransport = StreamTransport<TcpStream>;

impl StreamTransport<TcpStream> {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.io.peer_addr().ok()
    }
}
