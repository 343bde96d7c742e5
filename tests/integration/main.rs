//! Keel integration test harness.
//!
//! Everything here runs in-process: servers listen on ephemeral
//! localhost ports, clients dial them through the real connection
//! pool, and encrypted files live in per-test temp directories. No
//! external environment is required.

mod acl;
mod container;
mod file;
mod rpc;
mod secure;
mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use keel_net::transport::{BoxedTransport, StreamTransport};
use keel_net::{Connector, TransportError};
use tokio::net::TcpStream;

/// Plain-TCP connector for client pools in tests.
pub struct TcpConnector {
    pub addr: SocketAddr,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(StreamTransport::new(stream)))
    }
}

pub fn tcp_connector(addr: SocketAddr) -> Arc<TcpConnector> {
    Arc::new(TcpConnector { addr })
}
