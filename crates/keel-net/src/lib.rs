//! Keel net — byte transports and everything that rides on them.
//!
//! [`transport`] defines the capability set every connection exposes
//! (read, write, shutdown); [`secure`] drives a TLS state machine over
//! any transport; [`socks5`] negotiates a proxy tunnel without doing
//! I/O of its own; [`pool`] owns live connections on behalf of an RPC
//! client.

pub mod error;
pub mod pool;
pub mod secure;
pub mod socks5;
pub mod transport;

pub use error::{ProxyError, TlsError, TransportError};
pub use pool::{ConnectionPool, Connector, PooledConn};
pub use secure::{PeerVerifyKind, SecureStream, VerifyPolicy};
pub use socks5::{Socks5Auth, Socks5Client, Socks5Target, StepStatus};
pub use transport::{BoxedTransport, StreamTransport, TcpTransport, Transport};
