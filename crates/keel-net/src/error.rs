//! Error types for transports, TLS and the SOCKS5 client.

use crate::secure::PeerVerifyKind;

/// Transport-level failures. Everything a byte stream can do wrong.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("connection broken: {0}")]
    Broken(std::io::Error),

    #[error("unexpected end of stream")]
    Eof,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("transport is closed")]
    Closed,

    #[error("connection pool is busy")]
    PoolBusy,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable => {
                TransportError::Unreachable(e.to_string())
            }
            ErrorKind::UnexpectedEof => TransportError::Eof,
            ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Broken(e),
        }
    }
}

/// Secure-stream failures.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS protocol error: {0}")]
    Protocol(rustls::Error),

    #[error("peer verification failed: {0:?}")]
    PeerVerification(Vec<PeerVerifyKind>),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("bad certificate or key: {0}")]
    BadCertificate(rustls::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// SOCKS5 negotiation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy speaks an unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("proxy offered an unsupported auth method: 0x{0:02x}")]
    UnsupportedAuthMethod(u8),

    #[error("proxy rejected the credentials")]
    AuthFailed,

    #[error("proxy reported error code 0x{0:02x}")]
    ProxyReportedError(u8),

    #[error("invalid proxy parameters: {0}")]
    InvalidParameters(String),

    #[error("malformed proxy response")]
    MalformedResponse,
}
