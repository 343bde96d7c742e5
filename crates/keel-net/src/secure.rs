//! Secure stream — a TLS state machine pumped over any transport.
//!
//! rustls keeps the handshake and record layer entirely in memory; its
//! internal buffers are the BIO pair between the TLS engine and the
//! network. This driver moves bytes between those buffers and a
//! [`Transport`]:
//!
//!   - engine wants to write → `write_tls` into a scratch buffer,
//!     ship via the transport
//!   - engine wants to read  → transport read into a staging buffer,
//!     feed via `read_tls`, then `process_new_packets`
//!
//! Peer verification is policy-driven: individual failure kinds can be
//! ignored outright, or every failure can be collected and reported
//! once at the end of the handshake instead of aborting mid-stream.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, ClientConnection, Connection, RootCertStore,
    ServerConfig, ServerConnection};

use crate::error::{TlsError, TransportError};
use crate::transport::Transport;

/// Bounded wait for the peer's close_notify during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const STAGING_SIZE: usize = 16 * 1024;

// ── Verification policy ───────────────────────────────────────────────────────

/// Classified peer-certificate failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerVerifyKind {
    Expired,
    NotValidYet,
    UnknownIssuer,
    NotValidForName,
    Revoked,
    BadEncoding,
    Other,
}

fn classify(error: &rustls::Error) -> Option<PeerVerifyKind> {
    match error {
        rustls::Error::InvalidCertificate(cert_error) => Some(match cert_error {
            CertificateError::Expired => PeerVerifyKind::Expired,
            CertificateError::NotValidYet => PeerVerifyKind::NotValidYet,
            CertificateError::UnknownIssuer => PeerVerifyKind::UnknownIssuer,
            CertificateError::NotValidForName => PeerVerifyKind::NotValidForName,
            CertificateError::Revoked => PeerVerifyKind::Revoked,
            CertificateError::BadEncoding => PeerVerifyKind::BadEncoding,
            _ => PeerVerifyKind::Other,
        }),
        _ => None,
    }
}

/// Peer verification policy.
#[derive(Debug, Clone, Default)]
pub struct VerifyPolicy {
    /// Failure kinds that always succeed.
    pub ignored_errors: HashSet<PeerVerifyKind>,
    /// Collect failures and report them at the end of the handshake
    /// instead of aborting on the first one.
    pub collect_all_errors: bool,
}

type Collected = Arc<Mutex<Vec<PeerVerifyKind>>>;

/// Wraps the WebPKI verifier with the [`VerifyPolicy`] semantics.
/// With no trust anchors at all, every peer fails with UnknownIssuer
/// and the policy decides whether that is survivable.
#[derive(Debug)]
struct PolicyVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
    ignored: HashSet<PeerVerifyKind>,
    collector: Option<Collected>,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verdict = match &self.inner {
            Some(inner) => inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ),
            None => Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )),
        };
        match verdict {
            Ok(verified) => Ok(verified),
            Err(error) => {
                if let Some(kind) = classify(&error) {
                    if self.ignored.contains(&kind) {
                        return Ok(ServerCertVerified::assertion());
                    }
                    if let Some(collector) = &self.collector {
                        collector.lock().expect("collector mutex").push(kind);
                        return Ok(ServerCertVerified::assertion());
                    }
                }
                Err(error)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn default_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Build a client config applying the verification policy. The
/// returned collector is shared with the stream when
/// `collect_all_errors` is set.
pub fn client_config(
    roots: RootCertStore,
    policy: &VerifyPolicy,
) -> Result<(Arc<ClientConfig>, Option<Collected>), TlsError> {
    let provider = default_provider();
    let inner = if roots.is_empty() {
        None
    } else {
        Some(
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| TlsError::BadCertificate(rustls::Error::General(e.to_string())))?,
        )
    };
    let collector: Option<Collected> = if policy.collect_all_errors {
        Some(Arc::new(Mutex::new(Vec::new())))
    } else {
        None
    };
    let verifier = PolicyVerifier {
        inner,
        provider,
        ignored: policy.ignored_errors.clone(),
        collector: collector.clone(),
    };
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok((Arc::new(config), collector))
}

/// Build a server config from a certificate chain and private key.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(TlsError::BadCertificate)?;
    Ok(Arc::new(config))
}

// ── Stream states ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Handshaking,
    Open,
    ShuttingDown,
    Closed,
    Failed,
}

// ── Secure stream ─────────────────────────────────────────────────────────────

/// TLS over any [`Transport`].
pub struct SecureStream<T> {
    transport: T,
    conn: Connection,
    state: StreamState,
    collected: Option<Collected>,
}

impl<T: Transport> SecureStream<T> {
    /// Client side. `server_name` is the SNI / certificate name.
    pub fn client(
        transport: T,
        config: Arc<ClientConfig>,
        server_name: &str,
        collected: Option<Collected>,
    ) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let conn = ClientConnection::new(config, name).map_err(TlsError::Protocol)?;
        Ok(Self {
            transport,
            conn: Connection::Client(conn),
            state: StreamState::Idle,
            collected,
        })
    }

    /// Server side.
    pub fn server(transport: T, config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config).map_err(TlsError::Protocol)?;
        Ok(Self {
            transport,
            conn: Connection::Server(conn),
            state: StreamState::Idle,
            collected: None,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Run the handshake to completion.
    pub async fn prepare(&mut self) -> Result<(), TlsError> {
        self.state = StreamState::Handshaking;
        match self.handshake().await {
            Ok(()) => {
                self.state = StreamState::Open;
                Ok(())
            }
            Err(error) => {
                self.state = StreamState::Failed;
                Err(error)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), TlsError> {
        while self.conn.is_handshaking() {
            self.flush_tls_writes().await?;
            if self.conn.is_handshaking() && self.conn.wants_read() {
                self.pump_read().await?;
            }
        }
        // Ship anything the engine queued at the end (session tickets,
        // the final flight).
        self.flush_tls_writes().await?;

        if let Some(collector) = &self.collected {
            let collected = collector.lock().expect("collector mutex").clone();
            if !collected.is_empty() {
                return Err(TlsError::PeerVerification(collected));
            }
        }
        Ok(())
    }

    /// Read decrypted application bytes. Ok(0) means the peer sent
    /// close_notify.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.flush_tls_writes().await?;
                    self.pump_read().await?;
                }
                Err(e) => return Err(TlsError::Transport(e.into())),
            }
        }
    }

    /// Write application bytes through the encrypted channel.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), TlsError> {
        self.conn
            .writer()
            .write_all(buf)
            .map_err(|e| TlsError::Transport(e.into()))?;
        self.flush_tls_writes().await
    }

    /// Orderly close: send close_notify, wait (bounded) for the
    /// peer's, then shut the transport down.
    pub async fn shutdown(&mut self) -> Result<(), TlsError> {
        self.state = StreamState::ShuttingDown;
        self.conn.send_close_notify();
        self.flush_tls_writes().await?;

        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            let mut scratch = [0u8; 256];
            loop {
                match self.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        self.transport.shutdown().await?;
        self.state = StreamState::Closed;
        Ok(())
    }

    // ── Pump internals ────────────────────────────────────────────────────────

    async fn flush_tls_writes(&mut self) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            let mut outgoing = Vec::with_capacity(STAGING_SIZE);
            self.conn
                .write_tls(&mut outgoing)
                .map_err(|e| TlsError::Transport(e.into()))?;
            if outgoing.is_empty() {
                break;
            }
            self.transport.write_all(&outgoing).await?;
        }
        Ok(())
    }

    async fn pump_read(&mut self) -> Result<(), TlsError> {
        let mut staging = [0u8; STAGING_SIZE];
        let n = self.transport.read(&mut staging).await?;
        if n == 0 {
            return Err(TlsError::Transport(TransportError::Eof));
        }
        let mut slice = &staging[..n];
        while !slice.is_empty() {
            let consumed = self
                .conn
                .read_tls(&mut slice)
                .map_err(|e| TlsError::Transport(e.into()))?;
            if consumed == 0 {
                break;
            }
        }
        self.conn.process_new_packets().map_err(|error| {
            if let Some(kind) = classify(&error) {
                TlsError::PeerVerification(vec![kind])
            } else {
                TlsError::Protocol(error)
            }
        })?;
        Ok(())
    }
}

fn tls_to_transport(error: TlsError) -> TransportError {
    match error {
        TlsError::Transport(inner) => inner,
        other => TransportError::Broken(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            other.to_string(),
        )),
    }
}

/// A prepared secure stream is itself a [`Transport`], so the
/// connection pool and the server loop run over TLS unchanged.
#[async_trait::async_trait]
impl<T: Transport> Transport for SecureStream<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        SecureStream::read(self, buf).await.map_err(tls_to_transport)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        SecureStream::write(self, buf).await.map_err(tls_to_transport)
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        SecureStream::shutdown(self).await.map_err(tls_to_transport)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
