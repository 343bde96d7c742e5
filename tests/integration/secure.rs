//! TLS end-to-end: secure streams over real TCP, and the full RPC
//! stack riding on them.

use std::sync::Arc;

use async_trait::async_trait;
use keel_client::{Client, RequestOptions};
use keel_core::config::{ClientConfig, ServerConfig};
use keel_net::secure::{client_config, server_config, SecureStream, VerifyPolicy};
use keel_net::transport::{BoxedTransport, StreamTransport, Transport};
use keel_net::{ConnectionPool, Connector, TransportError};
use keel_server::{DispatchOutcome, Handler, Server, ServerRequest, ServiceRouter};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tokio::net::{TcpListener, TcpStream};

/// Self-signed identity for "localhost" plus a root store trusting it.
fn test_identity() -> (
    Vec<CertificateDer<'static>>,
    PrivateKeyDer<'static>,
    RootCertStore,
) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let mut roots = RootCertStore::empty();
    roots.add(cert_der.clone()).unwrap();
    (vec![cert_der], key, roots)
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: &ServerRequest) -> DispatchOutcome {
        DispatchOutcome::success(request.envelope.payload.clone())
    }
}

/// Dials TCP, then completes a TLS handshake, yielding a transport the
/// pool treats like any other.
struct TlsConnector {
    addr: std::net::SocketAddr,
    config: Arc<rustls::ClientConfig>,
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let mut secure = SecureStream::client(
            StreamTransport::new(stream),
            self.config.clone(),
            "localhost",
            None,
        )
        .map_err(|e| {
            TransportError::Broken(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        secure.prepare().await.map_err(|e| {
            TransportError::Broken(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        Ok(Box::new(secure))
    }
}

#[tokio::test]
async fn secure_stream_over_tcp_round_trip() {
    let (certs, key, roots) = test_identity();
    let server_cfg = server_config(certs, key).unwrap();
    let (client_cfg, collected) = client_config(roots, &VerifyPolicy::default()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut secure =
            SecureStream::server(StreamTransport::new(stream), server_cfg).unwrap();
        secure.prepare().await.unwrap();

        let mut buf = [0u8; 16];
        let mut done = 0;
        while done < 16 {
            let n = secure.read(&mut buf[done..]).await.unwrap();
            assert!(n > 0);
            done += n;
        }
        secure.write(&buf).await.unwrap();
        secure.shutdown().await.unwrap();
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut secure = SecureStream::client(
        StreamTransport::new(stream),
        client_cfg,
        "localhost",
        collected,
    )
    .unwrap();
    secure.prepare().await.unwrap();

    secure.write(b"sixteen byte msg").await.unwrap();
    let mut echo = [0u8; 16];
    let mut done = 0;
    while done < 16 {
        let n = secure.read(&mut echo[done..]).await.unwrap();
        assert!(n > 0);
        done += n;
    }
    assert_eq!(&echo, b"sixteen byte msg");

    server_task.await.unwrap();
}

#[tokio::test]
async fn rpc_over_tls() {
    let (certs, key, roots) = test_identity();
    let server_cfg = server_config(certs, key).unwrap();
    let (client_cfg, _) = client_config(roots, &VerifyPolicy::default()).unwrap();

    let mut router = ServiceRouter::new();
    router.register("echo", Arc::new(EchoHandler));
    let server = Server::new(ServerConfig::default(), router);

    // TLS accept loop: handshake, then hand the secure transport to
    // the normal connection pipeline.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let server = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else { return };
                let server = server.clone();
                let server_cfg = server_cfg.clone();
                tokio::spawn(async move {
                    let mut secure =
                        SecureStream::server(StreamTransport::new(stream), server_cfg)
                            .unwrap();
                    if secure.prepare().await.is_err() {
                        return;
                    }
                    server.serve_connection(secure, Some(peer)).await;
                });
            }
        });
    }

    let pool = ConnectionPool::new(
        Arc::new(TlsConnector {
            addr,
            config: client_cfg,
        }),
        2,
    );
    let client = Client::new(ClientConfig::default(), pool);

    let (_, response) = client
        .exec(
            RequestOptions::new("echo", "ping"),
            b"over the encrypted channel".to_vec(),
            None,
        )
        .unwrap();
    assert_eq!(response.await.unwrap(), b"over the encrypted channel");
    client.close(false).await;
}
