//! The accept loop and the per-connection request pipeline.
//!
//! Pipeline states, strictly sequential per connection:
//!
//!   await-header → validate → await-body → parse → [auth] →
//!   dispatch → send-response → await-header
//!
//! While auth or dispatch runs, a watch read is armed on the
//! connection: its only legal outcome is silence, so a broken
//! connection or unexpected bytes abort the pipeline and close the
//! connection. Responses for a connection are therefore emitted in
//! request order by construction.

use std::net::SocketAddr;
use std::sync::Arc;

use keel_core::config::{MempoolConfig, ServerConfig};
use keel_core::envelope::{
    decode_record, encode_frame, ErrorCategory, ErrorReport, FrameHeader, RequestEnvelope,
    ResponseEnvelope, Status, FRAME_HEADER_SIZE,
};
use keel_core::mempool::MemoryPool;
use keel_net::transport::{StreamTransport, Transport};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::dispatch::{AuthDispatcher, ServiceRouter};
use crate::error::ServerError;

/// A parsed request as handlers see it.
#[derive(Debug)]
pub struct ServerRequest {
    pub envelope: RequestEnvelope,
    pub peer: Option<SocketAddr>,
}

struct ServerInner {
    config: ServerConfig,
    router: ServiceRouter,
    auth: Option<Arc<dyn AuthDispatcher>>,
    shutdown: broadcast::Sender<()>,
    /// Body buffers churn once per request; they come from a pooled
    /// allocator instead of the global one.
    mempool: MemoryPool,
}

/// The RPC server. Cloning shares the same router and shutdown signal.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig, router: ServiceRouter) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ServerInner {
                config,
                router,
                auth: None,
                shutdown,
                mempool: MemoryPool::new(MempoolConfig::default()),
            }),
        }
    }

    /// Install an auth dispatcher; it runs before every handler.
    pub fn with_auth(
        config: ServerConfig,
        router: ServiceRouter,
        auth: Arc<dyn AuthDispatcher>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ServerInner {
                config,
                router,
                auth: Some(auth),
                shutdown,
                mempool: MemoryPool::new(MempoolConfig::default()),
            }),
        }
    }

    /// Signal every accept loop and connection to stop.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
    }

    /// Accept connections until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let _gc = self.inner.mempool.spawn_gc();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("server shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                            continue;
                        }
                    };
                    stream.set_nodelay(true).ok();
                    let server = self.clone();
                    tokio::spawn(async move {
                        server
                            .serve_connection(StreamTransport::new(stream), Some(peer))
                            .await;
                    });
                }
            }
        }
    }

    /// Run the request pipeline on one transport until the peer goes
    /// away, a handler closes the connection, or shutdown fires.
    pub async fn serve_connection<T: Transport>(&self, mut transport: T, peer: Option<SocketAddr>) {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        tracing::debug!(?peer, "connection registered");

        loop {
            // await-header
            let mut header_buf = [0u8; FRAME_HEADER_SIZE];
            tokio::select! {
                _ = shutdown.recv() => return,
                read = transport.read_exact(&mut header_buf) => {
                    if read.is_err() {
                        tracing::debug!(?peer, "connection closed at header boundary");
                        return;
                    }
                }
            }

            // validate-header
            let header = match FrameHeader::parse(&header_buf) {
                Ok(header) => header,
                Err(error) => {
                    tracing::debug!(?peer, %error, "unparseable frame header");
                    let _ = Self::respond(
                        &mut transport,
                        ResponseEnvelope::failure(
                            0,
                            Status::FormatError,
                            ErrorReport::new(ErrorCategory::Framing, 400, error.to_string()),
                        ),
                    )
                    .await;
                    // Framing is no longer trustworthy.
                    return;
                }
            };
            if header.message_size == 0 {
                // Keep-alive frame.
                continue;
            }
            if header.message_size > inner.config.max_message_size {
                let message_size = header.message_size;
                tracing::debug!(
                    ?peer,
                    message_size,
                    max = inner.config.max_message_size,
                    "request too big"
                );
                // Drain the oversized body to keep the framing aligned,
                // then answer and reuse the connection.
                if Self::discard(&mut transport, header.message_size as u64)
                    .await
                    .is_err()
                {
                    return;
                }
                let response = ResponseEnvelope::failure(
                    0,
                    Status::RequestTooBig,
                    ErrorReport::new(
                        ErrorCategory::Framing,
                        413,
                        format!("message exceeds {} bytes", inner.config.max_message_size),
                    ),
                );
                if Self::respond(&mut transport, response).await.is_err() {
                    return;
                }
                continue;
            }

            // await-body
            let mut body = inner.mempool.allocate(header.message_size as usize);
            body.resize(header.message_size as usize, 0);
            tokio::select! {
                _ = shutdown.recv() => return,
                read = transport.read_exact(&mut body) => {
                    if read.is_err() {
                        return;
                    }
                }
            }

            // parse
            eprintln!("DEBUG about to decode body of len {} bytes={:?}", body.len(), &body[..]);
            let envelope: RequestEnvelope = match decode_record(&body) {
                Ok(envelope) => envelope,
                Err(error) => {
                    eprintln!("DEBUG decode error: {}", error);
                    let response = ResponseEnvelope::failure(
                        0,
                        Status::FormatError,
                        ErrorReport::new(ErrorCategory::Framing, 400, error.to_string()),
                    );
                    if Self::respond(&mut transport, response).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let request = ServerRequest { envelope, peer };
            tracing::debug!(
                request_id = request.envelope.id,
                service = %request.envelope.service,
                method = %request.envelope.method,
                topic = %request.envelope.topic,
                message_type = %request.envelope.message_type,
                "request received"
            );

            // auth (with the connection watch armed)
            if let Some(auth) = &inner.auth {
                let mut watch = [0u8; 1];
                let outcome = tokio::select! {
                    outcome = auth.check(&request) => outcome,
                    _ = transport.read(&mut watch) => {
                        tracing::debug!(?peer, "peer event during auth, closing");
                        return;
                    }
                };
                if outcome.close_connection {
                    tracing::debug!(?peer, "auth requested connection close");
                    return;
                }
                if outcome.status != Status::Success {
                    tracing::debug!(
                        request_id = request.envelope.id,
                        status = ?outcome.status,
                        "auth rejected request"
                    );
                    let response = ResponseEnvelope {
                        id: request.envelope.id,
                        status: outcome.status,
                        error: outcome.error,
                        payload: Vec::new(),
                    };
                    if Self::respond(&mut transport, response).await.is_err() {
                        return;
                    }
                    continue;
                }
            }

            // dispatch (with the connection watch armed)
            let mut watch = [0u8; 1];
            let outcome = tokio::select! {
                outcome = inner.router.dispatch(&request) => outcome,
                _ = transport.read(&mut watch) => {
                    tracing::debug!(?peer, "peer event during dispatch, closing");
                    return;
                }
            };
            if outcome.close_connection {
                tracing::debug!(?peer, "handler requested connection close");
                return;
            }

            // send-response
            let response = ResponseEnvelope {
                id: request.envelope.id,
                status: outcome.status,
                error: outcome.error,
                payload: outcome.payload,
            };
            if Self::respond(&mut transport, response).await.is_err() {
                tracing::debug!(?peer, "response write failed, resetting connection");
                return;
            }
        }
    }

    async fn respond<T: Transport>(
        transport: &mut T,
        response: ResponseEnvelope,
    ) -> Result<(), ServerError> {
        let framed = encode_frame(&response)?;
        transport.write_all(&framed).await?;
        Ok(())
    }

    /// Read and throw away `remaining` body bytes.
    async fn discard<T: Transport>(transport: &mut T, mut remaining: u64) -> Result<(), ServerError> {
        let mut scratch = [0u8; 16 * 1024];
        while remaining > 0 {
            let take = remaining.min(scratch.len() as u64) as usize;
            transport.read_exact(&mut scratch[..take]).await?;
            remaining -= take as u64;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
