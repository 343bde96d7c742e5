//! Client ↔ server end-to-end: dispatch order, sessions, overflow,
//! cancellation, pipeline seriality.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_client::{
    Client, ClientError, ClientHandle, RequestOptions, Session, SessionFlags, SessionId,
};
use keel_core::config::{ClientConfig, ServerConfig};
use keel_core::envelope::{ErrorCategory, ErrorReport, Priority, ResponseEnvelope, Status};
use keel_net::ConnectionPool;
use keel_server::{
    AuthDispatcher, AuthOutcome, DispatchOutcome, Handler, Server, ServerRequest, ServiceRouter,
};
use tokio::net::TcpListener;

use crate::tcp_connector;

// ── Test fixtures ─────────────────────────────────────────────────────────────

struct EchoHandler {
    delay: Duration,
    order: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: &ServerRequest) -> DispatchOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.order.lock().unwrap().push(request.envelope.id);
        DispatchOutcome::success(request.envelope.payload.clone())
    }
}

/// Grants requests whose session_auth equals the expected token.
struct TokenAuth {
    token: Vec<u8>,
}

#[async_trait]
impl AuthDispatcher for TokenAuth {
    async fn check(&self, request: &ServerRequest) -> AuthOutcome {
        if request.envelope.session_auth == self.token {
            AuthOutcome::allow()
        } else {
            AuthOutcome::deny(ErrorReport::new(
                ErrorCategory::Authentication,
                401,
                "bad session token",
            ))
        }
    }
}

/// A session that learns the good token on refresh.
struct RenewableSession {
    flags: SessionFlags,
    token: Mutex<Vec<u8>>,
    good_token: Vec<u8>,
    refreshes: AtomicUsize,
}

impl RenewableSession {
    fn new(initial: &[u8], good: &[u8]) -> Self {
        Self {
            flags: SessionFlags::new(true),
            token: Mutex::new(initial.to_vec()),
            good_token: good.to_vec(),
            refreshes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Session for RenewableSession {
    fn id(&self) -> SessionId {
        "renewable".into()
    }

    fn is_valid(&self) -> bool {
        self.flags.is_valid()
    }

    fn set_valid(&self, valid: bool) {
        self.flags.set_valid(valid);
    }

    fn is_refreshing(&self) -> bool {
        self.flags.is_refreshing()
    }

    fn set_refreshing(&self, refreshing: bool) {
        self.flags.set_refreshing(refreshing);
    }

    fn auth_bytes(&self) -> Vec<u8> {
        self.token.lock().unwrap().clone()
    }

    async fn refresh(
        &self,
        _handle: ClientHandle,
        _last: Option<ResponseEnvelope>,
    ) -> Result<(), String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        *self.token.lock().unwrap() = self.good_token.clone();
        Ok(())
    }
}

async fn start_server(server: Server) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn echo_server(delay: Duration) -> (std::net::SocketAddr, Arc<Mutex<Vec<u64>>>) {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut router = ServiceRouter::new();
    router.register(
        "echo",
        Arc::new(EchoHandler {
            delay,
            order: order.clone(),
        }),
    );
    let addr = start_server(Server::new(ServerConfig::default(), router)).await;
    (addr, order)
}

fn client(addr: std::net::SocketAddr, connections: usize, config: ClientConfig) -> Client {
    let pool = ConnectionPool::new(tcp_connector(addr), connections);
    Client::new(config, pool)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_echo() -> anyhow::Result<()> {
    let (addr, _) = echo_server(Duration::ZERO).await;
    let c = client(addr, 2, ClientConfig::default());

    let (_, response) = c.exec(
        RequestOptions::new("echo", "ping"),
        b"hello keel".to_vec(),
        None,
    )?;
    assert_eq!(response.await?, b"hello keel");
    c.close(false).await;
    Ok(())
}

#[tokio::test]
async fn per_connection_pipeline_is_serial() {
    // A slow handler and one connection: the second request's response
    // can only appear after the first one's was fully written.
    let (addr, order) = echo_server(Duration::from_millis(50)).await;
    let c = client(addr, 1, ClientConfig::default());

    let (_, first) = c
        .exec(RequestOptions::new("echo", "m"), b"first".to_vec(), None)
        .unwrap();
    let (_, second) = c
        .exec(RequestOptions::new("echo", "m"), b"second".to_vec(), None)
        .unwrap();

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), b"first");
    assert_eq!(b.unwrap(), b"second");

    let seen = order.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0] < seen[1], "requests must be handled in send order");
    c.close(false).await;
}

#[tokio::test]
async fn queue_overflow_with_blocked_pool() {
    // One connection occupied by a slow request; further Normal
    // requests queue until the depth cap, then overflow synchronously.
    let (addr, _) = echo_server(Duration::from_millis(200)).await;
    let config = ClientConfig {
        max_queue_depth: 2,
        ..ClientConfig::default()
    };
    let c = client(addr, 1, config);

    let (_, blocker) = c
        .exec(RequestOptions::new("echo", "m"), b"blocker".to_vec(), None)
        .unwrap();
    // Give the dispatcher a beat to occupy the connection.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_, q1) = c
        .exec(RequestOptions::new("echo", "m"), b"q1".to_vec(), None)
        .unwrap();
    let (_, q2) = c
        .exec(RequestOptions::new("echo", "m"), b"q2".to_vec(), None)
        .unwrap();
    let overflow = c.exec(RequestOptions::new("echo", "m"), b"q3".to_vec(), None);
    assert!(matches!(overflow, Err(ClientError::QueueOverflow)));

    // Once the pool unblocks, the queued requests complete in order.
    assert_eq!(blocker.await.unwrap(), b"blocker");
    assert_eq!(q1.await.unwrap(), b"q1");
    assert_eq!(q2.await.unwrap(), b"q2");
    c.close(false).await;
}

#[tokio::test]
async fn session_refresh_against_a_real_auth_server() {
    let mut router = ServiceRouter::new();
    router.register(
        "echo",
        Arc::new(EchoHandler {
            delay: Duration::ZERO,
            order: Arc::new(Mutex::new(Vec::new())),
        }),
    );
    let server = Server::with_auth(
        ServerConfig::default(),
        router,
        Arc::new(TokenAuth {
            token: b"fresh-token".to_vec(),
        }),
    );
    let addr = start_server(server).await;
    let c = client(addr, 2, ClientConfig::default());

    let session = Arc::new(RenewableSession::new(b"stale-token", b"fresh-token"));
    let session_dyn: Arc<dyn Session> = session.clone();

    // Two concurrent requests, both initially rejected by auth. One
    // refresh must serve both.
    let (_, fut_a) = c
        .exec(RequestOptions::new("echo", "m"), b"a".to_vec(), Some(session_dyn.clone()))
        .unwrap();
    let (_, fut_b) = c
        .exec(RequestOptions::new("echo", "m"), b"b".to_vec(), Some(session_dyn))
        .unwrap();

    assert_eq!(fut_a.await.unwrap(), b"a");
    assert_eq!(fut_b.await.unwrap(), b"b");
    assert_eq!(session.refreshes.load(Ordering::SeqCst), 1);
    c.close(false).await;
}

#[tokio::test]
async fn cancellation_is_idempotent_and_at_most_once() {
    let (addr, _) = echo_server(Duration::from_millis(100)).await;
    let c = client(addr, 1, ClientConfig::default());

    let (handle, response) = c
        .exec(RequestOptions::new("echo", "m"), b"doomed".to_vec(), None)
        .unwrap();
    handle.cancel();
    handle.cancel(); // double cancel is a no-op

    // The suppressed callback surfaces as Cancelled exactly once.
    assert!(matches!(response.await, Err(ClientError::Cancelled)));

    // The pool accounting survived: the next request works.
    let (_, ok) = c
        .exec(RequestOptions::new("echo", "m"), b"alive".to_vec(), None)
        .unwrap();
    assert_eq!(ok.await.unwrap(), b"alive");
    c.close(false).await;
}

#[tokio::test]
async fn unknown_service_reports_remote_error() {
    let (addr, _) = echo_server(Duration::ZERO).await;
    let c = client(addr, 1, ClientConfig::default());

    let (_, response) = c
        .exec(RequestOptions::new("ghost", "m"), Vec::new(), None)
        .unwrap();
    match response.await {
        Err(ClientError::Remote { status, report }) => {
            assert_eq!(status, Status::NotFound);
            assert_eq!(report.unwrap().category, ErrorCategory::Policy);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    c.close(false).await;
}

#[tokio::test]
async fn highest_priority_overtakes_queued_normal_traffic() {
    // Fill the single connection, queue Normal requests, then exec a
    // Highest one: it must be handled before the queued Normal ones.
    let (addr, order) = echo_server(Duration::from_millis(60)).await;
    let c = client(addr, 1, ClientConfig::default());

    let (_, blocker) = c
        .exec(RequestOptions::new("echo", "m"), b"blocker".to_vec(), None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_, normal) = c
        .exec(RequestOptions::new("echo", "m"), b"normal".to_vec(), None)
        .unwrap();
    let (highest_handle, highest) = c
        .exec(
            RequestOptions::new("echo", "m").priority(Priority::Highest),
            b"urgent".to_vec(),
            None,
        )
        .unwrap();

    blocker.await.unwrap();
    highest.await.unwrap();
    normal.await.unwrap();

    let seen = order.lock().unwrap();
    assert_eq!(seen.len(), 3);
    // The Highest request's id is greater (created later) yet it was
    // handled second, before the earlier Normal request.
    assert_eq!(seen[1], highest_handle.id());
    c.close(false).await;
}
