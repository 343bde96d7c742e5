//! The client dispatcher.
//!
//! One dispatcher task owns dequeueing: it pops sendable requests in
//! priority order (FIFO within a class) and performs the pool send
//! inline, so wire order matches enqueue order. Each response is then
//! awaited on its own task; completion re-wakes the dispatcher, which
//! is how pool backpressure clears.
//!
//! Sessions: a request whose session is invalid parks on a per-session
//! waiting queue. One refresh runs per session id no matter how many
//! requests are parked; completion re-enqueues them (with regenerated
//! ids) in FIFO order, or fails them all with the refresh error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use keel_core::config::{ClientConfig, MempoolConfig};
use keel_core::envelope::{
    decode_record, encode_frame, FrameHeader, Priority, ResponseEnvelope, Status,
    FRAME_HEADER_SIZE,
};
use keel_core::mempool::MemoryPool;
use keel_net::{ConnectionPool, PooledConn, TransportError};
use tokio::sync::{oneshot, Notify};

use crate::error::ClientError;
use crate::request::{Request, RequestHandle, RequestOptions, ResponseFuture};
use crate::session::{Session, SessionId};

/// Weighted-dequeue batch sizes, Highest first.
const DEQUEUE_WEIGHTS: [usize; 5] = [8, 4, 2, 1, 1];

struct DispatchState {
    queues: [VecDeque<Request>; 5],
    session_waiting: HashMap<SessionId, VecDeque<Request>>,
    /// Per-priority count of requests parked in session queues; they
    /// still occupy queue-depth budget.
    waiters: [usize; 5],
    refreshing: HashSet<SessionId>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            queues: Default::default(),
            session_waiting: HashMap::new(),
            waiters: [0; 5],
            refreshing: HashSet::new(),
        }
    }
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    pool: ConnectionPool,
    state: Mutex<DispatchState>,
    wake: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Response-body buffers are pooled; one churns per request.
    mempool: MemoryPool,
}

/// The RPC client. Cloning shares the same dispatcher.
///
/// Call [`close`](Client::close) when done; it drains pending requests
/// and stops the dispatcher task.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Weak handle given to session refreshers. Upgrading fails once the
/// client is gone, which breaks the session→client reference cycle.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Weak<ClientInner>,
}

impl ClientHandle {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

enum PopOutcome {
    Got(Request),
    /// Queue has work but the pool has no slot for this class.
    Backpressure,
    Empty,
}

impl Client {
    pub fn new(config: ClientConfig, pool: ConnectionPool) -> Self {
        let inner = Arc::new(ClientInner {
            config,
            pool,
            state: Mutex::new(DispatchState::new()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            mempool: MemoryPool::new(MempoolConfig::default()),
        });
        tokio::spawn(ClientInner::run(inner.clone()));
        Self { inner }
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Enqueue a request.
    ///
    /// Fails synchronously with [`ClientError::QueueOverflow`] when
    /// the priority's queue depth (queued + session-parked) is at the
    /// configured cap — Highest is exempt — and with
    /// [`ClientError::Aborted`] after close.
    pub fn exec(
        &self,
        opts: RequestOptions,
        payload: Vec<u8>,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(RequestHandle, ResponseFuture), ClientError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Aborted);
        }
        let priority = opts.priority;
        if priority != Priority::Highest {
            let state = inner.state.lock().expect("client state mutex");
            let depth =
                state.queues[priority.index()].len() + state.waiters[priority.index()];
            if depth >= inner.config.max_queue_depth {
                return Err(ClientError::QueueOverflow);
            }
        }

        let (tx, rx) = oneshot::channel();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Request::new(id, opts, payload, session, tx);
        // Serialize once up front so malformed requests fail here, not
        // on the dispatcher.
        encode_frame(&req.envelope())?;

        let handle = RequestHandle {
            id,
            cancelled: req.cancelled.clone(),
        };

        let parked = req
            .session
            .as_ref()
            .map(|s| !s.is_null() && !s.is_valid())
            .unwrap_or(false);
        if parked {
            ClientInner::park_for_refresh(inner, req, None);
        } else {
            let mut state = inner.state.lock().expect("client state mutex");
            state.queues[priority.index()].push_back(req);
            drop(state);
            inner.wake.notify_one();
        }
        Ok((handle, ResponseFuture::new(rx)))
    }

    /// Drain every queued and session-parked request, then close the
    /// pool. With `callback_requests` each pending request fails with
    /// Aborted; otherwise they are discarded silently.
    pub async fn close(&self, callback_requests: bool) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);

        let drained: Vec<Request> = {
            let mut state = inner.state.lock().expect("client state mutex");
            let mut all = Vec::new();
            for queue in &mut state.queues {
                all.extend(queue.drain(..));
            }
            for (_, queue) in state.session_waiting.drain() {
                all.extend(queue);
            }
            state.waiters = [0; 5];
            state.refreshing.clear();
            all
        };
        for mut req in drained {
            if callback_requests {
                req.complete(Err(ClientError::Aborted));
            }
            // Silent discard: dropping the responder resolves the
            // caller's future as Cancelled.
        }

        inner.pool.close().await;
        inner.wake.notify_waiters();
    }
}

impl ClientInner {
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn effective_timeout(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            Duration::from_millis(self.config.default_timeout_ms.max(1))
        } else {
            requested
        }
    }

    // ── Dispatcher loop ───────────────────────────────────────────────────────

    async fn run(inner: Arc<ClientInner>) {
        let _gc = inner.mempool.spawn_gc();
        loop {
            let notified = inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.config.weighted_dequeue {
                ClientInner::drain_weighted(&inner).await;
            } else {
                ClientInner::drain_strict(&inner).await;
            }

            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Default dequeue: higher classes drain fully before lower ones.
    async fn drain_strict(inner: &Arc<Self>) {
        loop {
            let mut dispatched = false;
            for priority in Priority::ALL {
                match inner.try_pop(priority) {
                    PopOutcome::Got(req) => {
                        ClientInner::dispatch_one(inner, req).await;
                        dispatched = true;
                        break; // restart from Highest
                    }
                    // A blocked class blocks everything below it:
                    // lower priorities must not overtake on a slot the
                    // reserve would give them.
                    PopOutcome::Backpressure => return,
                    PopOutcome::Empty => continue,
                }
            }
            if !dispatched {
                return;
            }
        }
    }

    /// Weighted dequeue: each round grants every class a batch budget
    /// so lower classes make progress under sustained high load.
    async fn drain_weighted(inner: &Arc<Self>) {
        loop {
            let mut dispatched = false;
            for priority in Priority::ALL {
                let mut budget = DEQUEUE_WEIGHTS[priority.index()];
                while budget > 0 {
                    match inner.try_pop(priority) {
                        PopOutcome::Got(req) => {
                            ClientInner::dispatch_one(inner, req).await;
                            dispatched = true;
                            budget -= 1;
                        }
                        _ => break,
                    }
                }
            }
            if !dispatched {
                return;
            }
        }
    }

    /// Pop the next live request of a class if the pool can take it.
    /// Cancelled requests are discarded at the head.
    fn try_pop(&self, priority: Priority) -> PopOutcome {
        let mut state = self.state.lock().expect("client state mutex");
        let queue = &mut state.queues[priority.index()];
        while queue.front().map(|r| r.is_cancelled()).unwrap_or(false) {
            queue.pop_front();
        }
        if queue.is_empty() {
            return PopOutcome::Empty;
        }
        if !self.pool.can_send(priority == Priority::Highest) {
            return PopOutcome::Backpressure;
        }
        match queue.pop_front() {
            Some(req) => PopOutcome::Got(req),
            None => PopOutcome::Empty,
        }
    }

    /// Send one request on the pool and hand its response to a task.
    /// Runs on the dispatcher, so sends within a class keep FIFO wire
    /// order.
    async fn dispatch_one(inner: &Arc<Self>, mut req: Request) {
        if inner.closed.load(Ordering::Acquire) {
            req.complete(Err(ClientError::Aborted));
            return;
        }
        if req.is_cancelled() {
            return;
        }

        let framed = match encode_frame(&req.envelope()) {
            Ok(framed) => framed,
            Err(error) => {
                req.complete(Err(error.into()));
                return;
            }
        };

        let timeout = inner.effective_timeout(req.opts.timeout);
        let started = Instant::now();
        let highest = req.opts.priority == Priority::Highest;

        match tokio::time::timeout(timeout, inner.pool.send(highest, &[&framed])).await {
            Err(_) => req.complete(Err(ClientError::Timeout)),
            Ok(Err(TransportError::PoolBusy)) => {
                // Lost the slot race; go back to the head of the line.
                let mut state = inner.state.lock().expect("client state mutex");
                state.queues[req.opts.priority.index()].push_front(req);
            }
            Ok(Err(error)) => req.complete(Err(ClientError::Transport(error))),
            Ok(Ok(conn)) => {
                let inner = inner.clone();
                let remaining = timeout.saturating_sub(started.elapsed());
                tokio::spawn(async move {
                    inner.handle_response(req, conn, remaining).await;
                });
            }
        }
    }

    // ── Response path ─────────────────────────────────────────────────────────

    async fn handle_response(
        self: Arc<Self>,
        mut req: Request,
        mut conn: PooledConn,
        remaining: Duration,
    ) {
        match tokio::time::timeout(remaining, self.receive(&mut conn)).await {
            Err(_) => {
                // Dropping the handle discards the desynced connection.
                drop(conn);
                req.complete(Err(ClientError::Timeout));
            }
            Ok(Err(error)) => {
                drop(conn);
                req.complete(Err(error));
            }
            Ok(Ok(response)) => {
                self.pool.release(conn);
                let refreshable = req
                    .session
                    .as_ref()
                    .map(|s| !s.is_null())
                    .unwrap_or(false);
                if response.status == Status::AuthError && refreshable {
                    let session = req.session.clone().expect("refreshable implies session");
                    session.set_valid(false);
                    tracing::debug!(
                        request_id = req.id,
                        session_id = %session.id(),
                        "auth failure, scheduling session refresh"
                    );
                    ClientInner::park_for_refresh(&self, req, Some(response));
                } else if response.status != Status::Success {
                    req.complete(Err(ClientError::Remote {
                        status: response.status,
                        report: response.error,
                    }));
                } else {
                    req.complete(Ok(response.payload));
                }
            }
        }
        self.wake.notify_one();
    }

    async fn receive(&self, conn: &mut PooledConn) -> Result<ResponseEnvelope, ClientError> {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        self.pool
            .recv(conn, &mut header_buf)
            .await
            .map_err(ClientError::Transport)?;
        let header = FrameHeader::parse(&header_buf)?;
        let mut body = self.mempool.allocate(header.message_size as usize);
        body.resize(header.message_size as usize, 0);
        self.pool
            .recv(conn, &mut body)
            .await
            .map_err(ClientError::Transport)?;
        Ok(decode_record(&body)?)
    }

    // ── Session refresh ───────────────────────────────────────────────────────

    /// Park a request behind its session's refresh, starting the
    /// refresh when none is in flight for that session id.
    fn park_for_refresh(inner: &Arc<Self>, mut req: Request, last: Option<ResponseEnvelope>) {
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let session = req.session.clone().expect("parking requires a session");
        let session_id = session.id();

        let start_refresh = {
            let mut state = inner.state.lock().expect("client state mutex");
            if session.is_valid() {
                // Another request's refresh already won; re-enter with
                // a regenerated id.
                req.id = inner.next_request_id();
                state.queues[req.opts.priority.index()].push_back(req);
                drop(state);
                inner.wake.notify_one();
                return;
            }
            state.waiters[req.opts.priority.index()] += 1;
            state
                .session_waiting
                .entry(session_id.clone())
                .or_default()
                .push_back(req);
            if state.refreshing.contains(&session_id) || session.is_refreshing() {
                false
            } else {
                state.refreshing.insert(session_id.clone());
                session.set_refreshing(true);
                true
            }
        };
        if !start_refresh {
            return;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            let handle = ClientHandle {
                inner: Arc::downgrade(&inner),
            };
            let result = session.refresh(handle, last).await;
            session.set_refreshing(false);
            if result.is_ok() {
                session.set_valid(true);
            }
            if inner.closed.load(Ordering::Acquire) {
                return;
            }

            let mut state = inner.state.lock().expect("client state mutex");
            state.refreshing.remove(&session_id);
            let waiting = state
                .session_waiting
                .remove(&session_id)
                .unwrap_or_default();
            for mut waiter in waiting {
                state.waiters[waiter.opts.priority.index()] =
                    state.waiters[waiter.opts.priority.index()].saturating_sub(1);
                match &result {
                    Ok(()) => {
                        waiter.id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                        state.queues[waiter.opts.priority.index()].push_back(waiter);
                    }
                    Err(error) => {
                        waiter.complete(Err(ClientError::SessionRefresh(error.clone())));
                    }
                }
            }
            drop(state);
            inner.wake.notify_one();
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
