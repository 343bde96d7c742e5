//! Request objects and their completion plumbing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use keel_core::envelope::{Priority, RequestEnvelope};
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::session::Session;

/// Caller-facing request parameters.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub service: String,
    pub method: String,
    pub service_version: u32,
    pub topic: String,
    pub message_type: String,
    pub priority: Priority,
    /// Zero means the client's configured default.
    pub timeout: Duration,
    pub method_auth: Vec<u8>,
}

impl RequestOptions {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            service_version: 1,
            topic: String::new(),
            message_type: String::new(),
            priority: Priority::Normal,
            timeout: Duration::ZERO,
            method_auth: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A request owned by the dispatcher. Exactly one of the dispatcher,
/// the response task, or the refresh path invokes `complete`.
pub(crate) struct Request {
    pub id: u64,
    pub opts: RequestOptions,
    pub payload: Vec<u8>,
    pub session: Option<Arc<dyn Session>>,
    pub cancelled: Arc<AtomicBool>,
    responder: Option<oneshot::Sender<Result<Vec<u8>, ClientError>>>,
}

impl Request {
    pub fn new(
        id: u64,
        opts: RequestOptions,
        payload: Vec<u8>,
        session: Option<Arc<dyn Session>>,
        responder: oneshot::Sender<Result<Vec<u8>, ClientError>>,
    ) -> Self {
        Self {
            id,
            opts,
            payload,
            session,
            cancelled: Arc::new(AtomicBool::new(false)),
            responder: Some(responder),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Serialize the wire record. Called at send time so a refreshed
    /// session contributes fresh credentials.
    pub fn envelope(&self) -> RequestEnvelope {
        RequestEnvelope {
            id: self.id,
            service: self.opts.service.clone(),
            method: self.opts.method.clone(),
            service_version: self.opts.service_version,
            topic: self.opts.topic.clone(),
            message_type: self.opts.message_type.clone(),
            session_auth: self
                .session
                .as_ref()
                .map(|s| s.auth_bytes())
                .unwrap_or_default(),
            method_auth: self.opts.method_auth.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Deliver the outcome once. A cancelled request swallows the
    /// outcome: the caller's future resolves as Cancelled when the
    /// sender drops.
    pub fn complete(&mut self, result: Result<Vec<u8>, ClientError>) {
        if let Some(responder) = self.responder.take() {
            if !self.is_cancelled() {
                let _ = responder.send(result);
            }
        }
    }
}

/// Cancellation handle. Cancellation is cooperative and monotonic: the
/// next dispatcher touchpoint observes the flag and suppresses the
/// callback while pool accounting still runs to completion.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) id: u64,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Resolves to the response payload, or the error that ended the
/// request. Cancellation (or silent discard at close) resolves as
/// [`ClientError::Cancelled`].
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Vec<u8>, ClientError>>,
}

impl ResponseFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Vec<u8>, ClientError>>) -> Self {
        Self { rx }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Vec<u8>, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| match received {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Cancelled),
            })
    }
}
