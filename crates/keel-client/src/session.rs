//! Sessions — the security context a request travels under.
//!
//! Sessions are shared by many requests. When the server answers
//! AuthError the dispatcher marks the session invalid and parks every
//! request for it; a single `refresh` call serves all of them
//! (coalescing is enforced by the dispatcher, one refresh in flight
//! per session id).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keel_core::envelope::ResponseEnvelope;

use crate::client::ClientHandle;

pub type SessionId = String;

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// A null session rides along without auth semantics; AuthError
    /// responses complete the request instead of triggering a refresh.
    fn is_null(&self) -> bool {
        false
    }

    fn is_valid(&self) -> bool;
    fn set_valid(&self, valid: bool);

    fn is_refreshing(&self) -> bool;
    fn set_refreshing(&self, refreshing: bool);

    /// Credential bytes serialized into the request envelope. Called
    /// at send time, after any refresh, so fresh credentials win.
    fn auth_bytes(&self) -> Vec<u8>;

    /// Re-establish the session. `last_response` is the AuthError
    /// response that invalidated it (None when the session was already
    /// invalid at enqueue time). Implementations typically call back
    /// into the client through `handle` to run their login RPC.
    async fn refresh(
        &self,
        handle: ClientHandle,
        last_response: Option<ResponseEnvelope>,
    ) -> Result<(), String>;
}

/// The valid/refreshing flag pair every session carries. Embed and
/// delegate.
#[derive(Default)]
pub struct SessionFlags {
    valid: AtomicBool,
    refreshing: AtomicBool,
}

impl SessionFlags {
    pub fn new(valid: bool) -> Self {
        Self {
            valid: AtomicBool::new(valid),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub fn set_refreshing(&self, refreshing: bool) {
        self.refreshing.store(refreshing, Ordering::Release);
    }
}

/// The sessionless session.
pub struct NullSession;

#[async_trait]
impl Session for NullSession {
    fn id(&self) -> SessionId {
        String::new()
    }

    fn is_null(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn set_valid(&self, _valid: bool) {}

    fn is_refreshing(&self) -> bool {
        false
    }

    fn set_refreshing(&self, _refreshing: bool) {}

    fn auth_bytes(&self) -> Vec<u8> {
        Vec::new()
    }

    async fn refresh(
        &self,
        _handle: ClientHandle,
        _last_response: Option<ResponseEnvelope>,
    ) -> Result<(), String> {
        Ok(())
    }
}
