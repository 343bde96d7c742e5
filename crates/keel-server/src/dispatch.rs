//! Routing of parsed requests to auth and business handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::envelope::{ErrorCategory, ErrorReport, Status};

use crate::server::ServerRequest;

/// What a handler produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: Status,
    pub payload: Vec<u8>,
    pub error: Option<ErrorReport>,
    /// Ask the connection loop to drop the connection after the
    /// response (or instead of one).
    pub close_connection: bool,
}

impl DispatchOutcome {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Success,
            payload,
            error: None,
            close_connection: false,
        }
    }

    pub fn failure(status: Status, error: ErrorReport) -> Self {
        Self {
            status,
            payload: Vec::new(),
            error: Some(error),
            close_connection: false,
        }
    }
}

/// Outcome of the auth pipeline stage.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub status: Status,
    pub error: Option<ErrorReport>,
    pub close_connection: bool,
}

impl AuthOutcome {
    pub fn allow() -> Self {
        Self {
            status: Status::Success,
            error: None,
            close_connection: false,
        }
    }

    pub fn deny(error: ErrorReport) -> Self {
        Self {
            status: Status::AuthError,
            error: Some(error),
            close_connection: false,
        }
    }
}

/// A business handler for one service.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &ServerRequest) -> DispatchOutcome;
}

/// The authentication stage, invoked before dispatch when configured.
#[async_trait]
pub trait AuthDispatcher: Send + Sync {
    async fn check(&self, request: &ServerRequest) -> AuthOutcome;
}

/// Maps service names to handlers.
#[derive(Default)]
pub struct ServiceRouter {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(service.into(), handler);
    }

    /// Dispatch to the service's handler; unknown services answer
    /// NotFound without reaching any handler.
    pub async fn dispatch(&self, request: &ServerRequest) -> DispatchOutcome {
        match self.handlers.get(&request.envelope.service) {
            Some(handler) => handler.handle(request).await,
            None => DispatchOutcome::failure(
                Status::NotFound,
                ErrorReport::new(
                    ErrorCategory::Policy,
                    404,
                    format!("unknown service '{}'", request.envelope.service),
                ),
            ),
        }
    }
}
