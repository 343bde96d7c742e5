//! Client-side error surface.

use keel_core::envelope::{ErrorReport, FrameError, Status};
use keel_net::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The priority queue (plus its session-parked requests) is at the
    /// configured depth. Reported synchronously from `exec`.
    #[error("request queue overflow")]
    QueueOverflow,

    /// The client was closed while the request was pending.
    #[error("client closed, request aborted")]
    Aborted,

    /// The request was cancelled; its callback was suppressed.
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The server answered with a non-success status.
    #[error("server returned {status:?}")]
    Remote {
        status: Status,
        report: Option<ErrorReport>,
    },

    #[error("session refresh failed: {0}")]
    SessionRefresh(String),
}
