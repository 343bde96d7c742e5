//! Server-side error surface.

use keel_core::envelope::FrameError;
use keel_net::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("listener failed: {0}")]
    Listener(std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The peer misbehaved during auth/dispatch (unexpected bytes or a
    /// broken connection while a request was in flight).
    #[error("connection closed during request processing")]
    ConnectionClosed,
}
