//! Keel server — the RPC request loop.
//!
//! The server accepts transports, then runs one strictly sequential
//! pipeline per connection: header, body, parse, optional auth,
//! handler dispatch, response. No request on a connection starts
//! before the previous one's response is fully written.

pub mod dispatch;
pub mod error;
pub mod server;

pub use dispatch::{AuthDispatcher, AuthOutcome, DispatchOutcome, Handler, ServiceRouter};
pub use error::ServerError;
pub use server::{Server, ServerRequest};
