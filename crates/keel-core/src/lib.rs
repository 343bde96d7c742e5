//! Keel core — wire envelope, priorities, status codes, configuration
//! and the memory pool shared by the client and server layers.
//!
//! Nothing in this crate performs I/O. The envelope types ARE the
//! protocol; the config types ARE the tunable surface. Higher layers
//! (keel-client, keel-server, keel-net) build on these without adding
//! wire-visible state of their own.

pub mod config;
pub mod envelope;
pub mod mempool;

pub use config::KeelConfig;
pub use envelope::{
    ErrorCategory, ErrorReport, FrameError, FrameHeader, Priority, RequestEnvelope,
    ResponseEnvelope, Status,
};
pub use mempool::{MemoryPool, PoolBuf};
