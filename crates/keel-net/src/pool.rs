//! Connection pool — owns the live transports an RPC client sends on.
//!
//! Rules the dispatcher relies on:
//!   - a request's send and recv use the SAME connection; the handle
//!     returned by `send` is the one passed to `recv`
//!   - a connection returns to the free list only when the caller
//!     releases the handle after both halves completed; dropping the
//!     handle instead discards the connection (it re-dials on demand)
//!   - backpressure is expressed purely through `can_send` — `send`
//!     with no free slot fails rather than queueing
//!
//! One slot is held in reserve for Highest-priority traffic when the
//! pool has more than one connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::transport::BoxedTransport;

/// Dials replacement connections for vacant slots.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedTransport, TransportError>;
}

enum Slot {
    /// No connection; the next send dials one.
    Vacant,
    /// Idle live connection.
    Ready(BoxedTransport),
    /// Checked out by an in-flight request.
    Busy,
}

struct PoolShared {
    slots: Mutex<Vec<Slot>>,
    closed: AtomicBool,
}

/// A connection checked out of the pool for one request.
///
/// Pass back to [`ConnectionPool::release`] after the response is
/// fully received; dropping it discards the connection instead.
pub struct PooledConn {
    shared: Arc<PoolShared>,
    index: usize,
    transport: Option<BoxedTransport>,
}

impl PooledConn {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self.transport.as_mut() {
            Some(transport) => transport.read_exact(buf).await,
            None => Err(TransportError::Closed),
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // Discard semantics: the transport dies, the slot goes vacant.
        if self.transport.take().is_some() {
            if let Ok(mut slots) = self.shared.slots.lock() {
                slots[self.index] = Slot::Vacant;
            }
        }
    }
}

/// The pool. Cloning shares the same slots.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    connector: Arc<dyn Connector>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot::Vacant).collect();
        Self {
            shared: Arc::new(PoolShared {
                slots: Mutex::new(slots),
                closed: AtomicBool::new(false),
            }),
            connector,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.lock().expect("pool mutex").len()
    }

    /// True when a connection is available for this priority class.
    /// `highest` callers may take the last slot; everyone else leaves
    /// one in reserve (when the pool has more than one).
    pub fn can_send(&self, highest: bool) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        let slots = self.shared.slots.lock().expect("pool mutex");
        let available = slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Busy))
            .count();
        if highest || slots.len() == 1 {
            available > 0
        } else {
            available > 1
        }
    }

    /// Write the concatenated buffers on a free connection and return
    /// the handle the response must be read from.
    ///
    /// Cancel-safe: dropping the future mid-dial or mid-write vacates
    /// the slot instead of leaking it as busy.
    pub async fn send(
        &self,
        highest: bool,
        buffers: &[&[u8]],
    ) -> Result<PooledConn, TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let (index, existing) = {
            let mut slots = self.shared.slots.lock().expect("pool mutex");
            let available = slots
                .iter()
                .filter(|slot| !matches!(slot, Slot::Busy))
                .count();
            let reserve_ok = highest || slots.len() == 1 || available > 1;
            if available == 0 || !reserve_ok {
                return Err(TransportError::PoolBusy);
            }
            // Prefer a live connection over dialing a new one.
            let index = slots
                .iter()
                .position(|slot| matches!(slot, Slot::Ready(_)))
                .or_else(|| slots.iter().position(|slot| matches!(slot, Slot::Vacant)))
                .expect("available slot just counted");
            let existing = match std::mem::replace(&mut slots[index], Slot::Busy) {
                Slot::Ready(transport) => Some(transport),
                _ => None,
            };
            (index, existing)
        };
        let mut guard = SlotGuard {
            shared: self.shared.clone(),
            index,
            armed: true,
        };

        let mut transport = match existing {
            Some(transport) => transport,
            None => {
                tracing::debug!(slot = index, "dialing replacement connection");
                self.connector.connect().await?
            }
        };

        for buffer in buffers {
            transport.write_all(buffer).await?;
        }

        guard.armed = false;
        Ok(PooledConn {
            shared: self.shared.clone(),
            index,
            transport: Some(transport),
        })
    }

    /// Read exactly `buf.len()` response bytes on the request's
    /// connection.
    pub async fn recv(
        &self,
        conn: &mut PooledConn,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        conn.read_exact(buf).await
    }

    /// Return a connection to the free list after its send and recv
    /// have both completed.
    pub fn release(&self, mut conn: PooledConn) {
        if self.shared.closed.load(Ordering::Acquire) {
            return; // drop glue vacates the slot
        }
        if let Some(transport) = conn.transport.take() {
            let mut slots = self.shared.slots.lock().expect("pool mutex");
            slots[conn.index] = Slot::Ready(transport);
        }
    }

    /// Cancel and close every connection. In-flight handles discard
    /// on release.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let transports: Vec<BoxedTransport> = {
            let mut slots = self.shared.slots.lock().expect("pool mutex");
            slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, Slot::Vacant) {
                    Slot::Ready(transport) => Some(transport),
                    _ => None,
                })
                .collect()
        };
        let count = transports.len();
        for mut transport in transports {
            let _ = transport.shutdown().await;
        }
        tracing::debug!(closed = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Vacates a busy slot on drop unless disarmed. Covers every early
/// exit of `send`, including cancellation of the future itself.
struct SlotGuard {
    shared: Arc<PoolShared>,
    index: usize,
    armed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut slots) = self.shared.slots.lock() {
                slots[self.index] = Slot::Vacant;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
