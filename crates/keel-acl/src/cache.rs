//! Pluggable decision cache.
//!
//! The cache key is the request fingerprint: the current args plus the
//! initial args from before any hierarchy rewriting, so an answer
//! computed for an ancestor is never served for a different original
//! question.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::{AccessArgs, AccessStatus};

#[async_trait]
pub trait DecisionCache: Send + Sync {
    /// A cached decision, or None (a cached `Unknown` is treated as a
    /// miss by the evaluator and falls through to the store).
    async fn find(&self, args: &AccessArgs, initial: &AccessArgs) -> Option<AccessStatus>;

    async fn set(&self, args: &AccessArgs, initial: &AccessArgs, status: AccessStatus);
}

/// In-process cache with an optional TTL.
pub struct MemoryDecisionCache {
    entries: DashMap<(AccessArgs, AccessArgs), (AccessStatus, Instant)>,
    ttl: Option<Duration>,
}

impl MemoryDecisionCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl DecisionCache for MemoryDecisionCache {
    async fn find(&self, args: &AccessArgs, initial: &AccessArgs) -> Option<AccessStatus> {
        let key = (args.clone(), initial.clone());
        let entry = self.entries.get(&key)?;
        let (status, stored_at) = *entry;
        if let Some(ttl) = self.ttl {
            if stored_at.elapsed() > ttl {
                drop(entry);
                self.entries.remove(&key);
                return None;
            }
        }
        Some(status)
    }

    async fn set(&self, args: &AccessArgs, initial: &AccessArgs, status: AccessStatus) {
        self.entries
            .insert((args.clone(), initial.clone()), (status, Instant::now()));
    }
}
