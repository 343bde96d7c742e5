//! Bounded LRU cache for decrypted chunks.
//!
//! A plain map with usage stamps. Capacity is small (default 8
//! chunks), so eviction scans are cheaper than a linked-list LRU would
//! be. Insertion over capacity returns the evicted entry so the caller
//! can flush it if dirty.

use std::collections::HashMap;
use std::hash::Hash;

pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (u64, V)>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::with_capacity(capacity.max(1)),
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up and touch.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(stamp, value)| {
            *stamp = tick;
            value
        })
    }

    /// Insert, touching the entry. Returns the evicted
    /// least-recently-used entry when the cache was full.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.tick += 1;
        let evicted = if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };
        self.entries.insert(key, (self.tick, value));
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Drain every entry, unordered.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.entries
            .drain()
            .map(|(key, (_, value))| (key, value))
            .collect()
    }

    /// Keys currently cached, unordered.
    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, (stamp, _))| *stamp)
            .map(|(key, _)| key.clone())?;
        let (_, value) = self.entries.remove(&key)?;
        Some((key, value))
    }
}
