//! Memory pool for short-lived, high-churn buffers (requests, chunks).
//!
//! Buffers are grouped into power-of-two size classes. Each class owns
//! a list of buckets; a bucket is a batch of pre-allocated cells with a
//! free list. When a class runs dry a new bucket is allocated with
//! double the cell count of the previous one, capped by
//! `max_bucket_bytes`. A periodic collect pass retires buckets that
//! have sat empty for longer than `drop_bucket_delay`; retired buckets
//! are reused in preference to fresh allocation when their cell count
//! is at least half the configured initial count.
//!
//! Counters are atomics; structural mutation goes through one mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::MempoolConfig;

/// Smallest cell size handed out. Requests below this are rounded up.
const MIN_CELL_SIZE: usize = 64;

// ── Buckets ───────────────────────────────────────────────────────────────────

struct Bucket {
    /// Returned cells, each with capacity == cell_size of the class.
    cells: Vec<Vec<u8>>,
    /// Total cells this bucket was created with.
    capacity: usize,
    /// Cells currently handed out.
    in_use: usize,
    /// Set when in_use last dropped to zero; cleared on allocation.
    empty_since: Option<Instant>,
}

impl Bucket {
    fn new(cell_size: usize, capacity: usize) -> Self {
        let cells = (0..capacity).map(|_| Vec::with_capacity(cell_size)).collect();
        Self {
            cells,
            capacity,
            in_use: 0,
            empty_since: Some(Instant::now()),
        }
    }
}

struct SizeClass {
    cell_size: usize,
    buckets: Vec<Bucket>,
    /// Empty buckets scheduled for drop, kept for preferential reuse.
    retired: Vec<Bucket>,
}

struct PoolState {
    classes: HashMap<usize, SizeClass>,
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Multi-bucket garbage-collected buffer pool.
///
/// Cloning is cheap; clones share the same storage.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: MempoolConfig,
    state: Mutex<PoolState>,
    allocated_total: AtomicU64,
    in_use: AtomicUsize,
}

impl MemoryPool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    classes: HashMap::new(),
                }),
                allocated_total: AtomicU64::new(0),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate a buffer of at least `len` bytes capacity.
    ///
    /// The buffer starts empty (`len() == 0`); capacity is the size
    /// class the request rounded up to. Returning is implicit: the
    /// buffer goes back to its bucket when the handle drops.
    pub fn allocate(&self, len: usize) -> PoolBuf {
        let cell_size = len.max(MIN_CELL_SIZE).next_power_of_two();
        let inner = &self.inner;

        let data = {
            let mut state = inner.state.lock().expect("mempool mutex poisoned");
            let initial = inner.config.initial_cells.max(1);
            let class = state.classes.entry(cell_size).or_insert_with(|| SizeClass {
                cell_size,
                buckets: Vec::new(),
                retired: Vec::new(),
            });
            take_cell(class, cell_size, initial, inner.config.max_bucket_bytes)
        };

        inner.allocated_total.fetch_add(1, Ordering::Relaxed);
        inner.in_use.fetch_add(1, Ordering::Relaxed);

        PoolBuf {
            data,
            cell_size,
            pool: Arc::downgrade(inner),
        }
    }

    /// Total allocations served over the pool's lifetime.
    pub fn allocated_total(&self) -> u64 {
        self.inner.allocated_total.load(Ordering::Relaxed)
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Cells currently pooled and idle, across all classes.
    pub fn idle_cells(&self) -> usize {
        let state = self.inner.state.lock().expect("mempool mutex poisoned");
        state
            .classes
            .values()
            .map(|c| {
                c.buckets.iter().map(|b| b.cells.len()).sum::<usize>()
                    + c.retired.iter().map(|b| b.cells.len()).sum::<usize>()
            })
            .sum()
    }

    /// One garbage-collection pass: retire buckets empty for longer
    /// than `drop_bucket_delay`, then drop retired buckets that are
    /// too small to be worth reusing.
    pub fn collect(&self) {
        let delay = Duration::from_secs(self.inner.config.drop_bucket_delay_secs);
        let min_reuse = self.inner.config.initial_cells.max(1) / 2;
        let now = Instant::now();

        let mut state = self.inner.state.lock().expect("mempool mutex poisoned");
        let mut dropped = 0usize;
        for class in state.classes.values_mut() {
            // Retired buckets not reused within another full delay go away.
            let before = class.retired.len();
            class
                .retired
                .retain(|b| b.empty_since.is_some_and(|since| now.duration_since(since) < delay));
            dropped += before - class.retired.len();

            let mut i = 0;
            while i < class.buckets.len() {
                let bucket = &class.buckets[i];
                let expired = bucket.in_use == 0
                    && bucket
                        .empty_since
                        .is_some_and(|since| now.duration_since(since) >= delay);
                if expired && class.buckets.len() > 1 {
                    let mut bucket = class.buckets.remove(i);
                    if bucket.capacity >= min_reuse {
                        bucket.empty_since = Some(now);
                        class.retired.push(bucket);
                    } else {
                        dropped += 1;
                    }
                } else {
                    i += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::trace!(dropped, "mempool collected buckets");
        }
    }

    /// Spawn a background task running [`collect`](Self::collect) on
    /// the configured interval. The task stops when the pool is
    /// dropped.
    pub fn spawn_gc(&self) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(self.inner.config.gc_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => MemoryPool { inner }.collect(),
                    None => return,
                }
            }
        })
    }
}

/// Pop a cell from the class, reusing retired buckets before
/// allocating a fresh one with doubled capacity.
fn take_cell(
    class: &mut SizeClass,
    cell_size: usize,
    initial_cells: usize,
    max_bucket_bytes: usize,
) -> Vec<u8> {
    if let Some(bucket) = class.buckets.iter_mut().find(|b| !b.cells.is_empty()) {
        bucket.in_use += 1;
        bucket.empty_since = None;
        return bucket.cells.pop().expect("free cell just observed");
    }

    // Reuse a retired bucket before growing.
    if let Some(mut bucket) = class.retired.pop() {
        bucket.in_use = 1;
        bucket.empty_since = None;
        let cell = bucket.cells.pop().expect("retired buckets hold all their cells");
        class.buckets.push(bucket);
        return cell;
    }

    let last_capacity = class.buckets.last().map(|b| b.capacity).unwrap_or(0);
    let mut capacity = if last_capacity == 0 {
        initial_cells
    } else {
        last_capacity * 2
    };
    let max_cells = (max_bucket_bytes / cell_size.max(1)).max(1);
    capacity = capacity.min(max_cells).max(1);

    let mut bucket = Bucket::new(class.cell_size, capacity);
    bucket.in_use = 1;
    bucket.empty_since = None;
    let cell = bucket.cells.pop().expect("fresh bucket has cells");
    class.buckets.push(bucket);
    cell
}

impl PoolInner {
    fn give_back(&self, mut data: Vec<u8>, cell_size: usize) {
        data.clear();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("mempool mutex poisoned");
        if let Some(class) = state.classes.get_mut(&cell_size) {
            // Return to the fullest bucket first so sparse buckets can
            // drain and be retired.
            if let Some(bucket) = class
                .buckets
                .iter_mut()
                .filter(|b| b.in_use > 0)
                .max_by_key(|b| b.cells.len())
            {
                bucket.cells.push(data);
                bucket.in_use -= 1;
                if bucket.in_use == 0 {
                    bucket.empty_since = Some(Instant::now());
                }
            }
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// An owned buffer borrowed from a [`MemoryPool`].
///
/// Dereferences to `Vec<u8>`. The underlying storage returns to its
/// bucket on drop; if the pool is gone it is simply freed.
pub struct PoolBuf {
    data: Vec<u8>,
    cell_size: usize,
    pool: std::sync::Weak<PoolInner>,
}

impl PoolBuf {
    pub fn capacity(&self) -> usize {
        self.cell_size
    }
}

impl std::ops::Deref for PoolBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(std::mem::take(&mut self.data), self.cell_size);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
