//! Sharded running-average store
//!
//! State is partitioned into shards by a deterministic hash of the entity id.
//! Each shard sits behind its own lock; the pipeline routes every entity to
//! the worker that owns the matching shard, so the ingestion path never
//! contends across workers. Closure walks the shards in index order.
//!
//! Within a window, entries keep first-touch order, which makes the order of
//! emitted results reproducible for a fixed input sequence.
//!
//! Each shard remembers the highest window end it has closed (its horizon).
//! Updates aimed at a window at or below the horizon are rejected under the
//! same lock that closed it, so a racing worker can never resurrect an
//! already-emitted window.

use super::reading::{AggregationKey, AggregationResult, WindowId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{BuildHasher, Hash, Hasher};

pub const DEFAULT_NUM_SHARDS: usize = 16;
pub const NUM_SHARDS_MAX: usize = 1024;

// Fixed seeds keep routing identical across processes and runs
const SHARD_HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Shard owning `entity_id` among `num_shards`
#[inline]
pub fn shard_index(entity_id: &str, num_shards: usize) -> usize {
    debug_assert!(num_shards > 0, "num_shards must be positive");
    let mut hasher = ahash::RandomState::with_seeds(
        SHARD_HASH_SEEDS[0],
        SHARD_HASH_SEEDS[1],
        SHARD_HASH_SEEDS[2],
        SHARD_HASH_SEEDS[3],
    )
    .build_hasher();
    entity_id.hash(&mut hasher);
    let idx = (hasher.finish() as usize) % num_shards;
    debug_assert!(idx < num_shards, "Hash produced invalid shard index");
    idx
}

/// Running sum and count for one (key, window)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregationState {
    pub sum: f64,
    pub count: i64,
}

impl AggregationState {
    #[inline]
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// `None` when nothing was accumulated
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Result of applying one value to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The window was already closed; the value was dropped
    Late,
}

/// All keys accumulated under one window, in first-touch order
#[derive(Debug, Default)]
struct WindowBucket {
    index: HashMap<AggregationKey, usize>,
    entries: Vec<(AggregationKey, AggregationState)>,
}

impl WindowBucket {
    fn update(&mut self, key: &AggregationKey, value: f64) {
        match self.index.get(key) {
            Some(&slot) => self.entries[slot].1.add(value),
            None => {
                let mut state = AggregationState::default();
                state.add(value);
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key.clone(), state));
            }
        }
    }

    fn into_results(self, window: WindowId) -> Vec<AggregationResult> {
        self.entries
            .into_iter()
            .filter_map(|(key, state)| {
                state.average().map(|average| AggregationResult {
                    key,
                    window,
                    average,
                    count: state.count,
                })
            })
            .collect()
    }
}

/// One partition of the store; exclusively owned through its lock
#[derive(Debug)]
pub struct StoreShard {
    windows: BTreeMap<WindowId, WindowBucket>,
    /// Windows with `end <= closed_horizon` have been closed
    closed_horizon: i64,
    /// Windows closed one by one that still lie beyond the horizon
    closed_above_horizon: BTreeSet<WindowId>,
    entries: usize,
}

impl Default for StoreShard {
    fn default() -> Self {
        StoreShard {
            windows: BTreeMap::new(),
            closed_horizon: i64::MIN,
            closed_above_horizon: BTreeSet::new(),
            entries: 0,
        }
    }
}

impl StoreShard {
    pub fn update(&mut self, key: &AggregationKey, window: WindowId, value: f64) -> UpdateOutcome {
        if window.end <= self.closed_horizon || self.closed_above_horizon.contains(&window) {
            return UpdateOutcome::Late;
        }
        let bucket = self.windows.entry(window).or_default();
        let before = bucket.entries.len();
        bucket.update(key, value);
        self.entries += bucket.entries.len() - before;
        UpdateOutcome::Applied
    }

    /// Emit and evict `window`; later updates to it are late
    pub fn close_window(&mut self, window: WindowId) -> Vec<AggregationResult> {
        if window.end > self.closed_horizon {
            self.closed_above_horizon.insert(window);
        }
        self.evict(window)
    }

    fn evict(&mut self, window: WindowId) -> Vec<AggregationResult> {
        match self.windows.remove(&window) {
            Some(bucket) => {
                self.entries -= bucket.entries.len();
                bucket.into_results(window)
            }
            None => Vec::new(),
        }
    }

    /// Close every window ending at or before `horizon`, oldest first
    pub fn close_until(&mut self, horizon: i64) -> Vec<(WindowId, Vec<AggregationResult>)> {
        self.closed_horizon = self.closed_horizon.max(horizon);
        let closed_horizon = self.closed_horizon;
        self.closed_above_horizon.retain(|w| w.end > closed_horizon);

        let closable: Vec<WindowId> = self
            .windows
            .keys()
            .filter(|w| w.end <= horizon)
            .copied()
            .collect();

        closable
            .into_iter()
            .map(|window| (window, self.evict(window)))
            .collect()
    }

    pub fn closed_horizon(&self) -> i64 {
        self.closed_horizon
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn open_entries(&self) -> usize {
        self.entries
    }

    /// Current state of one entry, for inspection
    pub fn get(&self, key: &AggregationKey, window: WindowId) -> Option<AggregationState> {
        let bucket = self.windows.get(&window)?;
        bucket.index.get(key).map(|&slot| bucket.entries[slot].1)
    }
}

/// Outcome of a multi-window closure
#[derive(Debug, Default)]
pub struct ClosedWindows {
    /// Closed windows in ascending order, including those that held no state
    pub windows: Vec<WindowId>,
    /// Results of all closed windows, ordered by window then shard then first touch
    pub results: Vec<AggregationResult>,
}

pub struct AggregationStore {
    shards: Box<[Mutex<StoreShard>]>,
}

impl AggregationStore {
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.clamp(1, NUM_SHARDS_MAX);
        let shards: Vec<Mutex<StoreShard>> =
            (0..num_shards).map(|_| Mutex::new(StoreShard::default())).collect();
        AggregationStore {
            shards: shards.into_boxed_slice(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn shard_for(&self, key: &AggregationKey) -> usize {
        shard_index(&key.entity_id, self.shards.len())
    }

    /// Add `value` to the (key, window) accumulator, creating it on first touch
    ///
    /// No deduplication: re-delivering a reading counts it again.
    pub fn update(&self, key: &AggregationKey, window: WindowId, value: f64) -> UpdateOutcome {
        let idx = self.shard_for(key);
        self.shards[idx].lock().update(key, window, value)
    }

    /// Emit and evict every key under `window`; later updates to it are late
    ///
    /// A window without state yields nothing.
    pub fn close_window(&self, window: WindowId) -> Vec<AggregationResult> {
        let mut results = Vec::new();
        for shard in self.shards.iter() {
            results.extend(shard.lock().close_window(window));
        }
        results
    }

    /// Close every window with `end <= horizon` across all shards
    pub fn close_until(&self, horizon: i64) -> ClosedWindows {
        let mut by_window: BTreeMap<WindowId, Vec<AggregationResult>> = BTreeMap::new();
        for shard in self.shards.iter() {
            for (window, results) in shard.lock().close_until(horizon) {
                by_window.entry(window).or_default().extend(results);
            }
        }

        let mut closed = ClosedWindows::default();
        for (window, results) in by_window {
            closed.windows.push(window);
            closed.results.extend(results);
        }
        closed
    }

    /// Close everything that is still open
    pub fn flush(&self) -> ClosedWindows {
        self.close_until(i64::MAX)
    }

    pub fn get(&self, key: &AggregationKey, window: WindowId) -> Option<AggregationState> {
        let idx = self.shard_for(key);
        self.shards[idx].lock().get(key, window)
    }

    /// Number of distinct (shard, window) buckets still open
    pub fn open_windows(&self) -> usize {
        self.shards.iter().map(|s| s.lock().open_windows()).sum()
    }

    pub fn open_entries(&self) -> usize {
        self.shards.iter().map(|s| s.lock().open_entries()).sum()
    }
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_SHARDS)
    }
}
