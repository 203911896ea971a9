//! Windowed keyed-average engine
//!
//! For each reading: derive the key, assign the hopping windows, fold the
//! value into every (key, window) accumulator, advance the watermark and close
//! the windows that ended at or before `watermark - allowed_lateness`.
//!
//! The engine is shared by all pipeline workers (`&self` everywhere). The
//! watermark is a single atomic maximum; the store shard lock is what makes a
//! closed window authoritative.

use super::key::KeyDeriver;
use super::reading::{AggregationResult, Reading};
use super::stats::{EngineStats, EngineStatsSnapshot};
use super::store::{shard_index, AggregationStore, UpdateOutcome, DEFAULT_NUM_SHARDS};
use super::window::{HoppingWindowAssigner, WindowAssigner};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// When expired windows are closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosurePolicy {
    /// Inside `process`, right after the watermark moves
    #[default]
    Inline,
    /// Only when the owner calls `close_expired` (pipeline ticker)
    Periodic,
}

/// Opened once cluster membership is established
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    open: Arc<AtomicBool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate that starts open, for single-process use and tests
    pub fn opened() -> Self {
        let gate = Self::new();
        gate.open();
        gate
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub num_shards: usize,
    pub allowed_lateness_ms: i64,
    pub closure_policy: ClosurePolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            num_shards: DEFAULT_NUM_SHARDS,
            allowed_lateness_ms: 0,
            closure_policy: ClosurePolicy::Inline,
        }
    }
}

pub struct AggregationEngine<K = Box<dyn KeyDeriver>, W = HoppingWindowAssigner> {
    deriver: K,
    assigner: W,
    store: AggregationStore,
    /// Max event timestamp seen; `i64::MIN` until the first reading
    watermark: AtomicI64,
    /// Highest horizon handed to the store so far
    closed_horizon: AtomicI64,
    allowed_lateness_ms: i64,
    closure_policy: ClosurePolicy,
    gate: ReadinessGate,
    stats: Arc<EngineStats>,
}

impl<K: KeyDeriver, W: WindowAssigner> AggregationEngine<K, W> {
    pub fn new(deriver: K, assigner: W, options: EngineOptions, gate: ReadinessGate) -> Self {
        debug_assert!(options.allowed_lateness_ms >= 0, "allowed lateness must be non-negative");
        AggregationEngine {
            deriver,
            assigner,
            store: AggregationStore::new(options.num_shards),
            watermark: AtomicI64::new(i64::MIN),
            closed_horizon: AtomicI64::new(i64::MIN),
            allowed_lateness_ms: options.allowed_lateness_ms.max(0),
            closure_policy: options.closure_policy,
            gate,
            stats: Arc::new(EngineStats::new()),
        }
    }

    /// Fold one reading into its windows
    ///
    /// Returns the results of the windows closed by this call, in closure
    /// order. Under `ClosurePolicy::Periodic` the result is always empty.
    /// Contributions to already-closed windows are dropped and counted.
    pub fn process(&self, reading: &Reading) -> Result<Vec<AggregationResult>> {
        if !self.gate.is_open() {
            self.stats.record_not_ready();
            return Err(Error::NotReady);
        }
        if !reading.value.is_finite() {
            warn!(
                "Skipping reading from '{}' at {} with non-finite value",
                reading.entity_id, reading.timestamp_ms
            );
            self.stats.record_invalid();
            return Ok(Vec::new());
        }
        self.stats.record_reading();

        let key = self.deriver.derive_key(reading);
        let mut applied = 0u64;
        let mut late = 0u64;
        for window in self.assigner.assign(reading.timestamp_ms) {
            match self.store.update(&key, window, reading.value) {
                UpdateOutcome::Applied => applied += 1,
                UpdateOutcome::Late => late += 1,
            }
        }
        self.stats.record_updates(applied, late);
        if late > 0 {
            debug!(
                "Reading {} at {} missed {} closed window(s)",
                key, reading.timestamp_ms, late
            );
            if applied == 0 {
                self.stats.record_dropped();
            }
        }

        self.watermark.fetch_max(reading.timestamp_ms, Ordering::AcqRel);

        match self.closure_policy {
            ClosurePolicy::Inline => Ok(self.close_expired()),
            ClosurePolicy::Periodic => Ok(Vec::new()),
        }
    }

    /// Close every window with `end <= watermark - allowed_lateness`
    pub fn close_expired(&self) -> Vec<AggregationResult> {
        let watermark = self.watermark.load(Ordering::Acquire);
        if watermark == i64::MIN {
            return Vec::new();
        }
        let horizon = watermark.saturating_sub(self.allowed_lateness_ms);

        // Another caller already closed up to here
        let previous = self.closed_horizon.fetch_max(horizon, Ordering::AcqRel);
        if previous >= horizon {
            return Vec::new();
        }

        let closed = self.store.close_until(horizon);
        self.stats
            .record_closure(closed.windows.len() as u64, closed.results.len() as u64);
        if !closed.windows.is_empty() {
            debug!(
                "Closed {} window(s) up to {} with {} result(s)",
                closed.windows.len(),
                horizon,
                closed.results.len()
            );
        }
        closed.results
    }

    /// Emit every partial window; used at shutdown
    pub fn flush(&self) -> Vec<AggregationResult> {
        self.closed_horizon.store(i64::MAX, Ordering::Release);
        let closed = self.store.flush();
        self.stats
            .record_closure(closed.windows.len() as u64, closed.results.len() as u64);
        closed.results
    }

    /// Worker index owning `entity_id` given `workers` workers
    ///
    /// Matches the store shard index when `workers == num_shards`.
    #[inline]
    pub fn route(&self, entity_id: &str, workers: usize) -> usize {
        shard_index(entity_id, workers)
    }

    pub fn watermark(&self) -> Option<i64> {
        match self.watermark.load(Ordering::Acquire) {
            i64::MIN => None,
            wm => Some(wm),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.store.num_shards()
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    pub fn window_assigner(&self) -> &W {
        &self.assigner
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }
}
