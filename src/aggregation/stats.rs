//! Engine counters
//!
//! Lock-free counters updated on the hot path and read by the pipeline ticker.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    readings_processed: AtomicU64,
    window_updates: AtomicU64,
    late_window_updates: AtomicU64,
    dropped_readings: AtomicU64,
    invalid_readings: AtomicU64,
    windows_closed: AtomicU64,
    results_emitted: AtomicU64,
    not_ready_rejections: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_reading(&self) {
        self.readings_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_updates(&self, applied: u64, late: u64) {
        self.window_updates.fetch_add(applied, Ordering::Relaxed);
        if late > 0 {
            self.late_window_updates.fetch_add(late, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid(&self) {
        self.invalid_readings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closure(&self, windows: u64, results: u64) {
        self.windows_closed.fetch_add(windows, Ordering::Relaxed);
        self.results_emitted.fetch_add(results, Ordering::Relaxed);
    }

    pub(crate) fn record_not_ready(&self) {
        self.not_ready_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            readings_processed: self.readings_processed.load(Ordering::Relaxed),
            window_updates: self.window_updates.load(Ordering::Relaxed),
            late_window_updates: self.late_window_updates.load(Ordering::Relaxed),
            dropped_readings: self.dropped_readings.load(Ordering::Relaxed),
            invalid_readings: self.invalid_readings.load(Ordering::Relaxed),
            windows_closed: self.windows_closed.load(Ordering::Relaxed),
            results_emitted: self.results_emitted.load(Ordering::Relaxed),
            not_ready_rejections: self.not_ready_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Readings accepted by `process`
    pub readings_processed: u64,
    /// (key, window) accumulator updates applied
    pub window_updates: u64,
    /// Updates rejected because their window was already closed
    pub late_window_updates: u64,
    /// Readings whose every window was already closed
    pub dropped_readings: u64,
    /// Readings with a non-finite value
    pub invalid_readings: u64,
    pub windows_closed: u64,
    pub results_emitted: u64,
    /// Readings refused before the readiness gate opened
    pub not_ready_rejections: u64,
}
