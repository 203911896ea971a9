//! Deterministic Simulation Testing for the aggregation engine
//!
//! Seeded workloads drive the engine while a shadow model replays the same
//! closure rule independently:
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = AggregationDSTHarness::new(AggregationDSTConfig::moderate(seed))?;
//!     harness.run(1000);
//!     harness.check_invariants();   // flush, then compare with the shadow
//! }
//! ```
//!
//! Checked after every operation and at the end:
//! 1. Every emitted average equals the shadow mean of the applied values
//! 2. No (key, window) is emitted twice
//! 3. No result has a zero count
//! 4. Results are emitted in non-decreasing window order
//! 5. After the final flush every shadow entry has been emitted

use super::engine::{AggregationEngine, ClosurePolicy, EngineOptions, ReadinessGate};
use super::key::{KeyDeriver, TimeBucketKeyDeriver};
use super::reading::{AggregationKey, AggregationResult, Reading, WindowId};
use super::window::{HoppingWindowAssigner, WindowAssigner};
use crate::error::Result;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};

const KEY_GRANULARITY_MS: i64 = 3_600_000;
const AVERAGE_TOLERANCE: f64 = 1e-6;

/// Configuration for aggregation DST
#[derive(Debug, Clone)]
pub struct AggregationDSTConfig {
    pub seed: u64,
    pub num_entities: usize,
    pub num_shards: usize,
    pub window_length_ms: i64,
    pub hop_ms: i64,
    pub allowed_lateness_ms: i64,
    pub closure_policy: ClosurePolicy,
    /// Mean event-time advance between readings
    pub step_ms: i64,
    /// Max backwards jitter of an event timestamp
    pub max_disorder_ms: i64,
    /// Probability of a reading far behind the watermark
    pub late_probability: f64,
    /// Probability of re-delivering an earlier reading
    pub redelivery_probability: f64,
    /// Probability of an explicit `close_expired` call
    pub close_probability: f64,
}

impl Default for AggregationDSTConfig {
    fn default() -> Self {
        AggregationDSTConfig {
            seed: 0,
            num_entities: 8,
            num_shards: 4,
            window_length_ms: 10_000,
            hop_ms: 1_000,
            allowed_lateness_ms: 0,
            closure_policy: ClosurePolicy::Inline,
            step_ms: 250,
            max_disorder_ms: 0,
            late_probability: 0.0,
            redelivery_probability: 0.0,
            close_probability: 0.0,
        }
    }
}

impl AggregationDSTConfig {
    pub fn new(seed: u64) -> Self {
        AggregationDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// In-order readings, no duplicates
    pub fn calm(seed: u64) -> Self {
        AggregationDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Bounded disorder, some duplicates, a little lateness slack
    pub fn moderate(seed: u64) -> Self {
        AggregationDSTConfig {
            seed,
            window_length_ms: 6_000,
            hop_ms: 2_000,
            allowed_lateness_ms: 1_000,
            max_disorder_ms: 3_000,
            redelivery_probability: 0.05,
            late_probability: 0.02,
            ..Default::default()
        }
    }

    /// Heavy disorder and lateness, periodic closure
    pub fn chaos(seed: u64) -> Self {
        AggregationDSTConfig {
            seed,
            num_entities: 20,
            num_shards: 7,
            window_length_ms: 50_000,
            hop_ms: 1_000,
            closure_policy: ClosurePolicy::Periodic,
            step_ms: 700,
            max_disorder_ms: 20_000,
            redelivery_probability: 0.1,
            late_probability: 0.1,
            close_probability: 0.1,
            ..Default::default()
        }
    }
}

/// Aggregation operation type
#[derive(Debug, Clone)]
pub enum AggregationOperation {
    Ingest(Reading),
    /// At-least-once re-delivery of an earlier reading
    Redeliver(Reading),
    CloseExpired,
}

/// Workload generator
pub struct AggregationWorkload {
    rng: ChaCha8Rng,
    config: AggregationDSTConfig,
    event_time_ms: i64,
    delivered: Vec<Reading>,
}

impl AggregationWorkload {
    pub fn new(config: AggregationDSTConfig) -> Self {
        AggregationWorkload {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            event_time_ms: 1_700_000_000_000,
            delivered: Vec::new(),
        }
    }

    pub fn next_operation(&mut self) -> AggregationOperation {
        if self.config.close_probability > 0.0 && self.rng.gen_bool(self.config.close_probability) {
            return AggregationOperation::CloseExpired;
        }
        if !self.delivered.is_empty()
            && self.config.redelivery_probability > 0.0
            && self.rng.gen_bool(self.config.redelivery_probability)
        {
            let idx = self.rng.gen_range(0..self.delivered.len());
            return AggregationOperation::Redeliver(self.delivered[idx].clone());
        }

        self.event_time_ms += self.rng.gen_range(0..=self.config.step_ms * 2);
        let mut timestamp_ms = self.event_time_ms;
        if self.config.max_disorder_ms > 0 {
            timestamp_ms -= self.rng.gen_range(0..=self.config.max_disorder_ms);
        }
        if self.config.late_probability > 0.0 && self.rng.gen_bool(self.config.late_probability) {
            timestamp_ms -= self.config.window_length_ms * self.rng.gen_range(1..4);
        }

        let entity = format!("sensor-{}", self.rng.gen_range(0..self.config.num_entities));
        let value = (self.rng.gen_range(-1_000..=1_000) as f64) / 8.0;
        let reading = Reading::new(entity, timestamp_ms, value);
        self.delivered.push(reading.clone());
        AggregationOperation::Ingest(reading)
    }
}

/// Independent model of what the engine should have accumulated
#[derive(Debug, Default)]
struct ShadowModel {
    watermark: Option<i64>,
    closed_horizon: Option<i64>,
    entries: HashMap<(AggregationKey, WindowId), (f64, i64)>,
    late_updates: u64,
}

impl ShadowModel {
    fn apply(&mut self, key: &AggregationKey, windows: &[WindowId], reading: &Reading) {
        for window in windows {
            if self.closed_horizon.is_some_and(|h| window.end <= h) {
                self.late_updates += 1;
                continue;
            }
            let entry = self.entries.entry((key.clone(), *window)).or_insert((0.0, 0));
            entry.0 += reading.value;
            entry.1 += 1;
        }
        self.watermark = Some(self.watermark.map_or(reading.timestamp_ms, |w| w.max(reading.timestamp_ms)));
    }

    fn close(&mut self, allowed_lateness_ms: i64) {
        if let Some(wm) = self.watermark {
            let horizon = wm.saturating_sub(allowed_lateness_ms);
            self.closed_horizon = Some(self.closed_horizon.map_or(horizon, |h| h.max(horizon)));
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct AggregationDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub readings: u64,
    pub redeliveries: u64,
    pub closes: u64,
    pub late_window_updates: u64,
    pub results_emitted: u64,
    pub invariant_violations: Vec<String>,
}

impl AggregationDSTResult {
    pub fn new(seed: u64) -> Self {
        AggregationDSTResult {
            seed,
            total_operations: 0,
            readings: 0,
            redeliveries: 0,
            closes: 0,
            late_window_updates: 0,
            results_emitted: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} readings, {} redeliveries, {} closes), {} late updates, {} results, {} violations",
            self.seed,
            self.total_operations,
            self.readings,
            self.redeliveries,
            self.closes,
            self.late_window_updates,
            self.results_emitted,
            self.invariant_violations.len()
        )
    }
}

/// Main DST harness for the aggregation engine
pub struct AggregationDSTHarness {
    config: AggregationDSTConfig,
    engine: AggregationEngine<TimeBucketKeyDeriver, HoppingWindowAssigner>,
    deriver: TimeBucketKeyDeriver,
    assigner: HoppingWindowAssigner,
    workload: AggregationWorkload,
    shadow: ShadowModel,
    emitted: HashSet<(AggregationKey, WindowId)>,
    last_window: Option<WindowId>,
    result: AggregationDSTResult,
}

impl AggregationDSTHarness {
    pub fn new(config: AggregationDSTConfig) -> Result<Self> {
        let deriver = TimeBucketKeyDeriver::new(KEY_GRANULARITY_MS)?;
        let assigner = HoppingWindowAssigner::from_millis(config.window_length_ms, config.hop_ms)?;
        let engine = AggregationEngine::new(
            deriver,
            assigner,
            EngineOptions {
                num_shards: config.num_shards,
                allowed_lateness_ms: config.allowed_lateness_ms,
                closure_policy: config.closure_policy,
            },
            ReadinessGate::opened(),
        );

        Ok(AggregationDSTHarness {
            workload: AggregationWorkload::new(config.clone()),
            result: AggregationDSTResult::new(config.seed),
            config,
            engine,
            deriver,
            assigner,
            shadow: ShadowModel::default(),
            emitted: HashSet::new(),
            last_window: None,
        })
    }

    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute_operation(op);
        }
    }

    fn execute_operation(&mut self, op: AggregationOperation) {
        self.result.total_operations += 1;

        let results = match op {
            AggregationOperation::Ingest(reading) => {
                self.result.readings += 1;
                self.ingest(&reading)
            }
            AggregationOperation::Redeliver(reading) => {
                self.result.redeliveries += 1;
                self.ingest(&reading)
            }
            AggregationOperation::CloseExpired => {
                self.result.closes += 1;
                self.shadow.close(self.config.allowed_lateness_ms);
                self.engine.close_expired()
            }
        };
        self.check_results(&results);
    }

    fn ingest(&mut self, reading: &Reading) -> Vec<AggregationResult> {
        let key = self.deriver.derive_key(reading);
        let windows = self.assigner.assign(reading.timestamp_ms);
        self.shadow.apply(&key, &windows, reading);
        if self.config.closure_policy == ClosurePolicy::Inline {
            self.shadow.close(self.config.allowed_lateness_ms);
        }

        match self.engine.process(reading) {
            Ok(results) => results,
            Err(e) => {
                self.result
                    .invariant_violations
                    .push(format!("process failed with open gate: {}", e));
                Vec::new()
            }
        }
    }

    fn check_results(&mut self, results: &[AggregationResult]) {
        for r in results {
            self.result.results_emitted += 1;

            if r.count <= 0 {
                self.result
                    .invariant_violations
                    .push(format!("{} {} emitted with count {}", r.key, r.window, r.count));
            }

            if let Some(last) = self.last_window {
                if r.window < last {
                    self.result.invariant_violations.push(format!(
                        "{} emitted after {}: window order regressed",
                        r.window, last
                    ));
                }
            }
            self.last_window = Some(r.window);

            let id = (r.key.clone(), r.window);
            if !self.emitted.insert(id.clone()) {
                self.result
                    .invariant_violations
                    .push(format!("{} {} emitted twice", r.key, r.window));
            }

            match self.shadow.entries.get(&id) {
                Some(&(sum, count)) => {
                    let expected = sum / count as f64;
                    if count != r.count || (expected - r.average).abs() > AVERAGE_TOLERANCE {
                        self.result.invariant_violations.push(format!(
                            "{} {}: engine avg {} over {}, shadow avg {} over {}",
                            r.key, r.window, r.average, r.count, expected, count
                        ));
                    }
                }
                None => self.result.invariant_violations.push(format!(
                    "{} {} emitted but never accumulated by the shadow",
                    r.key, r.window
                )),
            }
        }
    }

    /// Flush the engine and check completeness against the shadow
    pub fn check_invariants(&mut self) {
        let flushed = self.engine.flush();
        self.check_results(&flushed);

        for (key, window) in self.shadow.entries.keys() {
            if !self.emitted.contains(&(key.clone(), *window)) {
                self.result
                    .invariant_violations
                    .push(format!("{} {} accumulated but never emitted", key, window));
            }
        }

        let stats = self.engine.stats();
        self.result.late_window_updates = stats.late_window_updates;
        if stats.late_window_updates != self.shadow.late_updates {
            self.result.invariant_violations.push(format!(
                "engine counted {} late updates, shadow {}",
                stats.late_window_updates, self.shadow.late_updates
            ));
        }
        if self.engine.store().open_entries() != 0 {
            self.result
                .invariant_violations
                .push("store not empty after flush".to_string());
        }
    }

    pub fn result(&self) -> &AggregationDSTResult {
        &self.result
    }

    pub fn into_result(self) -> AggregationDSTResult {
        self.result
    }
}

/// Run a batch of DST tests with consecutive seeds
pub fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> AggregationDSTConfig,
) -> Vec<AggregationDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let seed = base_seed + i as u64;
        match AggregationDSTHarness::new(config_fn(seed)) {
            Ok(mut harness) => {
                harness.run(ops_per_run);
                harness.check_invariants();
                results.push(harness.into_result());
            }
            Err(e) => {
                let mut result = AggregationDSTResult::new(seed);
                result.invariant_violations.push(format!("invalid config: {}", e));
                results.push(result);
            }
        }
    }
    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[AggregationDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_results: u64 = results.iter().map(|r| r.results_emitted).sum();
    let total_late: u64 = results.iter().map(|r| r.late_window_updates).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} results, {} late updates",
        passed, total, total_ops, total_results, total_late
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_harness_calm() {
        let mut harness = AggregationDSTHarness::new(AggregationDSTConfig::calm(42)).unwrap();
        harness.run(300);
        harness.check_invariants();

        let result = harness.result();
        assert!(
            result.is_success(),
            "Calm mode should not have invariant violations: {:?}",
            result.invariant_violations
        );
        assert_eq!(result.late_window_updates, 0);
        assert!(result.results_emitted > 0);
    }

    #[test]
    fn test_dst_harness_chaos() {
        let mut harness = AggregationDSTHarness::new(AggregationDSTConfig::chaos(7)).unwrap();
        harness.run(500);
        harness.check_invariants();

        let result = harness.result();
        println!("{}", result.summary());
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert!(result.redeliveries > 0);
        assert!(result.closes > 0);
    }

    #[test]
    fn test_dst_deterministic() {
        let run = |seed| {
            let mut harness = AggregationDSTHarness::new(AggregationDSTConfig::moderate(seed)).unwrap();
            harness.run(200);
            harness.check_invariants();
            let r = harness.into_result();
            (r.results_emitted, r.late_window_updates, r.redeliveries)
        };
        assert_eq!(run(12345), run(12345), "Same seed should produce same results");
    }

    #[test]
    fn test_workload_generator_mix() {
        let mut workload = AggregationWorkload::new(AggregationDSTConfig::chaos(1));
        let mut ingests = 0;
        let mut redeliveries = 0;
        let mut closes = 0;
        for _ in 0..1000 {
            match workload.next_operation() {
                AggregationOperation::Ingest(_) => ingests += 1,
                AggregationOperation::Redeliver(_) => redeliveries += 1,
                AggregationOperation::CloseExpired => closes += 1,
            }
        }
        assert!(ingests > 500, "Expected mostly ingests");
        assert!(redeliveries > 0);
        assert!(closes > 0);
    }

    #[test]
    fn test_dst_batch_moderate() {
        let results = run_dst_batch(2000, 10, 200, AggregationDSTConfig::moderate);
        println!("{}", summarize_batch(&results));
        assert!(results.iter().all(|r| r.is_success()));
    }
}
