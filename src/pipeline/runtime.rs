//! Ingestion runtime
//!
//! ```text
//! partition readers ──route(entity)──▶ shard workers ──▶ publisher ──▶ sink
//!                                           ▲
//!                          ticker: close_expired + stats
//! ```
//!
//! Every reading for an entity goes to the same worker, so a worker owns the
//! store shard its entities hash to. Shutdown stops the readers, lets the
//! workers drain their queues, flushes the partial windows and publishes them
//! before `run` returns.

use super::sink::{SinkError, StreamSink};
use super::source::StreamSource;
use crate::aggregation::{
    AggregationEngine, AggregationResult, EngineStatsSnapshot, KeyDeriver, Reading,
    WindowAssigner,
};
use crate::config::duration_millis;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Error as IoError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BATCH_SIZE_MAX: usize = 65_536;
const WORKERS_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker tasks; 0 means one per store shard
    pub workers: usize,
    /// Max readings per source poll
    pub batch_size: usize,
    /// Bounded queue depth for worker and result channels
    pub channel_capacity: usize,
    /// Period of the closure/stats ticker
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
    /// Sleep when a live partition has no data
    #[serde(with = "duration_millis")]
    pub idle_poll: Duration,
    /// Publish attempts per result batch before giving up
    pub sink_attempts: u32,
    #[serde(with = "duration_millis")]
    pub sink_backoff_base: Duration,
    #[serde(with = "duration_millis")]
    pub sink_backoff_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: 0,
            batch_size: 512,
            channel_capacity: 64,
            tick_interval: Duration::from_millis(1000),
            idle_poll: Duration::from_millis(50),
            sink_attempts: 5,
            sink_backoff_base: Duration::from_millis(100),
            sink_backoff_max: Duration::from_millis(5000),
        }
    }
}

impl PipelineConfig {
    /// Fast ticks and short backoff
    pub fn test() -> Self {
        PipelineConfig {
            workers: 0,
            batch_size: 64,
            channel_capacity: 16,
            tick_interval: Duration::from_millis(10),
            idle_poll: Duration::from_millis(5),
            sink_attempts: 3,
            sink_backoff_base: Duration::from_millis(1),
            sink_backoff_max: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers > WORKERS_MAX {
            return Err(Error::invalid_config(format!(
                "workers {} exceeds maximum {}",
                self.workers, WORKERS_MAX
            )));
        }
        if self.batch_size == 0 || self.batch_size > BATCH_SIZE_MAX {
            return Err(Error::invalid_config(format!(
                "batch_size must be in 1..={}, got {}",
                BATCH_SIZE_MAX, self.batch_size
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::invalid_config("channel_capacity must be positive"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::invalid_config("tick_interval must be positive"));
        }
        if self.sink_attempts == 0 {
            return Err(Error::invalid_config("sink_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Backoff before publish retry `attempt` (1-based), doubling up to the max
    pub fn sink_backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.sink_backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.sink_backoff_max)
    }
}

/// Totals for one `Pipeline::run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub readings_read: u64,
    pub results_published: u64,
    pub publish_batches: u64,
    pub publish_retries: u64,
    pub engine: EngineStatsSnapshot,
}

#[derive(Debug, Default, Clone, Copy)]
struct PublisherTotals {
    results: u64,
    batches: u64,
    retries: u64,
}

pub struct Pipeline<K: KeyDeriver, W: WindowAssigner> {
    engine: Arc<AggregationEngine<K, W>>,
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn StreamSink>,
    config: PipelineConfig,
}

impl<K: KeyDeriver, W: WindowAssigner> Pipeline<K, W> {
    pub fn new(
        engine: Arc<AggregationEngine<K, W>>,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn StreamSink>,
        config: PipelineConfig,
    ) -> Self {
        Pipeline {
            engine,
            source,
            sink,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine<K, W>> {
        &self.engine
    }

    fn worker_count(&self) -> usize {
        match self.config.workers {
            0 => self.engine.num_shards(),
            n => n,
        }
    }

    /// Run until every partition ends or `shutdown` is cancelled
    ///
    /// Fails with `NotReady` when the readiness gate is closed, and with
    /// `SinkUnavailable` (carrying every result that was not published) once
    /// publication retries are exhausted.
    pub async fn run(self, shutdown: CancellationToken) -> Result<PipelineReport> {
        self.config.validate()?;
        if !self.engine.gate().is_open() {
            return Err(Error::NotReady);
        }

        let workers = self.worker_count();
        let partitions = self.source.partitions();
        info!(
            "Pipeline starting: {} partition(s), {} worker(s), {} store shard(s)",
            partitions,
            workers,
            self.engine.num_shards()
        );

        // Internal stop signal: external shutdown or a fatal task error
        let halt = shutdown.child_token();
        let (result_tx, result_rx) = mpsc::channel::<Vec<AggregationResult>>(self.config.channel_capacity);

        let publisher = tokio::spawn(publish_loop(
            self.sink.clone(),
            result_rx,
            self.config.clone(),
            halt.clone(),
        ));

        let mut worker_txs = Vec::with_capacity(workers);
        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel::<Vec<Reading>>(self.config.channel_capacity);
            worker_txs.push(tx);
            worker_handles.push(tokio::spawn(worker_loop(
                worker_id,
                self.engine.clone(),
                rx,
                result_tx.clone(),
                halt.clone(),
            )));
        }

        let ticker_stop = CancellationToken::new();
        let ticker = tokio::spawn(tick_loop(
            self.engine.clone(),
            result_tx.clone(),
            self.config.tick_interval,
            ticker_stop.clone(),
        ));

        let reader_handles: Vec<JoinHandle<Result<u64>>> = (0..partitions)
            .map(|partition| {
                tokio::spawn(read_loop(
                    partition,
                    self.source.clone(),
                    self.engine.clone(),
                    worker_txs.clone(),
                    self.config.clone(),
                    halt.clone(),
                ))
            })
            .collect();
        // Workers end once every reader has dropped its senders
        drop(worker_txs);

        let mut first_error: Option<Error> = None;
        let mut readings_read = 0u64;
        for handle in reader_handles {
            match flatten(handle.await) {
                Ok(n) => readings_read += n,
                Err(e) => {
                    halt.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
        for handle in worker_handles {
            if let Err(e) = flatten(handle.await) {
                halt.cancel();
                first_error.get_or_insert(e);
            }
        }
        ticker_stop.cancel();
        if let Err(e) = ticker.await {
            first_error.get_or_insert(join_error(e));
        }

        let flushed = self.engine.flush();
        if !flushed.is_empty() {
            info!("Flushing {} partial window result(s)", flushed.len());
            if result_tx.send(flushed).await.is_err() {
                warn!("Publisher stopped before flushed results could be queued");
            }
        }
        drop(result_tx);

        let totals = match flatten(publisher.await) {
            Ok(totals) => totals,
            // A sink failure carries the unpublished results; report it first
            Err(e) => return Err(e),
        };

        if let Some(e) = first_error {
            error!("Pipeline stopped with error: {}", e);
            return Err(e);
        }

        let report = PipelineReport {
            readings_read,
            results_published: totals.results,
            publish_batches: totals.batches,
            publish_retries: totals.retries,
            engine: self.engine.stats(),
        };
        info!(
            "Pipeline stopped: {} reading(s) read, {} result(s) published",
            report.readings_read, report.results_published
        );
        Ok(report)
    }
}

fn join_error(e: JoinError) -> Error {
    Error::Io(IoError::other(format!("pipeline task failed: {}", e)))
}

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.map_err(join_error)?
}

async fn read_loop<K: KeyDeriver, W: WindowAssigner>(
    partition: u32,
    source: Arc<dyn StreamSource>,
    engine: Arc<AggregationEngine<K, W>>,
    workers: Vec<mpsc::Sender<Vec<Reading>>>,
    config: PipelineConfig,
    halt: CancellationToken,
) -> Result<u64> {
    debug_assert!(!workers.is_empty(), "Reader needs at least one worker");
    let mut read = 0u64;

    loop {
        let polled = tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            polled = source.poll_batch(partition, config.batch_size) => polled?,
        };
        let Some(batch) = polled else {
            debug!("Partition {} ended after {} reading(s)", partition, read);
            break;
        };

        if batch.readings.is_empty() {
            tokio::select! {
                _ = halt.cancelled() => break,
                _ = tokio::time::sleep(config.idle_poll) => continue,
            }
        }

        read += batch.readings.len() as u64;
        let mut routed: Vec<Vec<Reading>> = vec![Vec::new(); workers.len()];
        for reading in batch.readings {
            let worker = engine.route(&reading.entity_id, workers.len());
            routed[worker].push(reading);
        }
        for (worker, readings) in routed.into_iter().enumerate() {
            if readings.is_empty() {
                continue;
            }
            if workers[worker].send(readings).await.is_err() {
                // Worker gone: it hit a fatal error and cancelled `halt`
                return Ok(read);
            }
        }
    }
    Ok(read)
}

async fn worker_loop<K: KeyDeriver, W: WindowAssigner>(
    worker_id: usize,
    engine: Arc<AggregationEngine<K, W>>,
    mut rx: mpsc::Receiver<Vec<Reading>>,
    results: mpsc::Sender<Vec<AggregationResult>>,
    halt: CancellationToken,
) -> Result<()> {
    while let Some(batch) = rx.recv().await {
        let mut closed = Vec::new();
        for reading in &batch {
            match engine.process(reading) {
                Ok(emitted) => closed.extend(emitted),
                Err(e) => {
                    warn!("Worker {} stopping: {}", worker_id, e);
                    halt.cancel();
                    return Err(e);
                }
            }
        }
        if !closed.is_empty() && results.send(closed).await.is_err() {
            debug!("Worker {} lost the publisher", worker_id);
            halt.cancel();
            break;
        }
    }
    Ok(())
}

async fn tick_loop<K: KeyDeriver, W: WindowAssigner>(
    engine: Arc<AggregationEngine<K, W>>,
    results: mpsc::Sender<Vec<AggregationResult>>,
    period: Duration,
    stop: CancellationToken,
) {
    // First tick one period from now, not immediately
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let closed = engine.close_expired();
        if !closed.is_empty() && results.send(closed).await.is_err() {
            break;
        }

        let stats = engine.stats();
        debug!(
            readings = stats.readings_processed,
            late_updates = stats.late_window_updates,
            dropped = stats.dropped_readings,
            windows_closed = stats.windows_closed,
            results = stats.results_emitted,
            watermark = ?engine.watermark(),
            "engine stats"
        );
    }
}

async fn publish_loop(
    sink: Arc<dyn StreamSink>,
    mut rx: mpsc::Receiver<Vec<AggregationResult>>,
    config: PipelineConfig,
    halt: CancellationToken,
) -> Result<PublisherTotals> {
    let mut totals = PublisherTotals::default();

    while let Some(batch) = rx.recv().await {
        match publish_with_retry(sink.as_ref(), &batch, &config).await {
            Ok(retries) => {
                totals.results += batch.len() as u64;
                totals.batches += 1;
                totals.retries += retries as u64;
            }
            Err(e) => {
                error!("Giving up on sink after {} attempt(s): {}", config.sink_attempts, e);
                halt.cancel();
                // Collect everything still in flight so the caller sees it
                let mut unpublished = batch;
                while let Some(more) = rx.recv().await {
                    unpublished.extend(more);
                }
                return Err(Error::SinkUnavailable(e.with_unpublished(unpublished)));
            }
        }
    }
    Ok(totals)
}

/// Publish `batch`, retrying with backoff; returns the number of retries used
pub async fn publish_with_retry(
    sink: &dyn StreamSink,
    batch: &[AggregationResult],
    config: &PipelineConfig,
) -> std::result::Result<u32, SinkError> {
    let mut attempt = 1;
    loop {
        match sink.publish(batch).await {
            Ok(()) => return Ok(attempt - 1),
            Err(e) if attempt >= config.sink_attempts => return Err(e),
            Err(e) => {
                let backoff = config.sink_backoff_for(attempt);
                warn!(
                    "Publish attempt {} of {} failed: {}; retrying in {:?}",
                    attempt, config.sink_attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
