//! Downstream result sinks

use crate::aggregation::AggregationResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::info;

/// Publication failed; `unpublished` holds what did not reach the sink
#[derive(Debug)]
pub struct SinkError {
    pub reason: String,
    pub unpublished: Vec<AggregationResult>,
}

impl SinkError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        SinkError {
            reason: reason.into(),
            unpublished: Vec::new(),
        }
    }

    pub fn with_unpublished(mut self, results: Vec<AggregationResult>) -> Self {
        self.unpublished = results;
        self
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} unpublished results)", self.reason, self.unpublished.len())
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::unavailable(e.to_string())
    }
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Publish closed-window results downstream
///
/// A batch is published entirely or not at all.
pub trait StreamSink: Send + Sync + 'static {
    fn publish<'a>(&'a self, results: &'a [AggregationResult]) -> PublishFuture<'a>;
}

/// Published form of a result: the key in `<entity>;<bucket>` form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedRecord {
    pub key: String,
    pub window_start: i64,
    pub window_end: i64,
    pub average: f64,
    pub count: i64,
}

impl From<&AggregationResult> for PublishedRecord {
    fn from(r: &AggregationResult) -> Self {
        PublishedRecord {
            key: r.key.to_string(),
            window_start: r.window.start,
            window_end: r.window.end,
            average: r.average,
            count: r.count,
        }
    }
}

/// Collects results in memory; failures can be injected
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<AggregationResult>>,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    attempts: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every publish call while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn results(&self) -> Vec<AggregationResult> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Publish calls made, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn try_publish(&self, results: &[AggregationResult]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::unavailable("sink marked unavailable"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::unavailable("injected publish failure"));
        }
        self.results.lock().extend_from_slice(results);
        Ok(())
    }
}

impl StreamSink for MemorySink {
    fn publish<'a>(&'a self, results: &'a [AggregationResult]) -> PublishFuture<'a> {
        let outcome = self.try_publish(results);
        Box::pin(async move { outcome })
    }
}

/// Logs every result at info level
#[derive(Debug, Default)]
pub struct LoggingSink;

impl StreamSink for LoggingSink {
    fn publish<'a>(&'a self, results: &'a [AggregationResult]) -> PublishFuture<'a> {
        Box::pin(async move {
            for r in results {
                info!(
                    key = %r.key,
                    window = %r.window,
                    average = r.average,
                    count = r.count,
                    "window result"
                );
            }
            Ok(())
        })
    }
}
