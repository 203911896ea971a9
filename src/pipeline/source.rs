//! Upstream reading sources
//!
//! A source is split into partitions, each an ordered log addressed by
//! offset. Delivery is at-least-once: after a `seek` to an earlier offset the
//! same readings are delivered again.

use crate::aggregation::{shard_index, Reading};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io::Error as IoError;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub enum SourceError {
    Io(IoError),
    /// A record could not be decoded into a reading
    Decode { offset: u64, message: String },
    UnknownPartition(u32),
    /// The source cannot rewind to `offset`
    SeekUnsupported { partition: u32, offset: u64 },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Io(e) => write!(f, "I/O error: {}", e),
            SourceError::Decode { offset, message } => {
                write!(f, "cannot decode record at offset {}: {}", offset, message)
            }
            SourceError::UnknownPartition(p) => write!(f, "unknown partition {}", p),
            SourceError::SeekUnsupported { partition, offset } => write!(
                f,
                "partition {} cannot seek to offset {}",
                partition, offset
            ),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for SourceError {
    fn from(e: IoError) -> Self {
        SourceError::Io(e)
    }
}

/// Readings read from one partition
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub partition: u32,
    /// Offset of the first reading in `readings`
    pub offset: u64,
    pub readings: Vec<Reading>,
}

impl SourceBatch {
    pub fn next_offset(&self) -> u64 {
        self.offset + self.readings.len() as u64
    }
}

pub type PollFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<SourceBatch>, SourceError>> + Send + 'a>>;

pub trait StreamSource: Send + Sync + 'static {
    fn partitions(&self) -> u32;

    /// Next batch of at most `max` readings
    ///
    /// `Ok(None)` means the partition has ended; an empty batch means no data
    /// is available right now.
    fn poll_batch(&self, partition: u32, max: usize) -> PollFuture<'_>;

    /// Continue reading `partition` from `offset`
    fn seek(
        &self,
        partition: u32,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;
}

#[derive(Debug, Default)]
struct PartitionLog {
    readings: Vec<Reading>,
    position: usize,
}

/// In-memory partitioned log
///
/// Bounded sources end once drained; live sources keep answering with empty
/// batches until `close` is called.
#[derive(Debug)]
pub struct MemorySource {
    partitions: Vec<Mutex<PartitionLog>>,
    live: bool,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(partitions: u32) -> Self {
        Self::build(partitions, false)
    }

    pub fn live(partitions: u32) -> Self {
        Self::build(partitions, true)
    }

    fn build(partitions: u32, live: bool) -> Self {
        let partitions = partitions.max(1);
        MemorySource {
            partitions: (0..partitions).map(|_| Mutex::new(PartitionLog::default())).collect(),
            live,
            closed: AtomicBool::new(false),
        }
    }

    /// Bounded source with readings spread by entity, like a keyed topic
    pub fn from_readings(readings: impl IntoIterator<Item = Reading>, partitions: u32) -> Self {
        let source = Self::new(partitions);
        for reading in readings {
            source.push_keyed(reading);
        }
        source
    }

    pub fn push_keyed(&self, reading: Reading) {
        let partition = shard_index(&reading.entity_id, self.partitions.len());
        self.partitions[partition].lock().readings.push(reading);
    }

    pub fn push(&self, partition: u32, reading: Reading) -> Result<(), SourceError> {
        let log = self
            .partitions
            .get(partition as usize)
            .ok_or(SourceError::UnknownPartition(partition))?;
        log.lock().readings.push(reading);
        Ok(())
    }

    /// End a live source once its partitions are drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn position(&self, partition: u32) -> Option<u64> {
        self.partitions
            .get(partition as usize)
            .map(|log| log.lock().position as u64)
    }

    fn next_batch(&self, partition: u32, max: usize) -> Result<Option<SourceBatch>, SourceError> {
        let log = self
            .partitions
            .get(partition as usize)
            .ok_or(SourceError::UnknownPartition(partition))?;
        let mut log = log.lock();

        let start = log.position;
        if start >= log.readings.len() {
            let ended = !self.live || self.closed.load(Ordering::Acquire);
            return Ok(if ended {
                None
            } else {
                Some(SourceBatch {
                    partition,
                    offset: start as u64,
                    readings: Vec::new(),
                })
            });
        }

        let end = (start + max.max(1)).min(log.readings.len());
        log.position = end;
        Ok(Some(SourceBatch {
            partition,
            offset: start as u64,
            readings: log.readings[start..end].to_vec(),
        }))
    }
}

impl StreamSource for MemorySource {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn poll_batch(&self, partition: u32, max: usize) -> PollFuture<'_> {
        let batch = self.next_batch(partition, max);
        Box::pin(async move { batch })
    }

    fn seek(
        &self,
        partition: u32,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let result = match self.partitions.get(partition as usize) {
            None => Err(SourceError::UnknownPartition(partition)),
            Some(log) => {
                let mut log = log.lock();
                if offset as usize > log.readings.len() {
                    Err(SourceError::SeekUnsupported { partition, offset })
                } else {
                    log.position = offset as usize;
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }
}
