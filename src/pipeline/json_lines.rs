//! JSON-lines adapters
//!
//! One reading per input line (`{"entity_id":..,"timestamp_ms":..,"value":..}`)
//! and one `PublishedRecord` per output line. The input is a single partition
//! whose offset is the line number.

use super::sink::{PublishFuture, PublishedRecord, SinkError, StreamSink};
use super::source::{PollFuture, SourceBatch, SourceError, StreamSource};
use crate::aggregation::{AggregationResult, Reading};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::warn;

type LineReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Read one raw line into `buf`, without its terminator; false at end of input
async fn next_raw_line(reader: &mut LineReader, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    Ok(true)
}

struct ReaderState {
    lines: LineReader,
    buf: Vec<u8>,
    /// Line number of the next line
    line: u64,
    eof: bool,
}

pub struct JsonLinesSource {
    path: Option<PathBuf>,
    state: Mutex<ReaderState>,
    skipped: AtomicU64,
}

impl JsonLinesSource {
    pub fn stdin() -> Self {
        Self::from_reader(None, Box::new(tokio::io::stdin()))
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self::from_reader(Some(path), Box::new(file)))
    }

    pub fn from_reader(path: Option<PathBuf>, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        JsonLinesSource {
            path,
            state: Mutex::new(ReaderState {
                lines: BufReader::new(reader),
                buf: Vec::new(),
                line: 0,
                eof: false,
            }),
            skipped: AtomicU64::new(0),
        }
    }

    /// Malformed or undecodable lines skipped so far
    pub fn skipped_lines(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    async fn read_batch(&self, max: usize) -> Result<Option<SourceBatch>, SourceError> {
        let mut state = self.state.lock().await;
        if state.eof {
            return Ok(None);
        }

        let offset = state.line;
        let mut readings = Vec::with_capacity(max);
        let ReaderState { lines, buf, .. } = &mut *state;
        let mut eof = false;
        let mut consumed = 0;
        while readings.len() < max.max(1) {
            match next_raw_line(lines, buf).await {
                Ok(true) => {}
                Ok(false) => {
                    eof = true;
                    break;
                }
                Err(e) => {
                    state.line += consumed;
                    return Err(e.into());
                }
            }
            let line_no = offset + consumed;
            consumed += 1;

            let trimmed = buf.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Reading>(trimmed) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    warn!("Skipping malformed line {}: {}", line_no, e);
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        state.line += consumed;
        state.eof = eof;

        if readings.is_empty() && state.eof {
            return Ok(None);
        }
        Ok(Some(SourceBatch {
            partition: 0,
            offset,
            readings,
        }))
    }

    async fn seek_to(&self, offset: u64) -> Result<(), SourceError> {
        let path = self.path.as_ref().ok_or(SourceError::SeekUnsupported {
            partition: 0,
            offset,
        })?;
        let file = File::open(path).await?;
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(file);
        let mut lines = BufReader::new(reader);
        let mut buf = Vec::new();

        let mut line = 0;
        while line < offset {
            if !next_raw_line(&mut lines, &mut buf).await? {
                return Err(SourceError::SeekUnsupported {
                    partition: 0,
                    offset,
                });
            }
            line += 1;
        }

        let mut state = self.state.lock().await;
        *state = ReaderState {
            lines,
            buf,
            line,
            eof: false,
        };
        Ok(())
    }
}

impl StreamSource for JsonLinesSource {
    fn partitions(&self) -> u32 {
        1
    }

    fn poll_batch(&self, partition: u32, max: usize) -> PollFuture<'_> {
        Box::pin(async move {
            if partition != 0 {
                return Err(SourceError::UnknownPartition(partition));
            }
            self.read_batch(max).await
        })
    }

    fn seek(
        &self,
        partition: u32,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        Box::pin(async move {
            if partition != 0 {
                return Err(SourceError::UnknownPartition(partition));
            }
            self.seek_to(offset).await
        })
    }
}

pub struct JsonLinesSink {
    writer: Mutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self::from_writer(Box::new(tokio::io::stdout()))
    }

    /// Append to `path`, creating it if needed
    pub async fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn from_writer(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        JsonLinesSink {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    fn encode(results: &[AggregationResult]) -> Result<Vec<u8>, SinkError> {
        let mut buf = Vec::with_capacity(results.len() * 96);
        for r in results {
            serde_json::to_writer(&mut buf, &PublishedRecord::from(r))
                .map_err(|e| SinkError::unavailable(format!("cannot encode result: {}", e)))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

impl StreamSink for JsonLinesSink {
    fn publish<'a>(&'a self, results: &'a [AggregationResult]) -> PublishFuture<'a> {
        Box::pin(async move {
            let buf = Self::encode(results)?;
            let mut writer = self.writer.lock().await;
            writer.write_all(&buf).await?;
            writer.flush().await?;
            Ok(())
        })
    }
}
