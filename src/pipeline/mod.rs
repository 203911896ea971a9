//! Stream plumbing around the aggregation engine
//!
//! `StreamSource` and `StreamSink` are the seams to the outside world; the
//! in-memory implementations back the tests and the JSON-lines ones back the
//! `history-service` binary.

pub mod json_lines;
pub mod runtime;
pub mod sink;
pub mod source;

pub use json_lines::{JsonLinesSink, JsonLinesSource};
pub use runtime::{publish_with_retry, Pipeline, PipelineConfig, PipelineReport};
pub use sink::{LoggingSink, MemorySink, PublishFuture, PublishedRecord, SinkError, StreamSink};
pub use source::{MemorySource, PollFuture, SourceBatch, SourceError, StreamSource};
