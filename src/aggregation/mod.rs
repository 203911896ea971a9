//! Windowed keyed aggregation
//!
//! Computes a running average per derived key over hopping event-time windows.
//!
//! ## Architecture
//!
//! ```text
//! Reading → KeyDeriver ─┐
//!         → WindowAssigner ─→ AggregationStore (sharded) → closed windows → sink
//!                              ↑
//!                   watermark = max(event time)
//! ```
//!
//! ## Key Features
//!
//! - **Pluggable strategies**: key derivation and window assignment are traits
//! - **Shard-aligned state**: one lock per shard, routed by entity hash
//! - **Event-time closure**: windows close once the watermark passes their end
//! - **Late drops are counted**: updates to closed windows never reopen them

pub mod dst;
pub mod engine;
pub mod key;
pub mod reading;
pub mod stats;
pub mod store;
pub mod window;

pub use dst::{
    run_dst_batch, summarize_batch, AggregationDSTConfig, AggregationDSTHarness,
    AggregationDSTResult, AggregationOperation, AggregationWorkload,
};
pub use engine::{AggregationEngine, ClosurePolicy, EngineOptions, ReadinessGate};
pub use key::{
    DayOfWeekKeyDeriver, HourOfDayKeyDeriver, KeyDeriver, KeyStrategy, TimeBucketKeyDeriver,
};
pub use reading::{AggregationKey, AggregationResult, BucketDescriptor, Reading, WindowId};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use store::{
    shard_index, AggregationState, AggregationStore, ClosedWindows, UpdateOutcome,
    DEFAULT_NUM_SHARDS,
};
pub use window::{assign_windows, HoppingWindowAssigner, WindowAssigner};
