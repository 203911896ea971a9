//! History service: windowed keyed averages over sensor readings
//!
//! A node joins a cluster (`cluster`), then consumes readings from a
//! partitioned source, folds them into hopping event-time windows per
//! `(entity, time bucket)` key (`aggregation`) and publishes one average per
//! key and closed window to a sink (`pipeline`).

pub mod aggregation;
pub mod cluster;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;

#[cfg(test)]
mod stateright;

pub use aggregation::{
    AggregationEngine, AggregationKey, AggregationResult, BucketDescriptor, ClosurePolicy,
    EngineOptions, HoppingWindowAssigner, KeyDeriver, KeyStrategy, ReadinessGate, Reading,
    WindowAssigner, WindowId,
};
pub use cluster::{ClusterConfig, ClusterMembership, DiscoveryStrategy, MembershipCoordinator, MembershipState};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport, StreamSink, StreamSource};
