//! Value types flowing through the aggregation path
//!
//! `Reading` comes in from the stream source, `AggregationResult` goes out to
//! the sink. Neither is held by the engine beyond the call that handles it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single timestamped sensor measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Sensor identifier
    pub entity_id: String,
    /// Event time (Unix ms)
    pub timestamp_ms: i64,
    /// Measured value
    pub value: f64,
}

impl Reading {
    pub fn new(entity_id: impl Into<String>, timestamp_ms: i64, value: f64) -> Self {
        Reading {
            entity_id: entity_id.into(),
            timestamp_ms,
            value,
        }
    }
}

/// Time-bucket portion of an aggregation key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketDescriptor {
    /// Wall-clock hour, 0..=23
    HourOfDay(u8),
    /// Weekday, Monday = 0 ..= Sunday = 6
    DayOfWeek(u8),
    /// Start of a fixed-granularity bucket (Unix ms)
    TimeBucket(i64),
}

impl fmt::Display for BucketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketDescriptor::HourOfDay(hour) => write!(f, "{}", hour),
            BucketDescriptor::DayOfWeek(day) => write!(f, "{}", day),
            BucketDescriptor::TimeBucket(start) => write!(f, "{}", start),
        }
    }
}

/// Composite grouping key: entity + time bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregationKey {
    pub entity_id: String,
    pub bucket: BucketDescriptor,
}

impl AggregationKey {
    pub fn new(entity_id: impl Into<String>, bucket: BucketDescriptor) -> Self {
        AggregationKey {
            entity_id: entity_id.into(),
            bucket,
        }
    }
}

/// Renders as `<entity>;<bucket>`, the key format published downstream
impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.entity_id, self.bucket)
    }
}

/// One instance of a hopping window, `[start, end)` in Unix ms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowId {
    pub start: i64,
    pub end: i64,
}

impl WindowId {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(end > start, "Window end {} must be after start {}", end, start);
        WindowId { start, end }
    }

    #[inline]
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.start <= timestamp_ms && timestamp_ms < self.end
    }

    pub fn length_ms(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Average of one key over one closed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub key: AggregationKey,
    pub window: WindowId,
    pub average: f64,
    /// Number of readings folded into `average`, always > 0
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_matches_published_format() {
        let key = AggregationKey::new("sensor-1", BucketDescriptor::HourOfDay(13));
        assert_eq!(key.to_string(), "sensor-1;13");
    }

    #[test]
    fn test_key_ordering_is_total() {
        let a = AggregationKey::new("a", BucketDescriptor::HourOfDay(5));
        let b = AggregationKey::new("a", BucketDescriptor::HourOfDay(6));
        let c = AggregationKey::new("b", BucketDescriptor::HourOfDay(0));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_window_contains_is_half_open() {
        let window = WindowId::new(0, 50_000);
        assert!(window.contains(0));
        assert!(window.contains(49_999));
        assert!(!window.contains(50_000));
        assert!(!window.contains(-1));
        assert_eq!(window.length_ms(), 50_000);
    }

    #[test]
    fn test_reading_json_shape() {
        let reading = Reading::new("sensor-1", 1_000, 10.5);
        let json = serde_json::to_string(&reading).unwrap();
        assert_eq!(
            json,
            r#"{"entity_id":"sensor-1","timestamp_ms":1000,"value":10.5}"#
        );
        let parsed: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reading);
    }
}
