//! Key derivation strategies
//!
//! A `KeyDeriver` maps a reading to its grouping key. The time-bucket part is
//! computed from the wall-clock breakdown of the event timestamp in a time
//! zone that is fixed when the deriver is built, so equal inputs always give
//! equal keys for the lifetime of the process.

use super::reading::{AggregationKey, BucketDescriptor, Reading};
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Capability: derive the aggregation key of a reading
pub trait KeyDeriver: Send + Sync + 'static {
    fn derive_key(&self, reading: &Reading) -> AggregationKey;
}

impl KeyDeriver for Box<dyn KeyDeriver> {
    #[inline]
    fn derive_key(&self, reading: &Reading) -> AggregationKey {
        (**self).derive_key(reading)
    }
}

/// Out-of-range timestamps collapse to the epoch instead of failing
fn wall_clock<Tz: TimeZone>(tz: &Tz, timestamp_ms: i64) -> DateTime<Tz> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .with_timezone(tz)
}

/// Groups readings by (sensor, hour of day)
#[derive(Debug, Clone)]
pub struct HourOfDayKeyDeriver<Tz = Local> {
    tz: Tz,
}

impl HourOfDayKeyDeriver<Local> {
    /// Uses the process local time zone
    pub fn local() -> Self {
        HourOfDayKeyDeriver { tz: Local }
    }
}

impl Default for HourOfDayKeyDeriver<Local> {
    fn default() -> Self {
        Self::local()
    }
}

impl<Tz: TimeZone> HourOfDayKeyDeriver<Tz> {
    pub fn with_timezone(tz: Tz) -> Self {
        HourOfDayKeyDeriver { tz }
    }
}

impl<Tz> KeyDeriver for HourOfDayKeyDeriver<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
{
    fn derive_key(&self, reading: &Reading) -> AggregationKey {
        let hour = wall_clock(&self.tz, reading.timestamp_ms).hour() as u8;
        debug_assert!(hour < 24);
        AggregationKey::new(reading.entity_id.clone(), BucketDescriptor::HourOfDay(hour))
    }
}

/// Groups readings by (sensor, weekday)
#[derive(Debug, Clone)]
pub struct DayOfWeekKeyDeriver<Tz = Local> {
    tz: Tz,
}

impl DayOfWeekKeyDeriver<Local> {
    pub fn local() -> Self {
        DayOfWeekKeyDeriver { tz: Local }
    }
}

impl<Tz: TimeZone> DayOfWeekKeyDeriver<Tz> {
    pub fn with_timezone(tz: Tz) -> Self {
        DayOfWeekKeyDeriver { tz }
    }
}

impl<Tz> KeyDeriver for DayOfWeekKeyDeriver<Tz>
where
    Tz: TimeZone + Send + Sync + 'static,
{
    fn derive_key(&self, reading: &Reading) -> AggregationKey {
        let day = wall_clock(&self.tz, reading.timestamp_ms)
            .weekday()
            .num_days_from_monday() as u8;
        AggregationKey::new(reading.entity_id.clone(), BucketDescriptor::DayOfWeek(day))
    }
}

/// Groups readings by (sensor, start of a fixed-size time bucket)
///
/// Time-zone independent: buckets are aligned to the Unix epoch.
#[derive(Debug, Clone, Copy)]
pub struct TimeBucketKeyDeriver {
    granularity_ms: i64,
}

impl TimeBucketKeyDeriver {
    pub fn new(granularity_ms: i64) -> Result<Self> {
        if granularity_ms <= 0 {
            return Err(Error::invalid_config(format!(
                "time bucket granularity must be positive, got {}ms",
                granularity_ms
            )));
        }
        Ok(TimeBucketKeyDeriver { granularity_ms })
    }

    pub fn granularity_ms(&self) -> i64 {
        self.granularity_ms
    }
}

impl KeyDeriver for TimeBucketKeyDeriver {
    fn derive_key(&self, reading: &Reading) -> AggregationKey {
        let ts = reading.timestamp_ms;
        let start = ts - ts.rem_euclid(self.granularity_ms);
        AggregationKey::new(reading.entity_id.clone(), BucketDescriptor::TimeBucket(start))
    }
}

/// Key strategy selected by configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    HourOfDay,
    DayOfWeek,
    TimeBucket { granularity_ms: i64 },
}

impl KeyStrategy {
    /// Parse the `KEY_STRATEGY` environment value
    ///
    /// Accepts `hour_of_day`, `day_of_week` and `time_bucket:<ms>`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "hour_of_day" => Ok(KeyStrategy::HourOfDay),
            "day_of_week" => Ok(KeyStrategy::DayOfWeek),
            other => {
                let granularity = other
                    .strip_prefix("time_bucket:")
                    .and_then(|ms| ms.parse::<i64>().ok())
                    .ok_or_else(|| Error::invalid_config(format!("unknown key strategy '{}'", other)))?;
                Ok(KeyStrategy::TimeBucket {
                    granularity_ms: granularity,
                })
            }
        }
    }

    /// Build the deriver in the process local time zone
    pub fn build(&self) -> Result<Box<dyn KeyDeriver>> {
        Ok(match self {
            KeyStrategy::HourOfDay => Box::new(HourOfDayKeyDeriver::local()),
            KeyStrategy::DayOfWeek => Box::new(DayOfWeekKeyDeriver::local()),
            KeyStrategy::TimeBucket { granularity_ms } => {
                Box::new(TimeBucketKeyDeriver::new(*granularity_ms)?)
            }
        })
    }
}
