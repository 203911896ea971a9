//! Hopping window assignment
//!
//! Windows have a fixed length and start at multiples of the hop, aligned to
//! the Unix epoch. A timestamp belongs to every window `[start, start + length)`
//! that contains it:
//!
//! ```text
//! length = 4, hop = 2
//!
//!   [-2 ........ 2)
//!         [0 ........ 4)
//!               [2 ........ 6)
//!     ts = 3 ─────────┘ └──── belongs to [0,4) and [2,6)
//! ```

use super::reading::WindowId;
use crate::error::{Error, Result};
use std::time::Duration;
use tracing::warn;

/// Capability: map an event timestamp to the windows covering it
pub trait WindowAssigner: Send + Sync + 'static {
    /// Windows containing `timestamp_ms`, ordered by ascending start
    fn assign(&self, timestamp_ms: i64) -> Vec<WindowId>;

    /// Length of every window produced by this assigner
    fn window_length_ms(&self) -> i64;
}

/// Compute the windows of `timestamp_ms` for a hopping window definition
///
/// Walks back from the latest hop-aligned start `<= timestamp_ms` while the
/// window still covers the timestamp. `hop_ms == length_ms` yields exactly one
/// (tumbling) window.
pub fn assign_windows(timestamp_ms: i64, length_ms: i64, hop_ms: i64) -> Result<Vec<WindowId>> {
    if length_ms <= 0 {
        return Err(Error::invalid_config(format!(
            "window length must be positive, got {}ms",
            length_ms
        )));
    }
    if hop_ms <= 0 {
        return Err(Error::invalid_config(format!(
            "hop length must be positive, got {}ms",
            hop_ms
        )));
    }
    Ok(windows_for(timestamp_ms, length_ms, hop_ms))
}

#[inline]
fn windows_for(timestamp_ms: i64, length_ms: i64, hop_ms: i64) -> Vec<WindowId> {
    let latest_start = timestamp_ms - timestamp_ms.rem_euclid(hop_ms);
    let capacity = ((length_ms + hop_ms - 1) / hop_ms) as usize;
    let mut windows = Vec::with_capacity(capacity);

    let mut start = latest_start;
    while start.saturating_add(length_ms) > timestamp_ms {
        windows.push(WindowId::new(start, start.saturating_add(length_ms)));
        match start.checked_sub(hop_ms) {
            Some(prev) => start = prev,
            None => break,
        }
    }

    windows.reverse();
    windows
}

/// Hopping (sliding) windows of `length` advancing every `hop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoppingWindowAssigner {
    length_ms: i64,
    hop_ms: i64,
}

impl HoppingWindowAssigner {
    /// Validates the definition
    ///
    /// Overlapping windows (`hop < length`) need `length` to be a multiple of
    /// `hop` so every instant is covered by the same number of windows.
    /// `hop > length` leaves gaps; it is accepted with a warning.
    pub fn new(length: Duration, hop: Duration) -> Result<Self> {
        Self::from_millis(length.as_millis() as i64, hop.as_millis() as i64)
    }

    pub fn from_millis(length_ms: i64, hop_ms: i64) -> Result<Self> {
        if length_ms <= 0 {
            return Err(Error::invalid_config(format!(
                "window length must be positive, got {}ms",
                length_ms
            )));
        }
        if hop_ms <= 0 {
            return Err(Error::invalid_config(format!(
                "hop length must be positive, got {}ms",
                hop_ms
            )));
        }
        if hop_ms < length_ms && length_ms % hop_ms != 0 {
            return Err(Error::invalid_config(format!(
                "window length {}ms must be a multiple of hop length {}ms",
                length_ms, hop_ms
            )));
        }
        if hop_ms > length_ms {
            warn!(
                "Hop {}ms exceeds window length {}ms; readings in the gaps belong to no window",
                hop_ms, length_ms
            );
        }
        Ok(HoppingWindowAssigner { length_ms, hop_ms })
    }

    /// Non-overlapping windows
    pub fn tumbling(length: Duration) -> Result<Self> {
        Self::new(length, length)
    }

    pub fn hop_ms(&self) -> i64 {
        self.hop_ms
    }

    /// Number of windows covering any instant when `hop <= length`
    pub fn windows_per_instant(&self) -> usize {
        ((self.length_ms + self.hop_ms - 1) / self.hop_ms) as usize
    }
}

impl WindowAssigner for HoppingWindowAssigner {
    fn assign(&self, timestamp_ms: i64) -> Vec<WindowId> {
        windows_for(timestamp_ms, self.length_ms, self.hop_ms)
    }

    fn window_length_ms(&self) -> i64 {
        self.length_ms
    }
}
