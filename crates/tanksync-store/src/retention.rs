//! Retention limits and eviction reports.

use serde::{Deserialize, Serialize};
use tanksync_types::{Reading, Timestamp};

/// Approximate in-memory footprint of one stored reading.
///
/// Two ordered-map entries plus the shared per-sensor bookkeeping amortized
/// over a typical series. Used for byte-bounded retention only.
pub const BYTES_PER_READING: usize = 64;

/// Upper bound on the number of readings kept by a [`ReadingStore`](crate::ReadingStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionLimit {
    /// Keep at most this many readings across all sensors.
    Count(usize),
    /// Keep at most this many approximate bytes across all sensors.
    Bytes(usize),
}

impl RetentionLimit {
    /// Whether a store holding `len` readings is within the limit.
    #[must_use]
    pub fn allows(&self, len: usize) -> bool {
        match *self {
            RetentionLimit::Count(max) => len <= max,
            RetentionLimit::Bytes(max) => len.saturating_mul(BYTES_PER_READING) <= max,
        }
    }
}

/// Readings removed by one retention pass.
///
/// Callers use the removed timestamps to invalidate derived data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Eviction {
    /// Removed readings, oldest first.
    pub removed: Vec<Reading>,
}

impl Eviction {
    /// Number of removed readings.
    pub fn len(&self) -> usize {
        self.removed.len()
    }

    /// Whether nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    /// Newest removed timestamp, if any.
    pub fn newest(&self) -> Option<Timestamp> {
        self.removed.iter().map(|r| r.timestamp).max()
    }
}
