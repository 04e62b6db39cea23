//! Core value types for sensor telemetry.

use core::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// An instant on the source clock, stored as unix milliseconds.
///
/// Readings carry the timestamp assigned by the sensor backend. All range
/// arithmetic in the engine happens on the millisecond value, so buckets and
/// windows line up exactly regardless of calendar or time zone.
///
/// ```
/// use tanksync_types::Timestamp;
///
/// let t = Timestamp::from_millis(1_700_000_000_000);
/// assert_eq!(t.as_millis(), 1_700_000_000_000);
/// assert!(t.to_datetime().is_some());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Timestamp(i64);

impl Timestamp {
    /// The unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Create a timestamp from unix milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Unix milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Convert from an [`OffsetDateTime`], truncating to whole milliseconds.
    #[must_use]
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        Self((dt.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    /// Convert to an [`OffsetDateTime`] in UTC.
    ///
    /// Returns `None` if the value is outside the range `time` can represent.
    #[must_use]
    pub fn to_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000).ok()
    }

    /// Timestamp shifted forward by `millis`, saturating at the numeric bounds.
    #[must_use]
    pub const fn saturating_add_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Timestamp shifted backward by `millis`, saturating at the numeric bounds.
    #[must_use]
    pub const fn saturating_sub_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// The instant immediately after this one (one millisecond later).
    ///
    /// Used to turn an inclusive instant into a half-open range end.
    #[must_use]
    pub const fn next(self) -> Self {
        self.saturating_add_millis(1)
    }

    /// Round down to a multiple of `width_ms`.
    #[must_use]
    pub const fn align_down(self, width_ms: i64) -> Self {
        Self(self.0.div_euclid(width_ms) * width_ms)
    }

    /// Round up to a multiple of `width_ms`.
    #[must_use]
    pub const fn align_up(self, width_ms: i64) -> Self {
        let down = self.0.div_euclid(width_ms) * width_ms;
        if down == self.0 {
            self
        } else {
            Self(down + width_ms)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime().and_then(|dt| {
            dt.format(&time::format_description::well_known::Rfc3339)
                .ok()
        }) {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(dt: OffsetDateTime) -> Self {
        Self::from_datetime(dt)
    }
}

/// Convert a duration to whole milliseconds as `i64`, saturating.
#[must_use]
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A single sensor measurement.
///
/// Readings are immutable once created. The pair `(sensor_id, sequence)`
/// identifies a reading uniquely; `sequence` is assigned by the backend and
/// establishes true event order independent of wall-clock jitter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Sensor identifier.
    pub sensor_id: String,
    /// Backend-assigned, per-sensor monotonic counter.
    pub sequence: u64,
    /// When the measurement was taken (source clock).
    pub timestamp: Timestamp,
    /// Measured value.
    pub value: f64,
}

impl Reading {
    /// Create a new reading.
    pub fn new(sensor_id: impl Into<String>, sequence: u64, timestamp: Timestamp, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sequence,
            timestamp,
            value,
        }
    }

    /// Whether `other` carries the same timestamp and value.
    ///
    /// Used to flag backend replays that reuse a sequence with a different
    /// payload. Values are compared bitwise so `NaN` replays compare equal.
    #[must_use]
    pub fn same_payload(&self, other: &Reading) -> bool {
        self.timestamp == other.timestamp && self.value.to_bits() == other.value.to_bits()
    }

    /// Ordering key within a sensor's timeline.
    #[must_use]
    pub fn order_key(&self) -> (Timestamp, u64) {
        (self.timestamp, self.sequence)
    }
}

/// A half-open time range `[start, end)`.
///
/// ```
/// use tanksync_types::{TimeRange, Timestamp};
///
/// let range = TimeRange::new(Timestamp::from_millis(10), Timestamp::from_millis(20)).unwrap();
/// assert!(range.contains(Timestamp::from_millis(10)));
/// assert!(!range.contains(Timestamp::from_millis(20)));
/// assert!(TimeRange::new(Timestamp::from_millis(5), Timestamp::from_millis(1)).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeRange {
    /// Inclusive start.
    pub start: Timestamp,
    /// Exclusive end.
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a range, rejecting `end < start`.
    pub fn new(start: Timestamp, end: Timestamp) -> ParseResult<Self> {
        if end < start {
            return Err(ParseError::InvalidTimeRange {
                start: start.as_millis(),
                end: end.as_millis(),
            });
        }
        Ok(Self { start, end })
    }

    /// Create a range from unix milliseconds.
    pub fn from_millis(start: i64, end: i64) -> ParseResult<Self> {
        Self::new(Timestamp::from_millis(start), Timestamp::from_millis(end))
    }

    /// The range covering exactly one instant.
    #[must_use]
    pub const fn instant(at: Timestamp) -> Self {
        Self {
            start: at,
            end: at.next(),
        }
    }

    /// The range `[now - duration, now + 1ms)`.
    #[must_use]
    pub fn last(duration: Duration, now: Timestamp) -> Self {
        Self {
            start: now.saturating_sub_millis(duration_millis(duration)),
            end: now.next(),
        }
    }

    /// Whether the range contains no instants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Length in milliseconds.
    #[must_use]
    pub fn len_millis(&self) -> i64 {
        self.end.as_millis().saturating_sub(self.start.as_millis())
    }

    /// Whether `ts` falls within the range.
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Whether `other` lies entirely within this range.
    #[must_use]
    pub fn covers(&self, other: &TimeRange) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    /// Whether the two ranges share at least one instant.
    #[must_use]
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether the two ranges overlap or touch end-to-start.
    #[must_use]
    pub fn touches(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Overlapping part of two ranges, if any.
    #[must_use]
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    /// Expand the range outward to multiples of `width_ms`.
    #[must_use]
    pub fn align(&self, width_ms: i64) -> TimeRange {
        TimeRange {
            start: self.start.align_down(width_ms),
            end: self.end.align_up(width_ms),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// An inclusive range of sequence numbers `[first, last]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SequenceRange {
    /// First sequence (inclusive).
    pub first: u64,
    /// Last sequence (inclusive).
    pub last: u64,
}

impl SequenceRange {
    /// Create a range, rejecting `last < first`.
    pub fn new(first: u64, last: u64) -> ParseResult<Self> {
        if last < first {
            return Err(ParseError::InvalidSequenceRange { first, last });
        }
        Ok(Self { first, last })
    }

    /// A range containing a single sequence.
    #[must_use]
    pub const fn single(sequence: u64) -> Self {
        Self {
            first: sequence,
            last: sequence,
        }
    }

    /// Number of sequences in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Always false; a sequence range holds at least one sequence.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether `sequence` falls within the range.
    #[must_use]
    pub const fn contains(&self, sequence: u64) -> bool {
        self.first <= sequence && sequence <= self.last
    }

    /// Iterate over every sequence in the range.
    pub fn iter(&self) -> impl Iterator<Item = u64> {
        self.first..=self.last
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "#{}", self.first)
        } else {
            write!(f, "#{}..=#{}", self.first, self.last)
        }
    }
}

/// Statistics over one fixed-width time bucket.
///
/// Only `count`, `sum`, `min` and `max` are stored; the average is derived
/// on demand so repeated updates never compound rounding error.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AggregateBucket {
    /// Bucket start (aligned to `width_ms`).
    pub start: Timestamp,
    /// Bucket width in milliseconds.
    pub width_ms: i64,
    /// Number of readings in the bucket.
    pub count: u64,
    /// Sum of reading values.
    pub sum: f64,
    /// Smallest value, `None` for an empty bucket.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub min: Option<f64>,
    /// Largest value, `None` for an empty bucket.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub max: Option<f64>,
}

impl AggregateBucket {
    /// An empty bucket.
    #[must_use]
    pub fn empty(start: Timestamp, width_ms: i64) -> Self {
        Self {
            start,
            width_ms,
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    /// Fold one value into the bucket.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Mean value, `None` for an empty bucket.
    #[must_use]
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Exclusive end of the bucket.
    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.start.saturating_add_millis(self.width_ms)
    }

    /// The bucket's time range.
    #[must_use]
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end(),
        }
    }
}

/// Connection state of a sensor subscription as seen by the display layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No live connection.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Live events are applied as they arrive.
    Live,
    /// Connected, but live events are buffered until a gap is backfilled.
    Backfilling,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Live => write!(f, "live"),
            ConnectionState::Backfilling => write!(f, "backfilling"),
        }
    }
}
