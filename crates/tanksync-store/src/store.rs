//! In-memory reading cache.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, warn};

use tanksync_types::{Reading, TimeRange, Timestamp};

use crate::retention::{BYTES_PER_READING, Eviction, RetentionLimit};
use crate::windows::WindowSet;

/// Result of [`ReadingStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum InsertOutcome {
    /// The reading was new and is now stored.
    Added,
    /// A reading with the same sensor and sequence was already stored.
    DuplicateIgnored,
}

/// Readings from the covered part of a queried range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeResult {
    /// Readings ordered by `(timestamp, sequence)`.
    pub readings: Vec<Reading>,
    /// Sub-ranges of the query not covered by any complete window.
    pub uncovered: Vec<TimeRange>,
}

impl RangeResult {
    /// Whether the whole queried range was covered.
    pub fn is_complete(&self) -> bool {
        self.uncovered.is_empty()
    }
}

/// Counters describing store activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Readings added.
    pub inserted: u64,
    /// Inserts ignored because the sequence was already stored.
    pub duplicates: u64,
    /// Duplicates whose payload differed from the stored reading.
    pub conflicts: u64,
    /// Readings removed by retention.
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct SensorSeries {
    /// `(timestamp, sequence)` -> value, the time-ordered view.
    timeline: BTreeMap<(Timestamp, u64), f64>,
    /// sequence -> timestamp, for dedup and cursor lookups.
    by_sequence: BTreeMap<u64, Timestamp>,
    windows: WindowSet,
}

impl SensorSeries {
    fn get(&self, sensor_id: &str, sequence: u64) -> Option<Reading> {
        let ts = *self.by_sequence.get(&sequence)?;
        let value = *self.timeline.get(&(ts, sequence))?;
        Some(Reading::new(sensor_id, sequence, ts, value))
    }

    fn oldest(&self) -> Option<(Timestamp, u64)> {
        self.timeline.keys().next().copied()
    }

    fn remove(&mut self, key: (Timestamp, u64)) -> Option<f64> {
        let value = self.timeline.remove(&key)?;
        self.by_sequence.remove(&key.1);
        Some(value)
    }
}

/// Local cache of sensor readings, ordered by time, with covered-window
/// bookkeeping.
///
/// The store never detects gaps on its own. A range is trusted only once a
/// caller has marked it complete with [`mark_window_complete`]; queries over
/// anything else report the missing sub-ranges instead of a partial view.
///
/// [`mark_window_complete`]: ReadingStore::mark_window_complete
///
/// ```
/// use tanksync_store::{InsertOutcome, ReadingStore};
/// use tanksync_types::{Reading, TimeRange, Timestamp};
///
/// let mut store = ReadingStore::new();
/// let r = Reading::new("tank/temp", 1, Timestamp::from_millis(1_000), 25.0);
/// assert_eq!(store.insert(r.clone()), InsertOutcome::Added);
/// assert_eq!(store.insert(r), InsertOutcome::DuplicateIgnored);
///
/// let range = TimeRange::from_millis(0, 2_000).unwrap();
/// assert!(!store.range_query("tank/temp", &range).is_complete());
///
/// store.mark_window_complete("tank/temp", range);
/// assert_eq!(store.range_query("tank/temp", &range).readings.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ReadingStore {
    series: HashMap<String, SensorSeries>,
    len: usize,
    stats: StoreStats,
}

impl ReadingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reading unless its `(sensor_id, sequence)` is already present.
    ///
    /// The stored reading is never overwritten. A duplicate with a different
    /// timestamp or value is logged and counted as a conflict.
    pub fn insert(&mut self, reading: Reading) -> InsertOutcome {
        let series = self.series.entry(reading.sensor_id.clone()).or_default();

        if let Some(existing) = series.get(&reading.sensor_id, reading.sequence) {
            self.stats.duplicates += 1;
            if !existing.same_payload(&reading) {
                self.stats.conflicts += 1;
                warn!(
                    sensor = %reading.sensor_id,
                    sequence = reading.sequence,
                    stored_ts = existing.timestamp.as_millis(),
                    stored_value = existing.value,
                    received_ts = reading.timestamp.as_millis(),
                    received_value = reading.value,
                    "Duplicate sequence with different payload, keeping stored reading"
                );
            } else {
                debug!(sensor = %reading.sensor_id, sequence = reading.sequence, "Duplicate ignored");
            }
            return InsertOutcome::DuplicateIgnored;
        }

        series
            .timeline
            .insert(reading.order_key(), reading.value);
        series.by_sequence.insert(reading.sequence, reading.timestamp);
        self.len += 1;
        self.stats.inserted += 1;
        InsertOutcome::Added
    }

    /// Readings within the covered part of `range`, plus the uncovered rest.
    pub fn range_query(&self, sensor_id: &str, range: &TimeRange) -> RangeResult {
        let Some(series) = self.series.get(sensor_id) else {
            return RangeResult {
                readings: Vec::new(),
                uncovered: if range.is_empty() { Vec::new() } else { vec![*range] },
            };
        };

        let readings = series
            .windows
            .covered(range)
            .into_iter()
            .flat_map(|window| {
                series
                    .timeline
                    .range((window.start, 0)..(window.end, 0))
                    .map(|(&(ts, seq), &value)| Reading::new(sensor_id, seq, ts, value))
            })
            .collect();

        RangeResult {
            readings,
            uncovered: series.windows.uncovered(range),
        }
    }

    /// Record that `range` holds every reading the sensor produced in it.
    pub fn mark_window_complete(&mut self, sensor_id: &str, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        self.series
            .entry(sensor_id.to_string())
            .or_default()
            .windows
            .insert(range);
    }

    /// Remove globally-oldest readings until the store fits within `limit`.
    ///
    /// Each evicted reading also truncates its sensor's windows so that no
    /// window claims coverage at or before the evicted instant.
    pub fn evict_oldest(&mut self, limit: RetentionLimit) -> Eviction {
        let mut eviction = Eviction::default();

        while !limit.allows(self.len) {
            let oldest = self
                .series
                .iter()
                .filter_map(|(id, s)| s.oldest().map(|key| (key, id)))
                .min();
            let Some((key, sensor_id)) = oldest else {
                break;
            };
            let sensor_id = sensor_id.clone();

            if let Some(series) = self.series.get_mut(&sensor_id)
                && let Some(value) = series.remove(key)
            {
                series.windows.trim_before(key.0.next());
                eviction
                    .removed
                    .push(Reading::new(sensor_id, key.1, key.0, value));
                self.len -= 1;
            }
        }

        self.record_eviction(&eviction);
        eviction
    }

    /// Remove every reading older than `cutoff` and drop coverage before it.
    pub fn evict_before(&mut self, cutoff: Timestamp) -> Eviction {
        let mut eviction = Eviction::default();

        for (sensor_id, series) in &mut self.series {
            let doomed: Vec<(Timestamp, u64)> = series
                .timeline
                .range(..(cutoff, 0))
                .map(|(&key, _)| key)
                .collect();
            for key in doomed {
                if let Some(value) = series.remove(key) {
                    eviction
                        .removed
                        .push(Reading::new(sensor_id.as_str(), key.1, key.0, value));
                }
            }
            series.windows.trim_before(cutoff);
        }

        eviction.removed.sort_by_key(|r| r.order_key());
        self.len -= eviction.len();
        self.record_eviction(&eviction);
        eviction
    }

    fn record_eviction(&mut self, eviction: &Eviction) {
        if !eviction.is_empty() {
            self.stats.evicted += eviction.len() as u64;
            debug!(removed = eviction.len(), remaining = self.len, "Evicted readings");
        }
    }

    /// Highest stored sequence for a sensor.
    pub fn last_sequence(&self, sensor_id: &str) -> Option<u64> {
        self.series
            .get(sensor_id)?
            .by_sequence
            .last_key_value()
            .map(|(&seq, _)| seq)
    }

    /// The stored reading with the given sequence.
    pub fn get(&self, sensor_id: &str, sequence: u64) -> Option<Reading> {
        self.series.get(sensor_id)?.get(sensor_id, sequence)
    }

    /// Whether a reading with the given sequence is stored.
    pub fn contains(&self, sensor_id: &str, sequence: u64) -> bool {
        self.series
            .get(sensor_id)
            .is_some_and(|s| s.by_sequence.contains_key(&sequence))
    }

    /// Most recent reading by timestamp.
    pub fn latest(&self, sensor_id: &str) -> Option<Reading> {
        let series = self.series.get(sensor_id)?;
        let (&(ts, seq), &value) = series.timeline.last_key_value()?;
        Some(Reading::new(sensor_id, seq, ts, value))
    }

    /// All stored readings of a sensor in `(timestamp, sequence)` order,
    /// regardless of coverage.
    pub fn readings(&self, sensor_id: &str) -> Vec<Reading> {
        self.series
            .get(sensor_id)
            .map(|s| {
                s.timeline
                    .iter()
                    .map(|(&(ts, seq), &value)| Reading::new(sensor_id, seq, ts, value))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Complete windows of a sensor, in time order.
    pub fn windows(&self, sensor_id: &str) -> Vec<TimeRange> {
        self.series
            .get(sensor_id)
            .map(|s| s.windows.iter().collect())
            .unwrap_or_default()
    }

    /// Sub-ranges of `range` not covered by a complete window.
    pub fn uncovered(&self, sensor_id: &str, range: &TimeRange) -> Vec<TimeRange> {
        match self.series.get(sensor_id) {
            Some(series) => series.windows.uncovered(range),
            None if range.is_empty() => Vec::new(),
            None => vec![*range],
        }
    }

    /// Known sensor ids, sorted.
    pub fn sensors(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.series.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of readings of one sensor.
    pub fn sensor_len(&self, sensor_id: &str) -> usize {
        self.series.get(sensor_id).map_or(0, |s| s.timeline.len())
    }

    /// Total number of stored readings.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no readings are stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Approximate memory held by readings.
    pub fn approx_bytes(&self) -> usize {
        self.len.saturating_mul(BYTES_PER_READING)
    }

    /// Activity counters.
    pub fn stats(&self) -> StoreStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: &str = "tank-1/temperature";

    fn reading(seq: u64, ts: i64) -> Reading {
        Reading::new(SENSOR, seq, Timestamp::from_millis(ts), 20.0 + seq as f64)
    }

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::from_millis(start, end).unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut store = ReadingStore::new();
        assert_eq!(store.insert(reading(1, 100)), InsertOutcome::Added);
        assert_eq!(store.insert(reading(1, 100)), InsertOutcome::DuplicateIgnored);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().duplicates, 1);
        assert_eq!(store.stats().conflicts, 0);
    }

    #[test]
    fn test_conflicting_duplicate_keeps_stored_reading() {
        let mut store = ReadingStore::new();
        let _ = store.insert(reading(1, 100));

        let mutated = Reading::new(SENSOR, 1, Timestamp::from_millis(150), 99.0);
        assert_eq!(store.insert(mutated), InsertOutcome::DuplicateIgnored);

        assert_eq!(store.get(SENSOR, 1), Some(reading(1, 100)));
        assert_eq!(store.stats().conflicts, 1);
    }

    #[test]
    fn test_range_query_orders_by_timestamp_then_sequence() {
        let mut store = ReadingStore::new();
        let _ = store.insert(reading(3, 200));
        let _ = store.insert(reading(2, 100));
        let _ = store.insert(reading(1, 100));
        store.mark_window_complete(SENSOR, range(0, 300));

        let result = store.range_query(SENSOR, &range(0, 300));
        let seqs: Vec<u64> = result.readings.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(result.is_complete());
    }

    #[test]
    fn test_range_query_excludes_uncovered_readings() {
        let mut store = ReadingStore::new();
        for (seq, ts) in [(1, 100), (2, 200), (3, 300)] {
            let _ = store.insert(reading(seq, ts));
        }
        store.mark_window_complete(SENSOR, range(100, 201));

        let result = store.range_query(SENSOR, &range(0, 400));
        let seqs: Vec<u64> = result.readings.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(result.uncovered, vec![range(0, 100), range(201, 400)]);
    }

    #[test]
    fn test_unknown_sensor_is_uncovered() {
        let store = ReadingStore::new();
        let result = store.range_query("nope", &range(0, 10));
        assert!(result.readings.is_empty());
        assert_eq!(result.uncovered, vec![range(0, 10)]);
        assert!(store.uncovered("nope", &range(5, 5)).is_empty());
    }

    #[test]
    fn test_evict_oldest_shrinks_windows() {
        let mut store = ReadingStore::new();
        for seq in 1..=5 {
            let _ = store.insert(reading(seq, seq as i64 * 100));
        }
        store.mark_window_complete(SENSOR, range(100, 501));

        let eviction = store.evict_oldest(RetentionLimit::Count(3));
        assert_eq!(eviction.len(), 2);
        assert_eq!(eviction.removed[0].sequence, 1);
        assert_eq!(eviction.removed[1].sequence, 2);
        assert_eq!(store.len(), 3);

        let result = store.range_query(SENSOR, &range(100, 501));
        assert_eq!(result.uncovered, vec![range(100, 201)]);
        assert_eq!(result.readings.len(), 3);
        assert_eq!(store.stats().evicted, 2);
    }

    #[test]
    fn test_evict_oldest_is_global_across_sensors() {
        let mut store = ReadingStore::new();
        let _ = store.insert(Reading::new("a", 1, Timestamp::from_millis(10), 1.0));
        let _ = store.insert(Reading::new("b", 1, Timestamp::from_millis(5), 1.0));
        let _ = store.insert(Reading::new("a", 2, Timestamp::from_millis(20), 1.0));

        let eviction = store.evict_oldest(RetentionLimit::Count(2));
        assert_eq!(eviction.removed[0].sensor_id, "b");
        assert_eq!(store.sensor_len("a"), 2);
        assert_eq!(store.sensor_len("b"), 0);
    }

    #[test]
    fn test_evict_by_bytes() {
        let mut store = ReadingStore::new();
        for seq in 1..=10 {
            let _ = store.insert(reading(seq, seq as i64));
        }
        let eviction = store.evict_oldest(RetentionLimit::Bytes(BYTES_PER_READING * 4));
        assert_eq!(eviction.len(), 6);
        assert_eq!(store.approx_bytes(), BYTES_PER_READING * 4);
    }

    #[test]
    fn test_evict_before() {
        let mut store = ReadingStore::new();
        for seq in 1..=4 {
            let _ = store.insert(reading(seq, seq as i64 * 100));
        }
        store.mark_window_complete(SENSOR, range(100, 401));

        let eviction = store.evict_before(Timestamp::from_millis(250));
        assert_eq!(eviction.len(), 2);
        assert_eq!(store.windows(SENSOR), vec![range(250, 401)]);
        assert_eq!(store.len(), 2);
        assert!(!store.contains(SENSOR, 2));
    }

    #[test]
    fn test_accessors() {
        let mut store = ReadingStore::new();
        assert_eq!(store.last_sequence(SENSOR), None);
        let _ = store.insert(reading(7, 700));
        let _ = store.insert(reading(3, 300));

        assert_eq!(store.last_sequence(SENSOR), Some(7));
        assert_eq!(store.latest(SENSOR).map(|r| r.sequence), Some(7));
        assert_eq!(store.readings(SENSOR).len(), 2);
        assert_eq!(store.sensors(), vec![SENSOR.to_string()]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn range_query_never_returns_uncovered_readings(
                timestamps in proptest::collection::vec(0i64..1_000, 0..60),
                windows in proptest::collection::vec((0i64..1_000, 1i64..200), 0..6),
                query in (0i64..1_000, 0i64..1_000),
            ) {
                let mut store = ReadingStore::new();
                for (seq, ts) in timestamps.iter().enumerate() {
                    let _ = store.insert(reading(seq as u64, *ts));
                }
                for (start, len) in &windows {
                    store.mark_window_complete(SENSOR, range(*start, start + len));
                }

                let (a, b) = query;
                let q = range(a.min(b), a.max(b));
                let result = store.range_query(SENSOR, &q);

                let marked: Vec<TimeRange> = windows.iter().map(|(s, l)| range(*s, s + l)).collect();
                for r in &result.readings {
                    prop_assert!(q.contains(r.timestamp));
                    prop_assert!(marked.iter().any(|w| w.contains(r.timestamp)));
                    prop_assert!(!result.uncovered.iter().any(|u| u.contains(r.timestamp)));
                }
                let keys: Vec<_> = result.readings.iter().map(Reading::order_key).collect();
                let mut sorted = keys.clone();
                sorted.sort();
                prop_assert_eq!(keys, sorted);
            }
        }
    }
}
