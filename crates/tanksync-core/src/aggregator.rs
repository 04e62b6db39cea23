//! Windowed statistics with incremental invalidation.
//!
//! The [`Aggregator`] answers "min/max/avg per bucket" queries over a
//! [`ReadingStore`]. Buckets are computed lazily, cached by
//! `(sensor, bucket start, bucket width)`, and dropped individually when a
//! reading inside them is inserted or evicted. A query only succeeds if every
//! bucket it touches is fully covered by complete windows; anything else is
//! reported as [`Error::UncoveredRange`] rather than aggregated partially.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::trace;

use tanksync_store::ReadingStore;
use tanksync_types::{AggregateBucket, TimeRange, Timestamp};

use crate::error::{Error, Result};

/// Default bound on buckets per query.
pub const DEFAULT_MAX_BUCKETS: usize = 5_000;

/// Cache key of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    /// Bucket start; first field so keys order oldest first.
    pub start: Timestamp,
    /// Sensor the bucket belongs to.
    pub sensor_id: String,
    /// Bucket width in milliseconds.
    pub width_ms: i64,
}

/// Cache activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    /// Buckets computed from store readings.
    pub computed: u64,
    /// Buckets served from the cache.
    pub cache_hits: u64,
    /// Cached buckets dropped because a reading inside them changed.
    pub invalidated: u64,
    /// Cached buckets dropped to stay within capacity.
    pub evicted: u64,
}

/// Cached per-bucket statistics.
#[derive(Debug)]
pub struct Aggregator {
    cache: HashMap<BucketKey, AggregateBucket>,
    /// Same keys as `cache`, ordered by bucket start for capacity eviction.
    order: BTreeSet<BucketKey>,
    /// Widths with cached buckets, per sensor.
    widths: HashMap<String, BTreeSet<i64>>,
    capacity: usize,
    max_buckets: usize,
    stats: AggregatorStats,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Aggregator {
    /// Create an aggregator caching at most `capacity` buckets.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            order: BTreeSet::new(),
            widths: HashMap::new(),
            capacity: capacity.max(1),
            max_buckets: DEFAULT_MAX_BUCKETS,
            stats: AggregatorStats::default(),
        }
    }

    /// Limit the number of buckets a single query may return.
    #[must_use]
    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets.max(1);
        self
    }

    /// Buckets of `width_ms` covering `range` for one sensor.
    ///
    /// Bucket boundaries are aligned to multiples of `width_ms`: the first
    /// bucket starts at or before `range.start` and the last ends at or after
    /// `range.end`. Every bucket aggregates its whole `[start, start + width)`,
    /// so the aligned range must be covered, not just `range` itself.
    pub fn query(
        &mut self,
        store: &ReadingStore,
        sensor_id: &str,
        range: &TimeRange,
        width_ms: i64,
    ) -> Result<Vec<AggregateBucket>> {
        if width_ms <= 0 {
            return Err(Error::invalid_range(format!(
                "bucket width must be positive, got {width_ms}ms"
            )));
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let aligned = range.align(width_ms);
        let count = aligned.len_millis() / width_ms;
        if count > self.max_buckets as i64 {
            return Err(Error::invalid_range(format!(
                "{count} buckets of {width_ms}ms requested, at most {} allowed",
                self.max_buckets
            )));
        }

        let missing = store.uncovered(sensor_id, &aligned);
        if !missing.is_empty() {
            return Err(Error::UncoveredRange {
                sensor_id: sensor_id.to_string(),
                missing,
            });
        }

        let mut buckets = Vec::with_capacity(count as usize);
        let mut start = aligned.start;
        while start < aligned.end {
            buckets.push(self.cached_bucket(store, sensor_id, start, width_ms));
            start = start.saturating_add_millis(width_ms);
        }

        Ok(buckets)
    }

    fn cached_bucket(
        &mut self,
        store: &ReadingStore,
        sensor_id: &str,
        start: Timestamp,
        width_ms: i64,
    ) -> AggregateBucket {
        let key = BucketKey {
            start,
            sensor_id: sensor_id.to_string(),
            width_ms,
        };
        if let Some(bucket) = self.cache.get(&key) {
            self.stats.cache_hits += 1;
            return bucket.clone();
        }

        let full = TimeRange {
            start,
            end: start.saturating_add_millis(width_ms),
        };
        let bucket = compute(store, sensor_id, start, width_ms, &full);
        self.stats.computed += 1;
        trace!(sensor = %sensor_id, start = start.as_millis(), width_ms, "Computed bucket");

        self.widths
            .entry(sensor_id.to_string())
            .or_default()
            .insert(width_ms);
        self.order.insert(key.clone());
        self.cache.insert(key, bucket.clone());
        self.enforce_capacity();
        bucket
    }

    /// Drop the cached bucket containing `ts` for every width in use.
    pub fn invalidate(&mut self, sensor_id: &str, ts: Timestamp) {
        let Some(widths) = self.widths.get(sensor_id) else {
            return;
        };
        for &width_ms in widths {
            let key = BucketKey {
                start: ts.align_down(width_ms),
                sensor_id: sensor_id.to_string(),
                width_ms,
            };
            if self.cache.remove(&key).is_some() {
                self.order.remove(&key);
                self.stats.invalidated += 1;
            }
        }
    }

    /// Drop every cached bucket starting before `cutoff`, for all sensors.
    pub fn invalidate_before(&mut self, cutoff: Timestamp) {
        while let Some(key) = self.order.first() {
            if key.start >= cutoff {
                break;
            }
            if let Some(key) = self.order.pop_first() {
                self.cache.remove(&key);
                self.stats.invalidated += 1;
            }
        }
    }

    fn enforce_capacity(&mut self) {
        while self.cache.len() > self.capacity {
            let Some(key) = self.order.pop_first() else {
                break;
            };
            self.cache.remove(&key);
            self.stats.evicted += 1;
        }
    }

    /// Whether a bucket is currently cached.
    pub fn is_cached(&self, sensor_id: &str, start: Timestamp, width_ms: i64) -> bool {
        self.cache.contains_key(&BucketKey {
            start,
            sensor_id: sensor_id.to_string(),
            width_ms,
        })
    }

    /// Number of cached buckets.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Activity counters.
    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }
}

/// Aggregate the readings of `range` into a bucket starting at `start`.
fn compute(
    store: &ReadingStore,
    sensor_id: &str,
    start: Timestamp,
    width_ms: i64,
    range: &TimeRange,
) -> AggregateBucket {
    let mut bucket = AggregateBucket::empty(start, width_ms);
    for reading in store.range_query(sensor_id, range).readings {
        bucket.push(reading.value);
    }
    bucket
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanksync_types::Reading;

    const SENSOR: &str = "tank/temp";

    fn store_with(values: &[(u64, i64, f64)], window: (i64, i64)) -> ReadingStore {
        let mut store = ReadingStore::new();
        for &(seq, ts, value) in values {
            let _ = store.insert(Reading::new(SENSOR, seq, Timestamp::from_millis(ts), value));
        }
        store.mark_window_complete(SENSOR, TimeRange::from_millis(window.0, window.1).unwrap());
        store
    }

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::from_millis(start, end).unwrap()
    }

    #[test]
    fn test_query_computes_min_max_avg() {
        let store = store_with(&[(1, 100, 24.0), (2, 500, 26.0), (3, 1_200, 30.0)], (0, 2_000));
        let mut agg = Aggregator::default();

        let buckets = agg.query(&store, SENSOR, &range(0, 2_000), 1_000).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].min, Some(24.0));
        assert_eq!(buckets[0].max, Some(26.0));
        assert_eq!(buckets[0].avg(), Some(25.0));
        assert_eq!(buckets[1].count, 1);
        assert_eq!(agg.stats().computed, 2);
    }

    #[test]
    fn test_empty_bucket_has_no_extremes() {
        let store = store_with(&[(1, 100, 24.0)], (0, 2_000));
        let mut agg = Aggregator::default();

        let buckets = agg.query(&store, SENSOR, &range(0, 2_000), 1_000).unwrap();
        assert_eq!(buckets[1].count, 0);
        assert_eq!(buckets[1].min, None);
        assert_eq!(buckets[1].avg(), None);
    }

    #[test]
    fn test_cached_buckets_are_reused() {
        let store = store_with(&[(1, 100, 24.0)], (0, 3_000));
        let mut agg = Aggregator::default();

        agg.query(&store, SENSOR, &range(0, 3_000), 1_000).unwrap();
        agg.query(&store, SENSOR, &range(0, 3_000), 1_000).unwrap();
        assert_eq!(agg.stats().computed, 3);
        assert_eq!(agg.stats().cache_hits, 3);
    }

    #[test]
    fn test_uncovered_range_is_reported_not_aggregated() {
        let store = store_with(&[(1, 100, 24.0)], (0, 1_000));
        let mut agg = Aggregator::default();

        let err = agg.query(&store, SENSOR, &range(0, 2_000), 1_000).unwrap_err();
        match err {
            Error::UncoveredRange { missing, .. } => assert_eq!(missing, vec![range(1_000, 2_000)]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(agg.cached_len(), 0);
    }

    #[test]
    fn test_edge_buckets_aggregate_their_full_width() {
        let store = store_with(&[(1, 100, 6.0), (2, 900, 8.0), (3, 1_100, 30.0)], (0, 2_000));
        let mut agg = Aggregator::default();

        let partial = agg.query(&store, SENSOR, &range(500, 1_500), 1_000).unwrap();
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[0].start, Timestamp::from_millis(0));
        assert_eq!(partial[0].count, 2);
        assert_eq!(partial[0].min, Some(6.0));
        assert_eq!(partial[1].count, 1);
        assert_eq!(agg.cached_len(), 2);

        // Same key, same aggregate, whichever range asked for it
        let full = agg.query(&store, SENSOR, &range(0, 2_000), 1_000).unwrap();
        assert_eq!(full, partial);
        assert_eq!(agg.stats().cache_hits, 2);
    }

    #[test]
    fn test_edge_bucket_outside_window_is_uncovered() {
        let store = store_with(&[(1, 900, 8.0)], (500, 1_500));
        let mut agg = Aggregator::default();

        let err = agg.query(&store, SENSOR, &range(500, 1_500), 1_000).unwrap_err();
        match err {
            Error::UncoveredRange { missing, .. } => {
                assert_eq!(missing, vec![range(0, 500), range(1_500, 2_000)]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(agg.cached_len(), 0);
    }

    #[test]
    fn test_rejects_too_many_buckets() {
        let store = store_with(&[], (0, 2_000_000));
        let mut agg = Aggregator::default().with_max_buckets(100);

        assert!(matches!(
            agg.query(&store, SENSOR, &range(0, 2_000_000), 1),
            Err(Error::InvalidRange(_))
        ));
        assert_eq!(agg.cached_len(), 0);
        assert_eq!(agg.stats().computed, 0);

        let buckets = agg.query(&store, SENSOR, &range(0, 100_000), 1_000).unwrap();
        assert_eq!(buckets.len(), 100);
    }

    #[test]
    fn test_invalidate_drops_only_containing_bucket() {
        let store = store_with(&[(1, 100, 24.0), (2, 1_100, 25.0)], (0, 3_000));
        let mut agg = Aggregator::default();
        agg.query(&store, SENSOR, &range(0, 3_000), 1_000).unwrap();
        agg.query(&store, SENSOR, &range(0, 3_000), 3_000).unwrap();

        agg.invalidate(SENSOR, Timestamp::from_millis(1_500));
        assert!(agg.is_cached(SENSOR, Timestamp::from_millis(0), 1_000));
        assert!(!agg.is_cached(SENSOR, Timestamp::from_millis(1_000), 1_000));
        assert!(agg.is_cached(SENSOR, Timestamp::from_millis(2_000), 1_000));
        assert!(!agg.is_cached(SENSOR, Timestamp::from_millis(0), 3_000));
        assert_eq!(agg.stats().invalidated, 2);
    }

    #[test]
    fn test_capacity_evicts_oldest_buckets() {
        let store = store_with(&[], (0, 10_000));
        let mut agg = Aggregator::new(3);
        agg.query(&store, SENSOR, &range(0, 5_000), 1_000).unwrap();

        assert_eq!(agg.cached_len(), 3);
        assert_eq!(agg.stats().evicted, 2);
        assert!(!agg.is_cached(SENSOR, Timestamp::from_millis(0), 1_000));
        assert!(agg.is_cached(SENSOR, Timestamp::from_millis(4_000), 1_000));
    }

    #[test]
    fn test_invalidate_before() {
        let store = store_with(&[], (0, 4_000));
        let mut agg = Aggregator::default();
        agg.query(&store, SENSOR, &range(0, 4_000), 1_000).unwrap();

        agg.invalidate_before(Timestamp::from_millis(2_000));
        assert_eq!(agg.cached_len(), 2);
        assert!(agg.is_cached(SENSOR, Timestamp::from_millis(2_000), 1_000));
    }

    #[test]
    fn test_rejects_non_positive_width() {
        let store = ReadingStore::new();
        let mut agg = Aggregator::default();
        assert!(matches!(
            agg.query(&store, SENSOR, &range(0, 10), 0),
            Err(Error::InvalidRange(_))
        ));
    }
}
