//! The store and its aggregate cache, mutated together.
//!
//! Every mutation of the [`ReadingStore`] goes through [`Timeline`] so the
//! matching cached buckets are invalidated in the same critical section.
//! The coordinator keeps one `Timeline` behind a [`SharedTimeline`] mutex;
//! a reconciler inserts readings and marks their window under a single
//! lock acquisition, so readers never see a window before its readings.

use std::sync::Arc;

use tokio::sync::Mutex;

use tanksync_store::{Eviction, InsertOutcome, ReadingStore, RetentionLimit};
use tanksync_types::{AggregateBucket, Reading, TimeRange, Timestamp};

use crate::aggregator::Aggregator;
use crate::error::Result;

/// Shared handle to the timeline.
pub type SharedTimeline = Arc<Mutex<Timeline>>;

/// A [`ReadingStore`] plus the [`Aggregator`] caching buckets over it.
#[derive(Debug, Default)]
pub struct Timeline {
    store: ReadingStore,
    aggregator: Aggregator,
}

impl Timeline {
    /// Wrap an existing store.
    pub fn new(store: ReadingStore, cache_capacity: usize) -> Self {
        Self {
            store,
            aggregator: Aggregator::new(cache_capacity),
        }
    }

    /// Limit the buckets a single query may produce.
    #[must_use]
    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.aggregator = self.aggregator.with_max_buckets(max_buckets);
        self
    }

    /// Wrap into a [`SharedTimeline`].
    pub fn shared(self) -> SharedTimeline {
        Arc::new(Mutex::new(self))
    }

    /// Insert a reading and invalidate the buckets containing it.
    pub fn insert(&mut self, reading: Reading) -> InsertOutcome {
        let sensor_id = reading.sensor_id.clone();
        let ts = reading.timestamp;
        let outcome = self.store.insert(reading);
        if outcome == InsertOutcome::Added {
            self.aggregator.invalidate(&sensor_id, ts);
        }
        outcome
    }

    /// Record a complete window.
    ///
    /// No cache invalidation is needed: buckets are only cached once their
    /// range is already complete, so growing coverage cannot change them.
    pub fn mark_window_complete(&mut self, sensor_id: &str, range: TimeRange) {
        self.store.mark_window_complete(sensor_id, range);
    }

    /// Evict globally-oldest readings down to `limit`.
    pub fn evict_oldest(&mut self, limit: RetentionLimit) -> Eviction {
        let eviction = self.store.evict_oldest(limit);
        for reading in &eviction.removed {
            self.aggregator.invalidate(&reading.sensor_id, reading.timestamp);
        }
        eviction
    }

    /// Evict every reading older than `cutoff`.
    pub fn evict_before(&mut self, cutoff: Timestamp) -> Eviction {
        let eviction = self.store.evict_before(cutoff);
        for reading in &eviction.removed {
            self.aggregator.invalidate(&reading.sensor_id, reading.timestamp);
        }
        self.aggregator.invalidate_before(cutoff);
        eviction
    }

    /// Aggregated buckets; see [`Aggregator::query`].
    pub fn query(
        &mut self,
        sensor_id: &str,
        range: &TimeRange,
        width_ms: i64,
    ) -> Result<Vec<AggregateBucket>> {
        self.aggregator
            .query(&self.store, sensor_id, range, width_ms)
    }

    /// The underlying store.
    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    /// The aggregate cache.
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Unwrap the store, dropping the cache.
    pub fn into_store(self) -> ReadingStore {
        self.store
    }
}
