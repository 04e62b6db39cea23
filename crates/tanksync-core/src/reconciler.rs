//! Merging live events and backfilled pages into one ordered timeline.
//!
//! A [`Reconciler`] owns the sync state of one sensor. It tracks the last
//! sequence applied without gaps (the cursor), buffers anything that
//! arrives ahead of it, and asks for backfill of each missing range once.
//! Buffered readings are applied strictly in increasing sequence order, and
//! each applied batch extends the sensor's complete window in the same
//! [`Timeline`] critical section.
//!
//! ```text
//! Synced ──gap──▶ Backfilling ──closed──▶ Synced
//!                      │
//!                      └──retries exhausted──▶ GapUnresolved ──retry()──▶ Backfilling
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use tanksync_store::{InsertOutcome, ReadingStore};
use tanksync_types::{Reading, SequenceRange, TimeRange, Timestamp};

use crate::timeline::Timeline;

/// Gap state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapState {
    /// No known gaps.
    Synced,
    /// At least one gap is being backfilled.
    Backfilling,
    /// A gap could not be closed; waits for an explicit retry.
    GapUnresolved,
}

/// What one reconciler call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    /// Readings newly inserted into the store, in sequence order.
    pub applied: Vec<Reading>,
    /// Events dropped because their sequence was already applied or buffered.
    pub duplicates: usize,
    /// Live events dropped because the buffer was full.
    pub dropped: usize,
    /// Sequence ranges that must now be backfilled.
    pub requests: Vec<SequenceRange>,
    /// Gaps that closed.
    pub closed: Vec<SequenceRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    sequence: u64,
    timestamp: Timestamp,
}

/// Per-sensor reconciliation state machine.
#[derive(Debug)]
pub struct Reconciler {
    sensor_id: String,
    /// Last sequence applied with no gap before it.
    cursor: Option<Cursor>,
    /// Highest sequence applied, buffered or requested.
    highest_seen: Option<u64>,
    pending: BTreeMap<u64, Reading>,
    max_pending: usize,
    /// Requested ranges not yet fully fetched, keyed by first sequence.
    outstanding: BTreeMap<u64, SequenceRange>,
    /// Ranges whose backfill gave up.
    unresolved: BTreeMap<u64, SequenceRange>,
}

impl Reconciler {
    /// Start reconciling `sensor_id`, resuming after the newest stored reading.
    pub fn new(sensor_id: impl Into<String>, store: &ReadingStore, max_pending: usize) -> Self {
        let sensor_id = sensor_id.into();
        let cursor = store
            .last_sequence(&sensor_id)
            .and_then(|seq| store.get(&sensor_id, seq))
            .map(|r| Cursor {
                sequence: r.sequence,
                timestamp: r.timestamp,
            });

        Self {
            highest_seen: cursor.map(|c| c.sequence),
            sensor_id,
            cursor,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            outstanding: BTreeMap::new(),
            unresolved: BTreeMap::new(),
        }
    }

    /// Apply one live event.
    pub fn on_live(&mut self, timeline: &mut Timeline, reading: Reading) -> Step {
        let mut step = Step::default();
        let seq = reading.sequence;

        let Some(cursor) = self.cursor else {
            // No history for this sensor: the first event is the baseline.
            debug!(sensor = %self.sensor_id, sequence = seq, "First reading, starting timeline");
            self.apply_batch(timeline, vec![reading], &mut step);
            self.drain(timeline, &mut step);
            return step;
        };

        if seq <= cursor.sequence || self.pending.contains_key(&seq) {
            step.duplicates += 1;
            return step;
        }

        if seq == cursor.sequence + 1 {
            self.pending.insert(seq, reading);
            self.drain(timeline, &mut step);
            return step;
        }

        if self.pending.len() >= self.max_pending {
            step.dropped += 1;
            warn!(
                sensor = %self.sensor_id,
                sequence = seq,
                pending = self.pending.len(),
                "Reconcile buffer full, dropping live reading"
            );
            return step;
        }

        let highest = self.highest_seen.unwrap_or(cursor.sequence).max(cursor.sequence);
        if seq > highest + 1 {
            let range = SequenceRange {
                first: highest + 1,
                last: seq - 1,
            };
            debug!(sensor = %self.sensor_id, %range, "Gap detected");
            self.outstanding.insert(range.first, range);
            step.requests.push(range);
        }
        self.pending.insert(seq, reading);
        self.highest_seen = Some(highest.max(seq));
        step
    }

    /// Apply one page of backfilled readings, in any order.
    pub fn on_backfill_page(&mut self, timeline: &mut Timeline, readings: Vec<Reading>) -> Step {
        let mut step = Step::default();

        for reading in readings {
            if reading.sensor_id != self.sensor_id {
                warn!(
                    sensor = %self.sensor_id,
                    other = %reading.sensor_id,
                    "Ignoring backfilled reading for another sensor"
                );
                continue;
            }
            let seq = reading.sequence;
            let superseded = self.cursor.is_some_and(|c| seq <= c.sequence);
            if superseded || self.pending.contains_key(&seq) {
                step.duplicates += 1;
                continue;
            }
            self.highest_seen = Some(self.highest_seen.map_or(seq, |h| h.max(seq)));
            self.pending.insert(seq, reading);
        }

        self.drain(timeline, &mut step);
        step
    }

    /// All pages for `range` were delivered.
    ///
    /// If some sequence of the range is still neither applied nor buffered,
    /// the range is escalated as unresolved.
    pub fn on_backfill_done(&mut self, range: SequenceRange) -> Step {
        let mut step = Step::default();
        if self.outstanding.remove(&range.first).is_none() {
            return step;
        }
        if let Some(missing) = self.first_missing(range) {
            warn!(
                sensor = %self.sensor_id,
                %range,
                missing,
                "Backfill completed without every requested sequence"
            );
            self.unresolved.insert(range.first, range);
        } else if self.cursor.is_some_and(|c| c.sequence >= range.last) {
            step.closed.push(range);
        }
        step
    }

    /// Backfill for `range` gave up after exhausting its retries.
    pub fn on_backfill_failed(&mut self, range: SequenceRange) {
        if self.outstanding.remove(&range.first).is_some() {
            warn!(sensor = %self.sensor_id, %range, "Gap unresolved");
            self.unresolved.insert(range.first, range);
        }
    }

    /// Move every unresolved range back to backfilling.
    ///
    /// Returns the ranges that must be requested again.
    pub fn retry(&mut self) -> Vec<SequenceRange> {
        let applied_up_to = self.cursor.map(|c| c.sequence);
        let mut requests = Vec::new();

        for (_, range) in std::mem::take(&mut self.unresolved) {
            let first = applied_up_to.map_or(range.first, |a| range.first.max(a + 1));
            if first > range.last {
                continue;
            }
            let range = SequenceRange {
                first,
                last: range.last,
            };
            self.outstanding.insert(range.first, range);
            requests.push(range);
        }

        if !requests.is_empty() {
            info!(sensor = %self.sensor_id, ranges = requests.len(), "Retrying unresolved gaps");
        }
        requests
    }

    /// Apply every buffered reading that directly follows the cursor.
    fn drain(&mut self, timeline: &mut Timeline, step: &mut Step) {
        let Some(cursor) = self.cursor else {
            return;
        };

        let mut next = cursor.sequence + 1;
        let mut batch = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            let seq = *entry.key();
            if seq < next {
                entry.remove();
                step.duplicates += 1;
            } else if seq == next {
                batch.push(entry.remove());
                next += 1;
            } else {
                break;
            }
        }

        if batch.is_empty() {
            return;
        }
        self.apply_batch(timeline, batch, step);
        self.close_ranges(step);
    }

    /// Insert a contiguous batch following the cursor and extend the window.
    fn apply_batch(&mut self, timeline: &mut Timeline, batch: Vec<Reading>, step: &mut Step) {
        let Some(last) = batch.last().map(|r| Cursor {
            sequence: r.sequence,
            timestamp: r.timestamp,
        }) else {
            return;
        };

        let mut lo = batch.iter().map(|r| r.timestamp).min().unwrap_or(last.timestamp);
        let mut hi = batch.iter().map(|r| r.timestamp).max().unwrap_or(last.timestamp);
        // Extend from the previous reading only while it is still stored;
        // after eviction the window must not reach back over it.
        if let Some(prev) = self.cursor
            && timeline.store().contains(&self.sensor_id, prev.sequence)
        {
            lo = lo.min(prev.timestamp);
            hi = hi.max(prev.timestamp);
        }

        for reading in batch {
            match timeline.insert(reading.clone()) {
                InsertOutcome::Added => step.applied.push(reading),
                InsertOutcome::DuplicateIgnored => step.duplicates += 1,
            }
        }
        timeline.mark_window_complete(
            &self.sensor_id,
            TimeRange {
                start: lo,
                end: hi.next(),
            },
        );

        self.cursor = Some(last);
        self.highest_seen = Some(self.highest_seen.map_or(last.sequence, |h| h.max(last.sequence)));
    }

    fn close_ranges(&mut self, step: &mut Step) {
        let Some(cursor) = self.cursor else {
            return;
        };
        let sensor_id = &self.sensor_id;
        let mut close = |ranges: &mut BTreeMap<u64, SequenceRange>| {
            ranges.retain(|_, range| {
                if range.last <= cursor.sequence {
                    info!(sensor = %sensor_id, %range, "Gap closed");
                    step.closed.push(*range);
                    false
                } else {
                    true
                }
            });
        };
        close(&mut self.outstanding);
        close(&mut self.unresolved);
    }

    /// First sequence of `range` that is neither applied nor buffered.
    fn first_missing(&self, range: SequenceRange) -> Option<u64> {
        let start = self
            .cursor
            .map_or(range.first, |c| range.first.max(c.sequence.saturating_add(1)));
        if start > range.last {
            return None;
        }
        let mut expected = start;
        for &seq in self.pending.range(start..=range.last).map(|(seq, _)| seq) {
            if seq != expected {
                return Some(expected);
            }
            expected += 1;
        }
        (expected <= range.last).then_some(expected)
    }

    /// Current gap state.
    pub fn state(&self) -> GapState {
        if !self.unresolved.is_empty() {
            GapState::GapUnresolved
        } else if !self.outstanding.is_empty() || !self.pending.is_empty() {
            GapState::Backfilling
        } else {
            GapState::Synced
        }
    }

    /// Sequence ranges still missing, trimmed to what follows the cursor.
    pub fn missing(&self) -> Vec<SequenceRange> {
        let applied_up_to = self.cursor.map(|c| c.sequence);
        let mut ranges: Vec<SequenceRange> = self
            .outstanding
            .values()
            .chain(self.unresolved.values())
            .filter_map(|range| {
                let first = applied_up_to.map_or(range.first, |a| range.first.max(a + 1));
                (first <= range.last).then_some(SequenceRange {
                    first,
                    last: range.last,
                })
            })
            .collect();
        ranges.sort();
        ranges
    }

    /// Ranges that gave up, trimmed like [`missing`](Self::missing).
    pub fn unresolved(&self) -> Vec<SequenceRange> {
        let applied_up_to = self.cursor.map(|c| c.sequence);
        self.unresolved
            .values()
            .filter_map(|range| {
                let first = applied_up_to.map_or(range.first, |a| range.first.max(a + 1));
                (first <= range.last).then_some(SequenceRange {
                    first,
                    last: range.last,
                })
            })
            .collect()
    }

    /// Last sequence applied without a gap.
    pub fn last_sequence(&self) -> Option<u64> {
        self.cursor.map(|c| c.sequence)
    }

    /// Number of buffered readings.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The sensor this reconciler serves.
    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: &str = "tank/temp";

    fn reading(seq: u64) -> Reading {
        Reading::new(SENSOR, seq, Timestamp::from_millis(seq as i64 * 1_000), 25.0)
    }

    fn seqs(timeline: &Timeline) -> Vec<u64> {
        timeline
            .store()
            .readings(SENSOR)
            .iter()
            .map(|r| r.sequence)
            .collect()
    }

    fn setup() -> (Timeline, Reconciler) {
        let timeline = Timeline::default();
        let reconciler = Reconciler::new(SENSOR, timeline.store(), 64);
        (timeline, reconciler)
    }

    #[test]
    fn test_contiguous_live_events_apply_directly() {
        let (mut tl, mut rec) = setup();
        for seq in 1..=3 {
            let step = rec.on_live(&mut tl, reading(seq));
            assert_eq!(step.applied.len(), 1);
            assert!(step.requests.is_empty());
        }
        assert_eq!(seqs(&tl), vec![1, 2, 3]);
        assert_eq!(
            tl.store().windows(SENSOR),
            vec![TimeRange::from_millis(1_000, 3_001).unwrap()]
        );
        assert_eq!(rec.state(), GapState::Synced);
    }

    #[test]
    fn test_gap_buffers_and_requests_once() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(2));

        let step = rec.on_live(&mut tl, reading(4));
        assert_eq!(step.requests, vec![SequenceRange::single(3)]);
        assert!(step.applied.is_empty());

        let step = rec.on_live(&mut tl, reading(5));
        assert!(step.requests.is_empty());
        assert_eq!(rec.state(), GapState::Backfilling);
        assert_eq!(rec.missing(), vec![SequenceRange::single(3)]);
        assert_eq!(seqs(&tl), vec![1, 2]);

        let step = rec.on_backfill_page(&mut tl, vec![reading(3)]);
        let applied: Vec<u64> = step.applied.iter().map(|r| r.sequence).collect();
        assert_eq!(applied, vec![3, 4, 5]);
        assert_eq!(step.closed, vec![SequenceRange::single(3)]);
        assert_eq!(seqs(&tl), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            tl.store().windows(SENSOR),
            vec![TimeRange::from_millis(1_000, 5_001).unwrap()]
        );
        assert_eq!(rec.state(), GapState::Synced);
    }

    #[test]
    fn test_descending_pages_apply_in_sequence_order() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        let step = rec.on_live(&mut tl, reading(10));
        assert_eq!(step.requests, vec![SequenceRange::new(2, 9).unwrap()]);

        let step = rec.on_backfill_page(&mut tl, (6..=9).rev().map(reading).collect());
        assert!(step.applied.is_empty());
        let step = rec.on_backfill_page(&mut tl, (2..=5).rev().map(reading).collect());
        let applied: Vec<u64> = step.applied.iter().map(|r| r.sequence).collect();
        assert_eq!(applied, (2..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(3));

        assert_eq!(rec.on_live(&mut tl, reading(1)).duplicates, 1);
        assert_eq!(rec.on_live(&mut tl, reading(3)).duplicates, 1);
        let step = rec.on_backfill_page(&mut tl, vec![reading(1), reading(2), reading(2)]);
        assert_eq!(step.duplicates, 2);
        assert_eq!(seqs(&tl), vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_backfill_is_unresolved_until_retry() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(4));
        let range = SequenceRange::new(2, 3).unwrap();

        rec.on_backfill_failed(range);
        assert_eq!(rec.state(), GapState::GapUnresolved);
        assert_eq!(rec.unresolved(), vec![range]);

        // Live events keep buffering while degraded
        rec.on_live(&mut tl, reading(5));
        assert_eq!(rec.pending_len(), 2);

        assert_eq!(rec.retry(), vec![range]);
        assert_eq!(rec.state(), GapState::Backfilling);
        let step = rec.on_backfill_page(&mut tl, vec![reading(2), reading(3)]);
        assert_eq!(step.applied.len(), 4);
        assert_eq!(rec.state(), GapState::Synced);
    }

    #[test]
    fn test_incomplete_backfill_escalates() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(5));
        let range = SequenceRange::new(2, 4).unwrap();

        rec.on_backfill_page(&mut tl, vec![reading(2), reading(4)]);
        rec.on_backfill_done(range);
        assert_eq!(rec.state(), GapState::GapUnresolved);
        assert_eq!(rec.missing(), vec![SequenceRange::new(3, 4).unwrap()]);
        assert_eq!(seqs(&tl), vec![1, 2]);
    }

    #[test]
    fn test_completed_backfill_waiting_on_lower_gap() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(3));
        rec.on_live(&mut tl, reading(6));
        let low = SequenceRange::single(2);
        let high = SequenceRange::new(4, 5).unwrap();

        rec.on_backfill_page(&mut tl, vec![reading(4), reading(5)]);
        let step = rec.on_backfill_done(high);
        assert!(step.closed.is_empty());
        assert_eq!(rec.state(), GapState::Backfilling);

        let step = rec.on_backfill_page(&mut tl, vec![reading(2)]);
        assert_eq!(step.closed, vec![low]);
        assert_eq!(seqs(&tl), (1..=6).collect::<Vec<_>>());
        assert_eq!(rec.state(), GapState::Synced);
    }

    #[test]
    fn test_buffer_overflow_drops_and_recovers_through_backfill() {
        let mut tl = Timeline::default();
        let mut rec = Reconciler::new(SENSOR, tl.store(), 2);
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(3)); // requests 2
        rec.on_live(&mut tl, reading(4));
        assert_eq!(rec.on_live(&mut tl, reading(5)).dropped, 1);

        let step = rec.on_backfill_page(&mut tl, vec![reading(2)]);
        assert_eq!(step.applied.len(), 3);

        // The next live event requests the dropped sequence
        let step = rec.on_live(&mut tl, reading(6));
        assert_eq!(step.requests, vec![SequenceRange::single(5)]);
    }

    #[test]
    fn test_resumes_after_stored_history() {
        let mut tl = Timeline::default();
        let _ = tl.insert(reading(7));
        let mut rec = Reconciler::new(SENSOR, tl.store(), 16);
        assert_eq!(rec.last_sequence(), Some(7));

        let step = rec.on_live(&mut tl, reading(10));
        assert_eq!(step.requests, vec![SequenceRange::new(8, 9).unwrap()]);
    }

    #[test]
    fn test_window_does_not_reach_over_evicted_reading() {
        let (mut tl, mut rec) = setup();
        rec.on_live(&mut tl, reading(1));
        rec.on_live(&mut tl, reading(2));
        let _ = tl.evict_oldest(tanksync_store::RetentionLimit::Count(0));

        rec.on_live(&mut tl, reading(3));
        assert_eq!(
            tl.store().windows(SENSOR),
            vec![TimeRange::from_millis(3_000, 3_001).unwrap()]
        );
    }
}
