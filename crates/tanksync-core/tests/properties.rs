//! Property tests for reconciliation and aggregation.

use std::collections::VecDeque;

use proptest::prelude::*;

use tanksync_core::{
    Aggregator, GapState, Reading, Reconciler, SequenceRange, TimeRange, Timeline, Timestamp,
};

const SENSOR: &str = "tank-1/ph";

fn reading(seq: u64) -> Reading {
    Reading::new(SENSOR, seq, Timestamp::from_millis(seq as i64 * 1_000), 7.0 + seq as f64 / 100.0)
}

/// Serve one outstanding backfill request, split into pages.
fn serve(
    timeline: &mut Timeline,
    reconciler: &mut Reconciler,
    range: SequenceRange,
    page_size: usize,
    reverse: bool,
    outstanding: &mut VecDeque<SequenceRange>,
) {
    let mut readings: Vec<Reading> = range.iter().map(reading).collect();
    if reverse {
        readings.reverse();
    }
    for page in readings.chunks(page_size.max(1)) {
        let step = reconciler.on_backfill_page(timeline, page.to_vec());
        outstanding.extend(step.requests);
    }
    let step = reconciler.on_backfill_done(range);
    outstanding.extend(step.requests);
}

proptest! {
    /// Any interleaving of live events and backfill pages leaves exactly one
    /// copy of every sequence up to the highest one seen, in order.
    #[test]
    fn reconciliation_is_confluent(
        live in proptest::collection::vec(2u64..60, 0..80),
        schedule in proptest::collection::vec(any::<u8>(), 0..200),
    ) {
        let mut timeline = Timeline::default();
        let mut reconciler = Reconciler::new(SENSOR, timeline.store(), 1_000);
        let mut outstanding = VecDeque::new();

        let mut events = std::iter::once(1).chain(live.iter().copied());
        let highest = live.iter().copied().max().unwrap_or(1).max(1);

        for choice in schedule {
            if choice % 3 == 0 && !outstanding.is_empty() {
                let index = choice as usize % outstanding.len();
                if let Some(range) = outstanding.remove(index) {
                    serve(&mut timeline, &mut reconciler, range, choice as usize % 4 + 1, choice & 8 != 0, &mut outstanding);
                }
            } else if let Some(seq) = events.next() {
                let step = reconciler.on_live(&mut timeline, reading(seq));
                outstanding.extend(step.requests);
            }
        }
        for seq in events {
            let step = reconciler.on_live(&mut timeline, reading(seq));
            outstanding.extend(step.requests);
        }
        while let Some(range) = outstanding.pop_front() {
            serve(&mut timeline, &mut reconciler, range, 3, false, &mut outstanding);
        }

        let stored: Vec<u64> = timeline.store().readings(SENSOR).iter().map(|r| r.sequence).collect();
        prop_assert_eq!(stored, (1..=highest).collect::<Vec<_>>());
        prop_assert_eq!(reconciler.state(), GapState::Synced);
        prop_assert_eq!(reconciler.pending_len(), 0);
        prop_assert_eq!(
            timeline.store().windows(SENSOR),
            vec![TimeRange::from_millis(1_000, highest as i64 * 1_000 + 1).unwrap()]
        );
    }

    /// Cached and invalidated buckets always equal buckets computed from
    /// scratch over the same store.
    #[test]
    fn cached_aggregates_match_recomputed(
        ops in proptest::collection::vec(
            (0i64..10_000, -50.0f64..50.0, 0usize..3, 0i64..10_000, 1i64..5_000, any::<bool>()),
            1..120,
        ),
    ) {
        let widths = [100i64, 250, 1_000];
        let mut timeline = Timeline::new(Default::default(), 64);
        timeline.mark_window_complete(SENSOR, TimeRange::from_millis(0, 10_000).unwrap());

        for (seq, (ts, value, width, start, len, evict)) in ops.into_iter().enumerate() {
            let _ = timeline.insert(Reading::new(SENSOR, seq as u64, Timestamp::from_millis(ts), value));
            if evict && seq % 17 == 16 {
                let _ = timeline.evict_before(Timestamp::from_millis(start / 4));
            }

            let width = widths[width];
            let range = TimeRange::from_millis(start, (start + len).min(10_000)).unwrap();
            let cached = timeline.query(SENSOR, &range, width);
            let fresh = Aggregator::new(64).query(timeline.store(), SENSOR, &range, width);

            match (cached, fresh) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                (Err(_), Err(_)) => {}
                (a, b) => prop_assert!(false, "cached {:?} vs fresh {:?}", a.is_ok(), b.is_ok()),
            }
        }
    }
}
