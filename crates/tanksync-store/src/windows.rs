//! Covered-window bookkeeping.
//!
//! A [`WindowSet`] records the half-open time ranges of a sensor's timeline
//! that are known to be gapless. Ranges are kept disjoint and non-adjacent:
//! inserting a range that overlaps or touches existing windows merges them.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use tanksync_types::{TimeRange, Timestamp};

/// Disjoint, coalesced set of covered time ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSet {
    /// Window start -> window end (exclusive).
    ranges: BTreeMap<Timestamp, Timestamp>,
}

impl WindowSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint windows.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no window is recorded.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over windows in time order.
    pub fn iter(&self) -> impl Iterator<Item = TimeRange> + '_ {
        self.ranges
            .iter()
            .map(|(&start, &end)| TimeRange { start, end })
    }

    /// Merge `range` into the set, coalescing overlapping and adjacent windows.
    pub fn insert(&mut self, range: TimeRange) {
        if range.is_empty() {
            return;
        }

        let mut merged = range;
        let touching: Vec<Timestamp> = self
            .ranges
            .range(..=range.end)
            .rev()
            .take_while(|&(_, &end)| end >= range.start)
            .map(|(&start, _)| start)
            .collect();

        for start in touching {
            if let Some(end) = self.ranges.remove(&start) {
                merged.start = merged.start.min(start);
                merged.end = merged.end.max(end);
            }
        }

        self.ranges.insert(merged.start, merged.end);
    }

    /// Whether `range` lies entirely inside one window.
    pub fn covers(&self, range: &TimeRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.end)
    }

    /// Windows intersecting `range`, clipped to it.
    pub fn covered(&self, range: &TimeRange) -> Vec<TimeRange> {
        self.intersecting(range)
            .filter_map(|w| w.intersection(range))
            .collect()
    }

    /// Sub-ranges of `range` not covered by any window.
    pub fn uncovered(&self, range: &TimeRange) -> Vec<TimeRange> {
        let mut gaps = Vec::new();
        if range.is_empty() {
            return gaps;
        }

        let mut cursor = range.start;
        for window in self.intersecting(range) {
            if window.start > cursor {
                gaps.push(TimeRange {
                    start: cursor,
                    end: window.start,
                });
            }
            cursor = cursor.max(window.end);
        }
        if cursor < range.end {
            gaps.push(TimeRange {
                start: cursor,
                end: range.end,
            });
        }
        gaps
    }

    /// Drop all coverage before `cutoff`.
    ///
    /// Windows ending at or before `cutoff` are removed; a window straddling
    /// it is shortened to start at `cutoff`.
    pub fn trim_before(&mut self, cutoff: Timestamp) {
        let doomed: Vec<(Timestamp, Timestamp)> = self
            .ranges
            .range(..cutoff)
            .map(|(&start, &end)| (start, end))
            .collect();

        for (start, end) in doomed {
            self.ranges.remove(&start);
            if end > cutoff {
                self.ranges.insert(cutoff, end);
            }
        }
    }

    fn intersecting<'a>(&'a self, range: &TimeRange) -> impl Iterator<Item = TimeRange> + 'a {
        let range = *range;
        let before = self
            .ranges
            .range(..=range.start)
            .next_back()
            .map(|(&start, &end)| TimeRange { start, end })
            .filter(|w| w.end > range.start);
        let after = self
            .ranges
            .range((Excluded(range.start), Unbounded))
            .take_while(move |&(&start, _)| start < range.end)
            .map(|(&start, &end)| TimeRange { start, end });
        before.into_iter().chain(after)
    }
}

impl FromIterator<TimeRange> for WindowSet {
    fn from_iter<I: IntoIterator<Item = TimeRange>>(iter: I) -> Self {
        let mut set = WindowSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}
