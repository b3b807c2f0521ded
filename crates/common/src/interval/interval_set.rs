use std::{
    collections::BTreeMap,
    ops::Bound,
};

use super::{
    bounds::{
        End,
        StartIncluded,
    },
    Interval,
};

/// A set of [`Interval`]s. Intersecting and adjacent intervals are merged,
/// so containment of a point needs only the interval preceding it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IntervalSet {
    /// Map from `Interval.start` to `Interval.end`. All intervals are
    /// non-intersecting, non-adjacent, and non-empty.
    Intervals(BTreeMap<StartIncluded, End>),
    /// In-memory shortcut for the set containing every key.
    All,
}

impl Default for IntervalSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::Intervals(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            // Only non-empty intervals are stored, so this is sufficient.
            Self::Intervals(intervals) => intervals.is_empty(),
            Self::All => false,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Intervals(intervals) => intervals.len(),
            Self::All => 1,
        }
    }

    /// All intervals in the map that intersect with or are adjacent to
    /// `interval`. O(log n + m) with m matches.
    fn intersecting_or_adjacent(
        intervals: &BTreeMap<StartIncluded, End>,
        interval: &Interval,
    ) -> Vec<Interval> {
        let mut result = Vec::new();
        // The interval starting before ours might reach or touch us.
        if let Some((other_start, other_end)) = intervals
            .range((Bound::Unbounded, Bound::Excluded(interval.start.clone())))
            .next_back()
        {
            let other = Interval {
                start: other_start.clone(),
                end: other_end.clone(),
            };
            if !interval.is_disjoint(&other) || interval.is_adjacent(&other) {
                result.push(other);
            }
        }
        // Any interval whose start lies inside (or immediately after) ours
        // intersects or is adjacent.
        for (other_start, other_end) in intervals.range(&interval.start..) {
            if interval.end.is_disjoint(other_start) && !interval.end.is_adjacent(other_start) {
                break;
            }
            result.push(Interval {
                start: other_start.clone(),
                end: other_end.clone(),
            });
        }
        result
    }

    /// Add `interval` to the set, merging with anything it touches.
    pub fn add(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }
        if interval == Interval::all() {
            *self = IntervalSet::All;
        }
        match self {
            IntervalSet::All => {},
            IntervalSet::Intervals(intervals) => {
                let mut merged_start = interval.start.clone();
                let mut merged_end = interval.end.clone();
                // Take the min start and max end over everything that
                // touches the new interval, remove those entries, and insert
                // the merged interval. Linear in the number of overlaps, but
                // amortized constant: each eviction is charged to the
                // insertion that created the entry.
                for other in Self::intersecting_or_adjacent(intervals, &interval) {
                    if other.start < merged_start {
                        merged_start = other.start.clone();
                    }
                    if other.end > merged_end {
                        merged_end = other.end.clone();
                    }
                    intervals
                        .remove(&other.start)
                        .expect("tried to remove existing interval");
                }
                intervals.insert(merged_start, merged_end);
            },
        }
    }

    /// True if any interval in the set contains `k`.
    pub fn contains(&self, k: &[u8]) -> bool {
        match self {
            Self::All => true,
            Self::Intervals(intervals) => {
                // Since intervals are non-overlapping, the only one that can
                // contain k is the last one starting at or before it.
                let Some((start, end)) = intervals
                    .range((
                        Bound::Unbounded,
                        Bound::Included(StartIncluded(k.to_vec().into())),
                    ))
                    .next_back()
                else {
                    return false;
                };
                Interval {
                    start: start.clone(),
                    end: end.clone(),
                }
                .contains(k)
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        let (all, intervals) = match self {
            Self::All => (Some(Interval::all()), None),
            Self::Intervals(intervals) => (None, Some(intervals.iter())),
        };
        all.into_iter().chain(
            intervals
                .into_iter()
                .flatten()
                .map(|(start, end)| Interval {
                    start: start.clone(),
                    end: end.clone(),
                }),
        )
    }
}
