//! Sets of intervals over strings of bytes.
//!
//! The set of byte strings has two useful properties:
//! 1. There is a minimum (the empty string).
//! 2. Every string `s` has a smallest string `t` such that `s < t`, its
//!    successor. Strings have successors but not predecessors, since string
//!    length is unbounded.
//!
//! With these, every interval can be written as an inclusive lower bound and
//! an exclusive upper bound, and `-inf` never needs representing.

mod bounds;
mod interval_set;
mod key;

use std::ops::{
    Bound,
    RangeBounds,
};

pub use self::{
    bounds::{
        End,
        StartIncluded,
    },
    interval_set::IntervalSet,
    key::BinaryKey,
};
use crate::index::IndexKeyBytes;

/// A half-open interval `[start, end)` over index-key space, tagged by the
/// caller with the index it was scanned on.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Interval {
    pub start: StartIncluded,
    pub end: End,
}

impl Interval {
    /// All keys beginning with `key`. A point lookup is the prefix interval
    /// of the full key.
    pub fn prefix(key: BinaryKey) -> Self {
        let end = End::after_prefix(&key);
        Self {
            start: StartIncluded(key),
            end,
        }
    }

    pub const fn empty() -> Self {
        Self {
            start: StartIncluded(BinaryKey::min()),
            end: End::Excluded(BinaryKey::min()),
        }
    }

    pub const fn all() -> Self {
        Self {
            start: StartIncluded(BinaryKey::min()),
            end: End::Unbounded,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.end {
            End::Unbounded => false,
            End::Excluded(end) => *self.start.0 >= **end,
        }
    }

    pub fn contains(&self, point: &[u8]) -> bool {
        let after_start = &self.start.0[..] <= point;
        let before_end = match &self.end {
            End::Excluded(end) => point < &end[..],
            End::Unbounded => true,
        };
        after_start && before_end
    }

    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.is_empty()
            || other.is_empty()
            || other.end.is_disjoint(&self.start)
            || self.end.is_disjoint(&other.start)
    }

    pub fn is_adjacent(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.end.is_adjacent(&other.start) || other.end.is_adjacent(&self.start)
    }

    /// When reading ascending from `self` and stopping after `last_key`,
    /// returns `(interval read, interval remaining)`: `[start, last_key]`
    /// and `(last_key, end)`. `last_key` must be a full index key, not an
    /// arbitrary prefix of one.
    pub fn split_after(&self, last_key: IndexKeyBytes) -> (Self, Self) {
        let last_key = BinaryKey::from(last_key);
        let read = Self {
            start: self.start.clone(),
            end: End::after_prefix(&last_key),
        };
        let remaining = match last_key.increment() {
            Some(succ) => Self {
                start: StartIncluded(succ),
                end: self.end.clone(),
            },
            None => Interval::empty(),
        };
        (read, remaining)
    }
}

impl RangeBounds<[u8]> for &Interval {
    fn start_bound(&self) -> Bound<&[u8]> {
        Bound::Included(&self.start.0[..])
    }

    fn end_bound(&self) -> Bound<&[u8]> {
        match &self.end {
            End::Excluded(end) => Bound::Excluded(&end[..]),
            End::Unbounded => Bound::Unbounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(bytes: &[u8]) -> BinaryKey {
        bytes.to_vec().into()
    }

    #[test]
    fn test_half_open_boundaries() {
        let interval = Interval {
            start: StartIncluded(key(b"\x02")),
            end: End::Excluded(key(b"\x05")),
        };
        assert!(interval.contains(b"\x02"));
        assert!(interval.contains(b"\x04\xff"));
        assert!(!interval.contains(b"\x05"));
        assert!(!interval.contains(b"\x01"));
    }

    #[test]
    fn test_split_after() {
        let interval = Interval {
            start: StartIncluded(key(b"\x02")),
            end: End::Excluded(key(b"\x09")),
        };
        let (read, remaining) = interval.split_after(IndexKeyBytes(b"\x04".to_vec()));
        assert!(read.contains(b"\x04"));
        assert!(!read.contains(b"\x05"));
        assert!(!remaining.contains(b"\x04"));
        assert!(remaining.contains(b"\x05"));
        assert!(remaining.contains(b"\x08\xff"));
        assert!(!remaining.contains(b"\x09"));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 512, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_prefix_contains(
            prefix in prop::collection::vec(any::<u8>(), 0..4),
            suffix in prop::collection::vec(any::<u8>(), 0..4),
            other in prop::collection::vec(any::<u8>(), 0..6),
        ) {
            let interval = Interval::prefix(prefix.clone().into());
            let mut extended = prefix.clone();
            extended.extend_from_slice(&suffix);
            prop_assert!(interval.contains(&extended));
            prop_assert_eq!(interval.contains(&other), other.starts_with(&prefix));
        }

        #[test]
        fn proptest_disjoint_symmetric(
            a_start in prop::collection::vec(any::<u8>(), 0..3),
            a_end in prop::collection::vec(any::<u8>(), 0..3),
            b_start in prop::collection::vec(any::<u8>(), 0..3),
            b_end in prop::collection::vec(any::<u8>(), 0..3),
            point in prop::collection::vec(any::<u8>(), 0..3),
        ) {
            let a = Interval {
                start: StartIncluded(a_start.into()),
                end: End::Excluded(a_end.into()),
            };
            let b = Interval {
                start: StartIncluded(b_start.into()),
                end: End::Excluded(b_end.into()),
            };
            prop_assert_eq!(a.is_disjoint(&b), b.is_disjoint(&a));
            if a.is_disjoint(&b) {
                prop_assert!(!(a.contains(&point) && b.contains(&point)));
            }
        }
    }
}
