//! Subset of `std::ops::Bound` specialized for our restricted form of
//! intervals: inclusive starts, exclusive or unbounded ends.

use super::key::BinaryKey;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct StartIncluded(pub BinaryKey);

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum End {
    Excluded(BinaryKey),
    Unbounded,
}

impl End {
    pub fn after_prefix(key: &BinaryKey) -> Self {
        match key.increment() {
            None => Self::Unbounded,
            Some(key) => Self::Excluded(key),
        }
    }

    /// Is the interval `(-inf, end)` disjoint with `[start, +inf)`?
    pub fn is_disjoint(&self, start: &StartIncluded) -> bool {
        match (self, start) {
            (End::Unbounded, _) => false,
            (End::Excluded(s), StartIncluded(t)) => s <= t,
        }
    }

    pub fn is_adjacent(&self, start: &StartIncluded) -> bool {
        match (self, start) {
            (End::Unbounded, _) => false,
            (End::Excluded(s), StartIncluded(t)) => s[..].eq(&t[..]),
        }
    }

    pub fn greater_than(&self, point: &[u8]) -> bool {
        match self {
            End::Unbounded => true,
            End::Excluded(s) => point < &s[..],
        }
    }
}
