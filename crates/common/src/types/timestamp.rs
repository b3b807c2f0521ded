use std::{
    fmt,
    ops::Deref,
    time::Duration,
};

/// A hybrid logical clock reading: nanoseconds since the Unix epoch, with
/// the logical component folded in by the clock so that two distinct commits
/// never share a timestamp.
///
/// The upper bound leaves headroom below `u64::MAX` so `succ` on any stored
/// timestamp cannot overflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MAX: Timestamp = Timestamp(u64::MAX - (1 << 20));
    pub const MIN: Timestamp = Timestamp(0);

    /// Construct a timestamp from a raw value, panicking when out of range.
    /// Intended for literals in tests and bootstrap constants.
    pub fn must(ts: u64) -> Self {
        Self::try_from(ts).expect("timestamp out of range")
    }

    pub fn succ(&self) -> anyhow::Result<Self> {
        anyhow::ensure!(*self < Self::MAX, "timestamp {self} has no successor");
        Ok(Self(self.0 + 1))
    }

    pub fn pred(&self) -> anyhow::Result<Self> {
        anyhow::ensure!(*self > Self::MIN, "timestamp {self} has no predecessor");
        Ok(Self(self.0 - 1))
    }

    pub fn add(&self, duration: Duration) -> anyhow::Result<Self> {
        let nanos = u64::try_from(duration.as_nanos())?;
        let value = self.0.checked_add(nanos).filter(|v| *v <= Self::MAX.0);
        value.map(Self).ok_or_else(|| anyhow::anyhow!("timestamp overflow"))
    }

    pub fn sub(&self, duration: Duration) -> anyhow::Result<Self> {
        let nanos = u64::try_from(duration.as_nanos())?;
        self.0
            .checked_sub(nanos)
            .map(Self)
            .ok_or_else(|| anyhow::anyhow!("timestamp underflow"))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> u64 {
        ts.0
    }
}

impl TryFrom<u64> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(ts: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(ts <= Self::MAX.0, "timestamp {ts} out of range");
        Ok(Self(ts))
    }
}

#[cfg(any(test, feature = "testing"))]
impl proptest::arbitrary::Arbitrary for Timestamp {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Timestamp>;

    fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
        use proptest::prelude::*;
        (0..=Timestamp::MAX.0).prop_map(Timestamp).boxed()
    }
}

/// Why a [`RepeatableTimestamp`] is known repeatable. Constructors record
/// their justification so new call sites are forced to have one.
#[derive(Clone, Copy, Debug)]
pub enum RepeatableReason {
    /// ts = the snapshot manager's latest published timestamp.
    SnapshotManagerLatest,
    /// ts = the maximum durable timestamp at bootstrap, before any committer
    /// is running.
    BootstrapMaxTs,
    /// ts <= some other RepeatableTimestamp.
    InductiveRepeatableTimestamp,
    #[cfg(any(test, feature = "testing"))]
    TestOnly,
}

/// A timestamp at which reads are repeatable: every commit that will ever be
/// published with `commit_ts <= *self` has already been published. Begin
/// timestamps are always repeatable timestamps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RepeatableTimestamp(Timestamp);

impl RepeatableTimestamp {
    pub const MIN: RepeatableTimestamp = RepeatableTimestamp(Timestamp::MIN);

    /// Only call this when the reason genuinely justifies repeatability;
    /// most callers should obtain one from the snapshot manager.
    pub fn new_validated(ts: Timestamp, _reason: RepeatableReason) -> Self {
        Self(ts)
    }

    pub fn prior_ts(&self, ts: Timestamp) -> anyhow::Result<Self> {
        anyhow::ensure!(ts <= **self);
        Ok(Self::new_validated(
            ts,
            RepeatableReason::InductiveRepeatableTimestamp,
        ))
    }
}

impl Deref for RepeatableTimestamp {
    type Target = Timestamp;

    fn deref(&self) -> &Timestamp {
        &self.0
    }
}

impl fmt::Display for RepeatableTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(any(test, feature = "testing"))]
pub fn unchecked_repeatable_ts(ts: Timestamp) -> RepeatableTimestamp {
    RepeatableTimestamp::new_validated(ts, RepeatableReason::TestOnly)
}

/// A "timestamp" for index entries that may not be committed yet. Pending
/// writes sort after any committed timestamp.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum WriteTimestamp {
    Committed(Timestamp),
    Pending,
}
