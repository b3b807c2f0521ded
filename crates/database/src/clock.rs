use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

use common::types::Timestamp;
use parking_lot::Mutex;

/// The process-wide source of commit timestamps: a hybrid logical clock over
/// wall-time nanoseconds.
///
/// `next_ts` returns `max(wall_ns, last + 1)`, so values are strictly
/// monotonic even when the wall clock stalls or steps backwards; the logical
/// `+1` is the tiebreaker. Contention on the mutex is fine: only the
/// committer draws commit timestamps, and begin timestamps come from the
/// snapshot manager, not from here.
pub struct TimestampOracle {
    last: Mutex<Timestamp>,
    /// Tests pin the wall clock to MIN so timestamps advance one at a time.
    wall_clock: fn() -> Timestamp,
}

fn system_wall_ns() -> Timestamp {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    u64::try_from(ns)
        .ok()
        .and_then(|ns| Timestamp::try_from(ns).ok())
        .unwrap_or(Timestamp::MAX)
}

fn pinned_wall_ns() -> Timestamp {
    Timestamp::MIN
}

impl TimestampOracle {
    /// An oracle that never returns a timestamp at or below `horizon`. At
    /// bootstrap the horizon is the latest durable commit timestamp, which
    /// seeds the clock at `max(wall_ns, horizon + 1)`.
    pub fn new(horizon: Timestamp) -> Self {
        Self {
            last: Mutex::new(horizon),
            wall_clock: system_wall_ns,
        }
    }

    /// A deterministic oracle: with the wall clock pinned, timestamps are
    /// `horizon + 1, horizon + 2, ...`. Test support.
    pub fn new_for_testing(horizon: Timestamp) -> Self {
        Self {
            last: Mutex::new(horizon),
            wall_clock: pinned_wall_ns,
        }
    }

    pub fn next_ts(&self) -> anyhow::Result<Timestamp> {
        let mut last = self.last.lock();
        let next = std::cmp::max((self.wall_clock)(), last.succ()?);
        *last = next;
        Ok(next)
    }
}
