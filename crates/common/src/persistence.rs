//! The interface the committer requires from durable storage.

use std::ops::{
    Bound,
    RangeBounds,
};

use async_trait::async_trait;

use crate::{
    document::{
        Document,
        DocumentId,
    },
    types::Timestamp,
};

/// One document revision in the durable log. A `None` value is the tombstone
/// sentinel, distinct from any valid value encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentLogEntry {
    pub ts: Timestamp,
    pub id: DocumentId,
    pub value: Option<Document>,
    /// Timestamp of the revision this one replaced, if any. Used to stitch
    /// revision chains at bootstrap.
    pub prev_ts: Option<Timestamp>,
}

/// Contract consumed by the committer.
///
/// Writes are append-ordered: every call carries a single commit timestamp
/// strictly greater than any previously written, and `write` returns only
/// after a durability barrier. A write must be crash-atomic per commit:
/// after recovery either all of a commit's revisions are visible or none.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Durably append one commit's revisions. All entries carry the same
    /// `ts`. Failures surface as `PersistenceUnavailable` metadata; the
    /// caller must not publish the commit.
    async fn write(&self, entries: Vec<DocumentLogEntry>) -> anyhow::Result<()>;

    /// The latest durable commit timestamp plus a full snapshot of the
    /// latest revision of every live document, used at bootstrap. Tombstoned
    /// documents are not returned.
    async fn load_latest(&self) -> anyhow::Result<(Timestamp, Vec<DocumentLogEntry>)>;
}

/// A range of timestamps, inclusive of start and exclusive of end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimestampRange {
    start: Timestamp,
    end: Option<Timestamp>,
}

impl TimestampRange {
    pub fn new<T: RangeBounds<Timestamp>>(range: T) -> anyhow::Result<Self> {
        let start = match range.start_bound() {
            Bound::Included(ts) => *ts,
            Bound::Excluded(ts) => ts.succ()?,
            Bound::Unbounded => Timestamp::MIN,
        };
        let end = match range.end_bound() {
            Bound::Included(ts) => Some(ts.succ()?),
            Bound::Excluded(ts) => Some(*ts),
            Bound::Unbounded => None,
        };
        Ok(Self { start, end })
    }

    pub fn greater_than(ts: Timestamp) -> anyhow::Result<Self> {
        Self::new((Bound::Excluded(ts), Bound::Unbounded))
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && self.end.map_or(true, |end| ts < end)
    }
}
