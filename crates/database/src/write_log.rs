use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    sync::Arc,
};

use common::{
    document::DocumentUpdate,
    errors::ErrorMetadata,
    knobs::{
        WRITE_LOG_MAX_ENTRIES,
        WRITE_LOG_MAX_RETENTION_SECS,
        WRITE_LOG_MIN_RETENTION_SECS,
    },
    types::Timestamp,
};
use futures::Future;
use imbl::Vector;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    reads::{
        ConflictingReadWithWriteTs,
        ReadSet,
    },
    token::Token,
};

/// One commit's writes, ordered by document id.
pub type OrderedUpdates = Vec<DocumentUpdate>;

struct WriteLogManager {
    log: WriteLog,
    waiters: VecDeque<(Timestamp, oneshot::Sender<()>)>,
}

impl WriteLogManager {
    fn new(initial_timestamp: Timestamp) -> Self {
        Self {
            log: WriteLog::new(initial_timestamp),
            waiters: VecDeque::new(),
        }
    }

    fn notify_waiters(&mut self) {
        let ts = self.log.max_ts();
        let mut i = 0;
        while i < self.waiters.len() {
            if ts > self.waiters[i].0 || self.waiters[i].1.is_closed() {
                let waiter = self.waiters.swap_remove_back(i).expect("checked above");
                // Notify; ignore dropped receivers. Continue without
                // incrementing i since we just swapped into this position.
                let _ = waiter.1.send(());
                continue;
            }
            i += 1;
        }
    }

    fn append(&mut self, ts: Timestamp, writes: OrderedUpdates) {
        assert!(self.log.max_ts() < ts, "{} >= {ts}", self.log.max_ts());
        self.log.by_ts.push_back(Arc::new((ts, writes)));
        self.notify_waiters();
    }

    /// Returns a future resolving once the log has advanced past the given
    /// timestamp.
    fn wait_for_higher_ts(&mut self, target_ts: Timestamp) -> impl Future<Output = ()> {
        // Clean up waiters that went away.
        self.notify_waiters();

        let receiver = if self.log.max_ts() <= target_ts {
            let (sender, receiver) = oneshot::channel();
            self.waiters.push_back((target_ts, sender));
            Some(receiver)
        } else {
            None
        };

        async move {
            if let Some(receiver) = receiver {
                _ = receiver.await;
            }
        }
    }

    fn enforce_retention_policy(&mut self, current_ts: Timestamp) {
        let max_ts = current_ts
            .sub(*WRITE_LOG_MIN_RETENTION_SECS)
            .unwrap_or(Timestamp::MIN);
        let target_ts = current_ts
            .sub(*WRITE_LOG_MAX_RETENTION_SECS)
            .unwrap_or(Timestamp::MIN);
        while let Some(entry) = self.log.by_ts.front() {
            let ts = entry.0;

            // Never trim past max_ts, even if the log is over budget.
            if ts >= max_ts {
                break;
            }

            // Trim based on both age and size.
            if ts >= target_ts && self.log.by_ts.len() <= *WRITE_LOG_MAX_ENTRIES {
                break;
            }

            self.log.purged_ts = ts;
            self.log.by_ts.pop_front();
        }
    }
}

/// Recent commits that have been written to persistence and published to the
/// snapshot manager. These may cause OCC aborts for new commits, and they
/// trigger subscriptions. The log's horizon bounds how old a begin timestamp
/// can be and still commit.
#[derive(Clone)]
struct WriteLog {
    by_ts: Vector<Arc<(Timestamp, OrderedUpdates)>>,
    purged_ts: Timestamp,
}

impl WriteLog {
    fn new(initial_timestamp: Timestamp) -> Self {
        Self {
            by_ts: Vector::new(),
            purged_ts: initial_timestamp,
        }
    }

    fn max_ts(&self) -> Timestamp {
        match self.by_ts.back() {
            Some(entry) => entry.0,
            None => self.purged_ts,
        }
    }

    // O(log n + s + k) with n entries, s entries skipped, and k yielded.
    fn iter(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> anyhow::Result<impl Iterator<Item = (Timestamp, std::slice::Iter<'_, DocumentUpdate>)>>
    {
        anyhow::ensure!(
            from > self.purged_ts,
            anyhow::anyhow!(
                "Timestamp {from} is outside the write log retention window (minimum timestamp \
                 {})",
                self.purged_ts
            )
            .context(ErrorMetadata::out_of_retention())
        );
        let start = match self.by_ts.binary_search_by_key(&from, |entry| entry.0) {
            Ok(i) => i,
            Err(i) => i,
        };
        Ok(self
            .by_ts
            .iter()
            .skip(start)
            .map(|entry| &**entry)
            .take_while(move |(ts, _)| *ts <= to)
            .map(|(ts, writes)| (*ts, writes.iter())))
    }

    fn is_stale(
        &self,
        reads: &ReadSet,
        reads_ts: Timestamp,
        ts: Timestamp,
    ) -> anyhow::Result<Option<ConflictingReadWithWriteTs>> {
        let log_range = self.iter(reads_ts.succ()?, ts)?;
        Ok(reads.writes_overlap(log_range))
    }

    fn refresh_token(&self, mut token: Token, ts: Timestamp) -> anyhow::Result<Option<Token>> {
        let result = match self.is_stale(token.reads(), token.ts(), ts) {
            Ok(Some(_)) => None,
            Err(e) if common::errors::ErrorMetadataAnyhowExt::is_out_of_retention(&e) => None,
            Err(e) => return Err(e),
            Ok(None) => {
                if token.ts() < ts {
                    token.advance_ts(ts);
                }
                Some(token)
            },
        };
        Ok(result)
    }
}

pub fn new_write_log(initial_timestamp: Timestamp) -> (LogOwner, LogReader, LogWriter) {
    let manager = Arc::new(Mutex::new(WriteLogManager::new(initial_timestamp)));
    (
        LogOwner {
            inner: manager.clone(),
        },
        LogReader {
            inner: manager.clone(),
        },
        LogWriter { inner: manager },
    )
}

/// LogOwner consumes the log and is responsible for trimming it. The
/// subscription worker holds it.
pub struct LogOwner {
    inner: Arc<Mutex<WriteLogManager>>,
}

impl LogOwner {
    pub fn enforce_retention_policy(&mut self, current_ts: Timestamp) {
        self.inner.lock().enforce_retention_policy(current_ts)
    }

    pub fn reader(&self) -> LogReader {
        LogReader {
            inner: self.inner.clone(),
        }
    }

    pub fn max_ts(&self) -> Timestamp {
        self.inner.lock().log.max_ts()
    }

    pub fn refresh_token(&self, token: Token, ts: Timestamp) -> anyhow::Result<Option<Token>> {
        let snapshot = { self.inner.lock().log.clone() };
        snapshot.refresh_token(token, ts)
    }

    /// Blocks until the log has advanced past the given timestamp, returning
    /// the new max.
    pub async fn wait_for_higher_ts(&mut self, target_ts: Timestamp) -> Timestamp {
        let fut = self.inner.lock().wait_for_higher_ts(target_ts);
        fut.await;
        let result = self.inner.lock().log.max_ts();
        assert!(result > target_ts);
        result
    }

    pub fn for_each<F>(&self, from: Timestamp, to: Timestamp, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(Timestamp, &[DocumentUpdate]),
    {
        let snapshot = { self.inner.lock().log.clone() };
        for (ts, writes) in snapshot.iter(from, to)? {
            f(ts, writes.as_slice());
        }
        Ok(())
    }
}

/// Read-only access to the log for token revalidation.
#[derive(Clone)]
pub struct LogReader {
    inner: Arc<Mutex<WriteLogManager>>,
}

impl LogReader {
    pub fn max_ts(&self) -> Timestamp {
        self.inner.lock().log.max_ts()
    }

    pub fn refresh_token(&self, token: Token, ts: Timestamp) -> anyhow::Result<Option<Token>> {
        let snapshot = { self.inner.lock().log.clone() };
        snapshot.refresh_token(token, ts)
    }

    pub fn refresh_reads_until_max_ts(&self, token: Token) -> anyhow::Result<Option<Token>> {
        let snapshot = { self.inner.lock().log.clone() };
        let max_ts = snapshot.max_ts();
        snapshot.refresh_token(token, max_ts)
    }
}

/// Append access for the committer.
pub struct LogWriter {
    inner: Arc<Mutex<WriteLogManager>>,
}

impl LogWriter {
    pub fn append(&mut self, ts: Timestamp, writes: OrderedUpdates) {
        self.inner.lock().append(ts, writes);
    }

    pub fn is_stale(
        &self,
        reads: &ReadSet,
        reads_ts: Timestamp,
        ts: Timestamp,
    ) -> anyhow::Result<Option<ConflictingReadWithWriteTs>> {
        let snapshot = { self.inner.lock().log.clone() };
        snapshot.is_stale(reads, reads_ts, ts)
    }
}

/// Pending writes let the committer detect conflicts with commits that have
/// been validated but have not finished writing to persistence and the
/// snapshot manager. Checking only the published log would let two
/// concurrent commits both pass validation and then mutually conflict.
///
/// Every entry's timestamp is strictly greater than the last published
/// commit and strictly less than the next assigned commit timestamp, and
/// entries leave in timestamp order.
pub struct PendingWrites {
    by_ts: BTreeMap<Timestamp, OrderedUpdates>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self {
            by_ts: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ts.is_empty()
    }

    pub fn push_back(&mut self, ts: Timestamp, writes: OrderedUpdates) -> PendingWriteHandle {
        if let Some((last_ts, _)) = self.by_ts.iter().next_back() {
            assert!(*last_ts < ts, "{last_ts} >= {ts}");
        }
        self.by_ts.insert(ts, writes);
        PendingWriteHandle(Some(ts))
    }

    pub fn iter(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> impl Iterator<Item = (Timestamp, std::slice::Iter<'_, DocumentUpdate>)> {
        self.by_ts
            .range(from..=to)
            .map(|(ts, writes)| (*ts, writes.iter()))
    }

    pub fn is_stale(
        &self,
        reads: &ReadSet,
        reads_ts: Timestamp,
        ts: Timestamp,
    ) -> anyhow::Result<Option<ConflictingReadWithWriteTs>> {
        Ok(reads.writes_overlap(self.iter(reads_ts.succ()?, ts)))
    }

    pub fn pop_first(&mut self, mut handle: PendingWriteHandle) -> Option<(Timestamp, OrderedUpdates)> {
        let first = self.by_ts.pop_first();
        if let Some((ts, writes)) = first {
            if let Some(expected_ts) = handle.0 {
                if ts == expected_ts {
                    handle.0.take();
                }
            }
            Some((ts, writes))
        } else {
            None
        }
    }

    pub fn min_ts(&self) -> Option<Timestamp> {
        self.by_ts.first_key_value().map(|(ts, _)| *ts)
    }
}

impl Default for PendingWrites {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a commit was staged; carries its timestamp until popped.
pub struct PendingWriteHandle(Option<Timestamp>);

impl PendingWriteHandle {
    pub fn must_commit_ts(&self) -> Timestamp {
        self.0.expect("pending write already published")
    }
}

#[cfg(test)]
mod tests {
    use common::{
        assert_obj,
        document::{
            Document,
            DocumentId,
            InternalId,
        },
        interval::{
            End,
            Interval,
            StartIncluded,
        },
        types::{
            IndexDescriptor,
            IndexName,
            IndexedFields,
        },
    };

    use super::*;
    use crate::reads::TransactionReadSet;

    #[test]
    fn test_write_log_iter_and_retention() -> anyhow::Result<()> {
        let mut manager = WriteLogManager::new(Timestamp::must(1000));
        assert_eq!(manager.log.purged_ts, Timestamp::must(1000));
        assert_eq!(manager.log.max_ts(), Timestamp::must(1000));

        for ts in (1002..=1010).step_by(2) {
            manager.append(Timestamp::must(ts), vec![]);
            assert_eq!(manager.log.max_ts(), Timestamp::must(ts));
        }

        // Reads at or below the purge point fail out of retention.
        assert!(manager
            .log
            .iter(Timestamp::must(1000), Timestamp::must(1010))
            .is_err());
        fn collect(log: &WriteLog, from: u64, to: u64) -> anyhow::Result<Vec<u64>> {
            Ok(log
                .iter(Timestamp::must(from), Timestamp::must(to))?
                .map(|(ts, _)| u64::from(ts))
                .collect())
        }
        assert_eq!(
            collect(&manager.log, 1001, 1010)?,
            vec![1002, 1004, 1006, 1008, 1010]
        );
        assert_eq!(collect(&manager.log, 1004, 1008)?, vec![1004, 1006, 1008]);
        assert_eq!(
            collect(&manager.log, 1004, 1020)?,
            vec![1004, 1006, 1008, 1010]
        );

        // Entries older than the max retention window get trimmed.
        manager.enforce_retention_policy(
            Timestamp::must(1005).add(*WRITE_LOG_MAX_RETENTION_SECS)?,
        );
        assert_eq!(manager.log.purged_ts, Timestamp::must(1004));
        assert_eq!(manager.log.max_ts(), Timestamp::must(1010));
        assert!(manager
            .log
            .iter(Timestamp::must(1004), Timestamp::must(1010))
            .is_err());
        assert_eq!(collect(&manager.log, 1005, 1010)?, vec![1006, 1008, 1010]);
        Ok(())
    }

    fn items_doc(qty: i64) -> Document {
        let id = DocumentId::new("items".parse().unwrap(), InternalId([9; 16]));
        Document::new(id, assert_obj!("qty" => qty)).unwrap()
    }

    fn by_qty_read_set(interval: Interval) -> ReadSet {
        let index = IndexName::new(
            "items".parse().unwrap(),
            IndexDescriptor::new("by_qty").unwrap(),
        );
        let fields: IndexedFields = vec!["qty".parse().unwrap()].try_into().unwrap();
        let mut reads = TransactionReadSet::new();
        reads.record_indexed_directly(index, fields, interval).unwrap();
        reads.into_read_set()
    }

    #[test]
    fn test_is_stale() -> anyhow::Result<()> {
        let mut manager = WriteLogManager::new(Timestamp::must(1000));
        let doc = items_doc(5);
        let fields: IndexedFields = vec!["qty".parse().unwrap()].try_into().unwrap();
        let key: Vec<u8> = doc.index_key(&fields).to_bytes().0;
        manager.append(
            Timestamp::must(1003),
            vec![DocumentUpdate {
                id: doc.id().clone(),
                old_document: None,
                new_document: Some(doc.clone()),
            }],
        );

        // Write conflicts with a read of everything.
        let all = by_qty_read_set(Interval::all());
        let conflict = manager
            .log
            .is_stale(&all, Timestamp::must(1001), Timestamp::must(1004))?
            .unwrap();
        assert_eq!(conflict.write_ts, Timestamp::must(1003));

        // Write happened after the validation window.
        assert_eq!(
            manager
                .log
                .is_stale(&all, Timestamp::must(1001), Timestamp::must(1002))?,
            None
        );
        // Write happened at or before the reads.
        assert_eq!(
            manager
                .log
                .is_stale(&all, Timestamp::must(1003), Timestamp::must(1004))?,
            None
        );

        // Empty interval never conflicts.
        let empty = by_qty_read_set(Interval::empty());
        assert_eq!(
            manager
                .log
                .is_stale(&empty, Timestamp::must(1001), Timestamp::must(1004))?,
            None
        );

        // Interval ending exactly at the write's key excludes it.
        let below = by_qty_read_set(Interval {
            start: StartIncluded(common::interval::BinaryKey::min()),
            end: End::Excluded(key.clone().into()),
        });
        assert_eq!(
            manager
                .log
                .is_stale(&below, Timestamp::must(1001), Timestamp::must(1004))?,
            None
        );

        // Interval starting at the write's key includes it.
        let at_and_above = by_qty_read_set(Interval {
            start: StartIncluded(key.into()),
            end: End::Unbounded,
        });
        assert!(manager
            .log
            .is_stale(&at_and_above, Timestamp::must(1001), Timestamp::must(1004))?
            .is_some());
        Ok(())
    }

    #[test]
    fn test_tombstone_is_stale() -> anyhow::Result<()> {
        let mut manager = WriteLogManager::new(Timestamp::must(1000));
        let doc = items_doc(5);
        manager.append(
            Timestamp::must(1003),
            vec![DocumentUpdate {
                id: doc.id().clone(),
                old_document: Some(doc),
                new_document: None,
            }],
        );
        let all = by_qty_read_set(Interval::all());
        assert!(manager
            .log
            .is_stale(&all, Timestamp::must(1001), Timestamp::must(1004))?
            .is_some());
        Ok(())
    }

    #[test]
    fn test_pending_writes_order() {
        let mut pending = PendingWrites::new();
        let h1 = pending.push_back(Timestamp::must(10), vec![]);
        let _h2 = pending.push_back(Timestamp::must(11), vec![]);
        assert_eq!(pending.min_ts(), Some(Timestamp::must(10)));
        let (ts, _) = pending.pop_first(h1).unwrap();
        assert_eq!(ts, Timestamp::must(10));
        assert_eq!(pending.min_ts(), Some(Timestamp::must(11)));
    }

    #[test]
    #[should_panic(expected = ">=")]
    fn test_pending_writes_rejects_regression() {
        let mut pending = PendingWrites::new();
        let _ = pending.push_back(Timestamp::must(10), vec![]);
        let _ = pending.push_back(Timestamp::must(10), vec![]);
    }
}
