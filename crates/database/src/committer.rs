use std::{
    cmp,
    sync::Arc,
};

use common::{
    errors::ErrorMetadata,
    knobs::{
        COMMITTER_QUEUE_SIZE,
        PENDING_WRITES_HIGH_WATER,
    },
    persistence::{
        DocumentLogEntry,
        Persistence,
    },
    sync::{
        Reader,
        Writer,
    },
    types::Timestamp,
};
use futures::{
    future::BoxFuture,
    select_biased,
    stream::FuturesOrdered,
    FutureExt,
    StreamExt,
};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::{
    clock::TimestampOracle,
    metrics,
    reads::{
        ConflictingReadWithWriteTs,
        ReadSet,
    },
    snapshot_manager::SnapshotManager,
    transaction::FinalTransaction,
    write_log::{
        LogWriter,
        OrderedUpdates,
        PendingWriteHandle,
        PendingWrites,
    },
};

enum PersistenceWrite {
    Commit {
        pending_write: PendingWriteHandle,
        write_result: anyhow::Result<()>,
        result: oneshot::Sender<anyhow::Result<Timestamp>>,
    },
}

/// The single-writer serializer. All commits funnel through one instance of
/// this worker: it assigns commit timestamps, validates reads against the
/// window `(begin_ts, commit_ts]` in both the published log and pending
/// writes, stages, persists, and publishes.
///
/// Timestamp assignment, validation, and staging are serial; the durability
/// wait is pipelined through `persistence_writes` so validation of the next
/// commit overlaps the previous commit's fsync. `FuturesOrdered` yields
/// completions in submission order, which keeps publication in
/// commit-timestamp order.
pub struct Committer {
    // Staged commits for conflict checking, exclusive to this worker.
    pending_writes: PendingWrites,
    // External log of published writes, feeding subscriptions.
    log: LogWriter,

    snapshot_manager: Writer<SnapshotManager>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<TimestampOracle>,

    last_assigned_ts: Timestamp,

    persistence_writes: FuturesOrdered<BoxFuture<'static, PersistenceWrite>>,
}

impl Committer {
    pub(crate) fn start(
        log: LogWriter,
        snapshot_manager: Writer<SnapshotManager>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<TimestampOracle>,
    ) -> CommitterClient {
        let (tx, rx) = mpsc::channel(*COMMITTER_QUEUE_SIZE);
        let snapshot_reader = snapshot_manager.reader();
        let committer = Self {
            pending_writes: PendingWrites::new(),
            log,
            snapshot_manager,
            persistence,
            clock,
            last_assigned_ts: Timestamp::MIN,
            persistence_writes: FuturesOrdered::new(),
        };
        let handle = tokio::spawn(async move {
            if let Err(err) = committer.go(rx).await {
                // An invariant violation. Dropping the receiver makes every
                // future submission fail: refusing commits is safer than
                // publishing one that might break serializability.
                tracing::error!("Committer failed, refusing further commits: {err:#}");
            }
        });
        CommitterClient {
            handle: Arc::new(Mutex::new(handle)),
            sender: tx,
            snapshot_reader,
        }
    }

    async fn go(mut self, mut rx: mpsc::Receiver<CommitterMessage>) -> anyhow::Result<()> {
        loop {
            // Backpressure: past the high-water mark, stop pulling new
            // submissions and only drain persistence results. Submitters
            // queue on the bounded channel and wait.
            if self.pending_writes.len() >= *PENDING_WRITES_HIGH_WATER {
                match self.persistence_writes.next().await {
                    Some(write) => self.finish_persistence_write(write)?,
                    None => anyhow::bail!(
                        "{} commits pending with no persistence writes in flight",
                        self.pending_writes.len()
                    ),
                }
                continue;
            }
            select_biased! {
                write = self.persistence_writes.select_next_some() => {
                    self.finish_persistence_write(write)?;
                },
                maybe_message = rx.recv().fuse() => {
                    match maybe_message {
                        None => {
                            tracing::info!(
                                "All clients have gone away, shutting down committer..."
                            );
                            return Ok(());
                        },
                        Some(CommitterMessage::Commit { transaction, result }) => {
                            if let Some(future) = self.start_commit(transaction, result) {
                                self.persistence_writes.push_back(future);
                            }
                        },
                    }
                },
            }
        }
    }

    /// Validate and stage a commit, returning the durability future to
    /// pipeline, or `None` when the commit short-circuits (read-only) or
    /// fails validation.
    fn start_commit(
        &mut self,
        transaction: FinalTransaction,
        result: oneshot::Sender<anyhow::Result<Timestamp>>,
    ) -> Option<BoxFuture<'static, PersistenceWrite>> {
        // Read-only transactions commit trivially at their snapshot.
        if transaction.is_readonly() {
            let _ = result.send(Ok(*transaction.begin_timestamp));
            return None;
        }
        let validated = match self.validate_commit(transaction) {
            Ok(validated) => validated,
            Err(e) => {
                let _ = result.send(Err(e));
                return None;
            },
        };
        let ValidatedCommit {
            document_writes,
            pending_write,
        } = validated;
        let persistence = self.persistence.clone();
        Some(
            async move {
                let timer = metrics::PERSISTENCE_WRITE_SECONDS.start_timer();
                let write_result = persistence.write(document_writes).await;
                drop(timer);
                PersistenceWrite::Commit {
                    pending_write,
                    write_result,
                    result,
                }
            }
            .boxed(),
        )
    }

    /// Check that it is valid to commit this transaction at a fresh
    /// timestamp, and stage it in pending writes. Staging makes future
    /// conflicting commits fail validation before this one has persisted or
    /// published. If this commit later fails persistence that staging was a
    /// false conflict for someone else; rare and acceptable.
    fn validate_commit(&mut self, transaction: FinalTransaction) -> anyhow::Result<ValidatedCommit> {
        let commit_ts = self.next_commit_ts()?;
        if let Some(conflicting_read) = self.commit_has_conflict(
            &transaction.reads,
            *transaction.begin_timestamp,
            commit_ts,
        )? {
            metrics::OCC_CONFLICTS_TOTAL.inc();
            return Err(conflicting_read.into_error());
        }

        let updates: Vec<_> = transaction
            .writes
            .into_updates()
            .into_iter()
            .map(|(_, update)| update)
            .collect();
        let document_writes: Vec<DocumentLogEntry> = updates
            .iter()
            .map(|update| DocumentLogEntry {
                ts: commit_ts,
                id: update.id.clone(),
                value: update.new_document.clone(),
                prev_ts: update.old_document.as_ref().map(|(_, ts)| *ts),
            })
            .collect();
        let ordered: OrderedUpdates = updates
            .iter()
            .map(|update| update.to_document_update())
            .collect();

        let pending_write = self.pending_writes.push_back(commit_ts, ordered);
        metrics::PENDING_WRITES.set(self.pending_writes.len() as i64);
        Ok(ValidatedCommit {
            document_writes,
            pending_write,
        })
    }

    /// Enumerate every write in `(reads_ts, commit_ts]` from both the
    /// published log and the pending set. Checking only the published log
    /// would let two concurrent commits both pass validation and then
    /// mutually conflict.
    fn commit_has_conflict(
        &self,
        reads: &ReadSet,
        reads_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> anyhow::Result<Option<ConflictingReadWithWriteTs>> {
        if let Some(conflicting_read) = self.log.is_stale(reads, reads_ts, commit_ts)? {
            return Ok(Some(conflicting_read));
        }
        if let Some(conflicting_read) = self.pending_writes.is_stale(reads, reads_ts, commit_ts)? {
            return Ok(Some(conflicting_read));
        }
        Ok(None)
    }

    fn finish_persistence_write(&mut self, write: PersistenceWrite) -> anyhow::Result<()> {
        match write {
            PersistenceWrite::Commit {
                pending_write,
                write_result,
                result,
            } => {
                let commit_ts = pending_write.must_commit_ts();
                match write_result {
                    Ok(()) => {
                        self.publish_commit(pending_write)?;
                        let _ = result.send(Ok(commit_ts));
                    },
                    Err(e) => {
                        // The commit is not durable: unstage it and surface
                        // the failure without publishing. Later pending
                        // commits were validated as non-conflicting with
                        // this one, so dropping it keeps them sound.
                        let (ts, _) = self
                            .pending_writes
                            .pop_first(pending_write)
                            .ok_or_else(|| anyhow::anyhow!("commit at {commit_ts} not pending"))?;
                        anyhow::ensure!(
                            ts == commit_ts,
                            "pending writes popped out of order: {ts} != {commit_ts}"
                        );
                        metrics::PENDING_WRITES.set(self.pending_writes.len() as i64);
                        tracing::error!("Commit at {commit_ts} failed durability: {e:#}");
                        let _ = result.send(Err(e.context(
                            ErrorMetadata::persistence_unavailable(
                                "Durable write failed; the commit was not published",
                            ),
                        )));
                    },
                }
            },
        }
        Ok(())
    }

    /// The commit is durable: mark it complete and make its rows readable.
    /// The front of pending is necessarily this commit, because commits are
    /// validated, staged, and persisted in the same order.
    fn publish_commit(&mut self, pending_write: PendingWriteHandle) -> anyhow::Result<()> {
        let commit_ts = pending_write.must_commit_ts();
        let (ts, ordered_updates) = self
            .pending_writes
            .pop_first(pending_write)
            .ok_or_else(|| anyhow::anyhow!("commit at {commit_ts} not pending"))?;
        anyhow::ensure!(ts == commit_ts, "commits out of order: {ts} != {commit_ts}");
        metrics::PENDING_WRITES.set(self.pending_writes.len() as i64);
        metrics::COMMIT_ROWS.inc_by(ordered_updates.len() as u64);

        let (latest_ts, mut new_snapshot) = { self.snapshot_manager.read().latest() };
        anyhow::ensure!(
            *latest_ts < commit_ts,
            "commit at {commit_ts} is not beyond the latest snapshot {latest_ts}"
        );
        for update in &ordered_updates {
            new_snapshot.update(update, commit_ts);
        }

        // Log append and snapshot push happen in the same committer turn;
        // the log goes first so the subscription worker never observes a
        // snapshot ahead of the log.
        self.log.append(commit_ts, ordered_updates);
        let mut snapshot_manager = self.snapshot_manager.write();
        snapshot_manager.push(commit_ts, new_snapshot);
        metrics::COMMITS_TOTAL.inc();
        Ok(())
    }

    /// Commit timestamps exceed the latest published snapshot, the clock,
    /// and every previously assigned timestamp.
    fn next_commit_ts(&mut self) -> anyhow::Result<Timestamp> {
        let latest_ts = self.snapshot_manager.read().latest_ts();
        let next = cmp::max(
            latest_ts.succ()?,
            cmp::max(self.clock.next_ts()?, self.last_assigned_ts.succ()?),
        );
        self.last_assigned_ts = next;
        Ok(next)
    }
}

struct ValidatedCommit {
    document_writes: Vec<DocumentLogEntry>,
    pending_write: PendingWriteHandle,
}

enum CommitterMessage {
    Commit {
        transaction: FinalTransaction,
        result: oneshot::Sender<anyhow::Result<Timestamp>>,
    },
}

#[derive(Clone)]
pub struct CommitterClient {
    handle: Arc<Mutex<tokio::task::JoinHandle<()>>>,
    sender: mpsc::Sender<CommitterMessage>,
    snapshot_reader: Reader<SnapshotManager>,
}

impl CommitterClient {
    /// Submit a finalized transaction. Resolves to the commit timestamp, an
    /// OCC abort carrying the conflicting timestamp, or a persistence
    /// failure. Submission waits (rather than failing) while the committer
    /// is backed up. Dropping the returned future does not cancel a commit
    /// that has entered validation.
    pub async fn commit(&self, transaction: FinalTransaction) -> anyhow::Result<Timestamp> {
        let _timer = metrics::COMMIT_SECONDS.start_timer();
        let (tx, rx) = oneshot::channel();
        let message = CommitterMessage::Commit {
            transaction,
            result: tx,
        };
        self.sender
            .send(message)
            .await
            .map_err(|_| metrics::shutdown_error())?;
        let Ok(result) = rx.await else {
            anyhow::bail!(metrics::shutdown_error());
        };
        result
    }

    pub fn snapshot_reader(&self) -> Reader<SnapshotManager> {
        self.snapshot_reader.clone()
    }

    pub fn shutdown(&self) {
        self.handle.lock().abort();
    }
}
