use std::collections::VecDeque;

use common::{
    document::DocumentUpdate,
    errors::ErrorMetadata,
    knobs::MAX_TRANSACTION_WINDOW,
    types::{
        RepeatableReason,
        RepeatableTimestamp,
        Timestamp,
    },
};
use indexing::{
    IndexRegistry,
    IndexUpdate,
    MemoryIndexes,
};

/// An immutable view of all indexes at a committed timestamp. Cloning is
/// cheap: the index maps share structure copy-on-write.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub index_registry: IndexRegistry,
    pub indexes: MemoryIndexes,
}

impl Snapshot {
    /// Apply one document's change at `commit_ts`, returning the index
    /// updates for the write log and fanout. Committer only, in commit
    /// order.
    pub fn update(
        &mut self,
        document_update: &DocumentUpdate,
        commit_ts: Timestamp,
    ) -> Vec<IndexUpdate> {
        self.indexes.update(
            &self.index_registry,
            commit_ts,
            document_update.old_document.as_ref(),
            document_update.new_document.as_ref(),
        )
    }
}

/// Maintains the published [`Snapshot`]s over a bounded window of recent
/// timestamps, so transactions can begin at any timestamp within the window.
/// Pushing a new version reclaims snapshots that have aged out, which is how
/// old MVCC revisions get garbage collected.
pub struct SnapshotManager {
    versions: VecDeque<(Timestamp, Snapshot)>,
}

impl SnapshotManager {
    pub fn new(initial_ts: Timestamp, initial_snapshot: Snapshot) -> Self {
        let mut versions = VecDeque::new();
        versions.push_back((initial_ts, initial_snapshot));
        Self { versions }
    }

    pub fn latest(&self) -> (RepeatableTimestamp, Snapshot) {
        let (ts, snapshot) = self.versions.back().expect("snapshot versions empty");
        (
            RepeatableTimestamp::new_validated(*ts, RepeatableReason::SnapshotManagerLatest),
            snapshot.clone(),
        )
    }

    pub fn latest_ts(&self) -> RepeatableTimestamp {
        let (ts, _) = self.versions.back().expect("snapshot versions empty");
        RepeatableTimestamp::new_validated(*ts, RepeatableReason::SnapshotManagerLatest)
    }

    fn earliest_ts(&self) -> Timestamp {
        self.versions
            .front()
            .map(|(ts, _)| *ts)
            .expect("snapshot versions empty")
    }

    /// The snapshot visible at `ts`: the version with the greatest
    /// timestamp at or below it. Requests below the retained window fail
    /// with SnapshotTooOld.
    pub fn snapshot(&self, ts: Timestamp) -> anyhow::Result<Snapshot> {
        anyhow::ensure!(
            ts >= self.earliest_ts(),
            anyhow::anyhow!(
                "Timestamp {ts} is below the earliest retained snapshot {}",
                self.earliest_ts()
            )
            .context(ErrorMetadata::out_of_retention())
        );
        anyhow::ensure!(
            ts <= *self.latest_ts(),
            "Timestamp {ts} is more recent than latest_ts {}",
            self.latest_ts(),
        );
        let i = match self.versions.binary_search_by_key(&ts, |&(ts, _)| ts) {
            Ok(i) => i,
            // Insertion position preserving sorted order, i.e. the first
            // index with a greater timestamp; we want its predecessor.
            Err(i) => i.checked_sub(1).expect("checked earliest_ts above"),
        };
        let (_, snapshot) = &self.versions[i];
        Ok(snapshot.clone())
    }

    pub fn push(&mut self, ts: Timestamp, snapshot: Snapshot) {
        assert!(*self.latest_ts() < ts);
        while self.versions.len() > 1
            && ts
                .sub(*MAX_TRANSACTION_WINDOW)
                .map_or(false, |cutoff| self.earliest_ts() < cutoff)
        {
            self.versions.pop_front();
        }
        self.versions.push_back((ts, snapshot));
    }
}
