use std::cmp::Ordering;

use common::{
    document::Document,
    index::IndexKeyBytes,
    interval::Interval,
    sync::Reader,
    types::{
        IndexName,
        Order,
        Timestamp,
        WriteTimestamp,
    },
};
use imbl::OrdMap;
use indexing::IndexRegistry;

use crate::snapshot_manager::SnapshotManager;

/// Where an index scan stopped: after a specific key, or at the end of the
/// requested interval.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CursorPosition {
    After(IndexKeyBytes),
    End,
}

/// The index view a transaction reads through. It overlays the
/// transaction's own pending index updates on the snapshot at the begin
/// timestamp, so a transaction reads its own writes: insertions shadow,
/// deletions hide, replacements substitute.
///
/// The snapshot is resolved lazily on first read; a begin timestamp that has
/// aged below the retention window fails there with SnapshotTooOld.
pub struct TransactionIndex {
    registry: IndexRegistry,
    begin_ts: Timestamp,
    snapshot_reader: Reader<SnapshotManager>,
    snapshot: Option<indexing::MemoryIndexes>,
    // Pending entries per index: `None` hides the base entry at that key.
    updates: OrdMap<IndexName, OrdMap<IndexKeyBytes, Option<Document>>>,
}

impl TransactionIndex {
    pub fn new(
        registry: IndexRegistry,
        begin_ts: Timestamp,
        snapshot_reader: Reader<SnapshotManager>,
    ) -> Self {
        Self {
            registry,
            begin_ts,
            snapshot_reader,
            snapshot: None,
            updates: OrdMap::new(),
        }
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    fn snapshot(&mut self) -> anyhow::Result<&indexing::MemoryIndexes> {
        if self.snapshot.is_none() {
            let snapshot = self.snapshot_reader.lock().snapshot(self.begin_ts)?;
            self.snapshot = Some(snapshot.indexes);
        }
        Ok(self.snapshot.as_ref().expect("just resolved"))
    }

    /// Buffer the transaction's own document change into the overlay.
    pub fn update(&mut self, deletion: Option<&Document>, insertion: Option<&Document>) {
        for update in self.registry.index_updates(deletion, insertion) {
            let pending = self
                .updates
                .entry(update.index_name)
                .or_insert_with(OrdMap::new);
            match update.value {
                indexing::IndexValue::Deleted => {
                    pending.insert(update.key, None);
                },
                indexing::IndexValue::Document(document) => {
                    pending.insert(update.key, Some(document));
                },
            }
        }
    }

    /// Scan `interval` on `index_name`, merging pending updates over the
    /// snapshot, yielding up to `max_size` documents in `order`. Returns the
    /// page and the cursor where the scan stopped; the caller records the
    /// consumed interval in its read set.
    pub fn range(
        &mut self,
        index_name: &IndexName,
        interval: &Interval,
        order: Order,
        max_size: usize,
    ) -> anyhow::Result<(Vec<(IndexKeyBytes, Document, WriteTimestamp)>, CursorPosition)> {
        anyhow::ensure!(max_size > 0, "range requires a positive limit");
        self.registry.require_enabled(index_name)?;
        let pending = self.updates.get(index_name).cloned().unwrap_or_default();
        let snapshot_entries = self.snapshot()?.range(index_name, interval)?;

        let mut snapshot_it = order.apply(snapshot_entries.into_iter());
        let mut pending_it = order.apply(
            pending
                .range(interval)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
                .into_iter(),
        );

        let mut results: Vec<(IndexKeyBytes, Document, WriteTimestamp)> = Vec::new();
        let mut snapshot_next = snapshot_it.next();
        let mut pending_next = pending_it.next();
        loop {
            if results.len() >= max_size {
                let (last_key, ..) = results.last().expect("max_size > 0 if we got here");
                let cursor = CursorPosition::After(last_key.clone());
                return Ok((results, cursor));
            }
            match (snapshot_next, pending_next) {
                (
                    Some((snapshot_key, snapshot_ts, snapshot_doc)),
                    Some((pending_key, maybe_pending_doc)),
                ) => {
                    let cmp = match order {
                        Order::Asc => snapshot_key.cmp(&pending_key),
                        Order::Desc => pending_key.cmp(&snapshot_key),
                    };
                    match cmp {
                        Ordering::Less => {
                            results.push((
                                snapshot_key,
                                snapshot_doc,
                                WriteTimestamp::Committed(snapshot_ts),
                            ));
                            snapshot_next = snapshot_it.next();
                            pending_next = Some((pending_key, maybe_pending_doc));
                        },
                        Ordering::Equal => {
                            // The pending entry overwrites the snapshot one.
                            if let Some(pending_doc) = maybe_pending_doc {
                                results.push((pending_key, pending_doc, WriteTimestamp::Pending));
                            }
                            snapshot_next = snapshot_it.next();
                            pending_next = pending_it.next();
                        },
                        Ordering::Greater => {
                            if let Some(pending_doc) = maybe_pending_doc {
                                results.push((pending_key, pending_doc, WriteTimestamp::Pending));
                            }
                            snapshot_next = Some((snapshot_key, snapshot_ts, snapshot_doc));
                            pending_next = pending_it.next();
                        },
                    }
                },
                (Some((snapshot_key, snapshot_ts, snapshot_doc)), None) => {
                    results.push((
                        snapshot_key,
                        snapshot_doc,
                        WriteTimestamp::Committed(snapshot_ts),
                    ));
                    snapshot_next = snapshot_it.next();
                    pending_next = None;
                },
                (None, Some((pending_key, maybe_pending_doc))) => {
                    if let Some(pending_doc) = maybe_pending_doc {
                        results.push((pending_key, pending_doc, WriteTimestamp::Pending));
                    }
                    snapshot_next = None;
                    pending_next = pending_it.next();
                },
                (None, None) => break,
            }
        }
        Ok((results, CursorPosition::End))
    }
}
