//! Read set tracking for an active transaction.

use std::collections::BTreeMap;

use common::{
    document::{
        Document,
        DocumentId,
        DocumentUpdate,
    },
    errors::ErrorMetadata,
    interval::{
        Interval,
        IntervalSet,
    },
    knobs::{
        TRANSACTION_MAX_READ_SET_INTERVALS,
        TRANSACTION_MAX_READ_SIZE_BYTES,
        TRANSACTION_MAX_READ_SIZE_ROWS,
    },
    types::{
        IndexName,
        IndexedFields,
        Timestamp,
    },
};

pub const OVER_LIMIT_HELP: &str = "Consider using smaller limits in your queries, paginating, or \
                                   using a more selective index range.";

/// The intervals a transaction consulted on one index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexReads {
    pub fields: IndexedFields,
    pub intervals: IntervalSet,
}

/// The set of keys whose presence or absence influenced a transaction's
/// output, grouped by index. This is the one structure shared by commit
/// validation, subscription invalidation, and cache invalidation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadSet {
    indexed: BTreeMap<IndexName, IndexReads>,
}

/// A write that landed inside a read set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConflictingRead {
    pub index: IndexName,
    pub id: DocumentId,
}

/// A conflicting read together with the commit that caused it; the
/// committer reports `write_ts` so callers can retry at or above it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConflictingReadWithWriteTs {
    pub read: ConflictingRead,
    pub write_ts: Timestamp,
}

impl ConflictingReadWithWriteTs {
    pub fn into_error(self) -> anyhow::Error {
        anyhow::anyhow!(ErrorMetadata::occ(
            self.write_ts,
            format!(
                "Documents read from {} changed while this transaction was being run; conflicting \
                 write to {} at ts {}",
                self.read.index, self.read.id, self.write_ts,
            ),
        ))
    }
}

impl ReadSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.indexed.is_empty()
    }

    pub fn iter_indexed(&self) -> impl Iterator<Item = (&IndexName, &IndexReads)> {
        self.indexed.iter()
    }

    pub fn consume(self) -> impl Iterator<Item = (IndexName, IndexReads)> {
        self.indexed.into_iter()
    }

    /// Does a single document revision fall inside the read set? The
    /// document's key is computed per index the read set mentions, so a
    /// revision conflicts through any index whose recorded intervals cover
    /// it.
    pub fn overlaps(&self, document: &Document) -> Option<ConflictingRead> {
        for (index, IndexReads { fields, intervals }) in &self.indexed {
            if index.table() == document.id().table() {
                let index_key = document.index_key(fields).to_bytes();
                if intervals.contains(&index_key) {
                    return Some(ConflictingRead {
                        index: index.clone(),
                        id: document.id().clone(),
                    });
                }
            }
        }
        None
    }

    /// The core of conflict detection: does any write in `updates` overlap
    /// this read set? Both the new revision and the prior revision of each
    /// update are tested: a tombstone conflicts through the revision it
    /// removed, and an insert into a scanned gap conflicts through the
    /// revision it created. If a write transaction intersects, it is retried
    /// to preserve serializability; if a subscription intersects, the query
    /// is re-run and pushed to clients.
    pub fn writes_overlap<'a>(
        &self,
        updates: impl Iterator<Item = (Timestamp, impl Iterator<Item = &'a DocumentUpdate>)>,
    ) -> Option<ConflictingReadWithWriteTs> {
        for (ts, updates) in updates {
            for update in updates {
                if let Some(document) = &update.new_document {
                    if let Some(read) = self.overlaps(document) {
                        return Some(ConflictingReadWithWriteTs { read, write_ts: ts });
                    }
                }
                if let Some(prev) = &update.old_document {
                    if let Some(read) = self.overlaps(prev) {
                        return Some(ConflictingReadWithWriteTs { read, write_ts: ts });
                    }
                }
            }
        }
        None
    }
}

/// Tracks the read set for the current transaction: successful reads as well
/// as ranges observed empty, so later commits into those gaps invalidate us.
///
/// `Transaction` keeps this up to date when consulting the index; the code
/// paths that update it are deliberately few so none is missed.
#[derive(Clone, Debug)]
pub struct TransactionReadSet {
    read_set: ReadSet,

    // Precomputed sum of the per-index IntervalSet sizes.
    num_intervals: usize,

    num_documents: usize,
    document_bytes: usize,
}

impl TransactionReadSet {
    pub fn new() -> Self {
        Self {
            read_set: ReadSet::empty(),
            num_intervals: 0,
            num_documents: 0,
            document_bytes: 0,
        }
    }

    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    pub fn into_read_set(self) -> ReadSet {
        self.read_set
    }

    pub fn num_intervals(&self) -> usize {
        self.num_intervals
    }

    fn record_indexed(
        &mut self,
        index_name: IndexName,
        fields: IndexedFields,
        interval: Interval,
    ) -> (usize, usize) {
        let reads = self
            .read_set
            .indexed
            .entry(index_name)
            .or_insert_with(|| IndexReads {
                fields,
                intervals: IntervalSet::new(),
            });
        let before = reads.intervals.len();
        reads.intervals.add(interval);
        (before, reads.intervals.len())
    }

    /// Record an interval the caller directly scanned. Fails when the
    /// transaction has accumulated too many distinct intervals.
    pub fn record_indexed_directly(
        &mut self,
        index_name: IndexName,
        fields: IndexedFields,
        interval: Interval,
    ) -> anyhow::Result<()> {
        let (before, after) = self.record_indexed(index_name, fields, interval);
        self.num_intervals = self.num_intervals.saturating_sub(before) + after;
        anyhow::ensure!(
            self.num_intervals <= *TRANSACTION_MAX_READ_SET_INTERVALS,
            ErrorMetadata::pagination_limit(
                "TooManyReads",
                format!(
                    "Too many reads in a single transaction (limit: {}). {OVER_LIMIT_HELP}",
                    *TRANSACTION_MAX_READ_SET_INTERVALS,
                ),
            ),
        );
        Ok(())
    }

    /// Record a read dependency the caller did not directly initiate, e.g.
    /// the id-reuse dependency a write takes on its own document id. Not
    /// counted against the interval limit.
    pub fn record_indexed_derived(
        &mut self,
        index_name: IndexName,
        fields: IndexedFields,
        interval: Interval,
    ) {
        self.record_indexed(index_name, fields, interval);
    }

    pub fn record_read_document(&mut self, document_size: usize) -> anyhow::Result<()> {
        // Increment before the limit check so the recorded size reflects the
        // read that pushed us over.
        self.num_documents += 1;
        self.document_bytes += document_size;
        anyhow::ensure!(
            self.num_documents <= *TRANSACTION_MAX_READ_SIZE_ROWS,
            ErrorMetadata::pagination_limit(
                "TooManyDocumentsRead",
                format!(
                    "Too many documents read in a single transaction (limit: {}). \
                     {OVER_LIMIT_HELP}",
                    *TRANSACTION_MAX_READ_SIZE_ROWS,
                ),
            ),
        );
        anyhow::ensure!(
            self.document_bytes <= *TRANSACTION_MAX_READ_SIZE_BYTES,
            ErrorMetadata::pagination_limit(
                "TooManyBytesRead",
                format!(
                    "Too many bytes read in a single transaction (limit: {} bytes). \
                     {OVER_LIMIT_HELP}",
                    *TRANSACTION_MAX_READ_SIZE_BYTES,
                ),
            ),
        );
        Ok(())
    }
}

impl Default for TransactionReadSet {
    fn default() -> Self {
        Self::new()
    }
}
