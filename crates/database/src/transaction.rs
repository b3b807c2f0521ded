use std::time::Instant;

use common::{
    document::{
        Document,
        DocumentId,
        InternalId,
    },
    errors::ErrorMetadata,
    interval::Interval,
    knobs::TRANSACTION_DEADLINE,
    sync::Reader,
    types::{
        IndexName,
        Order,
        RepeatableTimestamp,
        TableName,
        WriteTimestamp,
    },
    value::Object,
};

use crate::{
    reads::{
        ReadSet,
        TransactionReadSet,
    },
    snapshot_manager::SnapshotManager,
    token::Token,
    transaction_index::{
        CursorPosition,
        TransactionIndex,
    },
    writes::Writes,
};

/// Per-execution scratch state: a begin timestamp, the accumulating read
/// set, and the accumulating write set. Dropping an unfinalized transaction
/// has no effect on global state.
pub struct Transaction {
    begin_timestamp: RepeatableTimestamp,
    reads: TransactionReadSet,
    writes: Writes,
    index: TransactionIndex,
    deadline: Instant,
}

impl Transaction {
    pub(crate) fn new(
        begin_timestamp: RepeatableTimestamp,
        registry: indexing::IndexRegistry,
        snapshot_reader: Reader<SnapshotManager>,
    ) -> Self {
        Self {
            begin_timestamp,
            reads: TransactionReadSet::new(),
            writes: Writes::new(),
            index: TransactionIndex::new(registry, *begin_timestamp, snapshot_reader),
            deadline: Instant::now() + *TRANSACTION_DEADLINE,
        }
    }

    pub fn begin_timestamp(&self) -> RepeatableTimestamp {
        self.begin_timestamp
    }

    pub fn is_readonly(&self) -> bool {
        self.writes.is_empty()
    }

    /// Point lookup by id, reading through the transaction's own writes.
    /// Records the id's interval whether or not the document exists, so a
    /// later creation of this id invalidates us.
    pub fn get(&mut self, id: &DocumentId) -> anyhow::Result<Option<Document>> {
        Ok(self.get_with_ts(id)?.map(|(document, _)| document))
    }

    fn get_with_ts(
        &mut self,
        id: &DocumentId,
    ) -> anyhow::Result<Option<(Document, WriteTimestamp)>> {
        let index_name = IndexName::by_id(id.table().clone());
        let interval = Interval::prefix(Vec::from(id.index_key_bytes().0).into());
        let fields = self.index.registry().require_enabled(&index_name)?.fields.clone();
        let (results, _) = self.index.range(&index_name, &interval, Order::Asc, 1)?;
        self.reads
            .record_indexed_directly(index_name, fields, interval)?;
        let result = match results.into_iter().next() {
            Some((_, document, ts)) => {
                self.reads.record_read_document(document.size())?;
                Some((document, ts))
            },
            None => None,
        };
        Ok(result)
    }

    /// Scan `interval` of `index_name` in `order`, returning at most
    /// `limit` documents. The recorded read interval is the range actually
    /// consumed: an early-terminated scan records up through the last key
    /// read plus its immediate successor boundary, not the requested range.
    pub fn range(
        &mut self,
        index_name: &IndexName,
        interval: &Interval,
        order: Order,
        limit: usize,
    ) -> anyhow::Result<Vec<(Document, WriteTimestamp)>> {
        let fields = self.index.registry().require_enabled(index_name)?.fields.clone();
        let (page, cursor) = self.index.range(index_name, interval, order, limit)?;
        let consumed = match cursor {
            CursorPosition::End => interval.clone(),
            CursorPosition::After(last_key) => match order {
                Order::Asc => interval.split_after(last_key).0,
                Order::Desc => Interval {
                    start: common::interval::StartIncluded(Vec::from(last_key.0).into()),
                    end: interval.end.clone(),
                },
            },
        };
        self.reads
            .record_indexed_directly(index_name.clone(), fields, consumed)?;
        let mut results = Vec::with_capacity(page.len());
        for (_, document, ts) in page {
            self.reads.record_read_document(document.size())?;
            results.push((document, ts));
        }
        Ok(results)
    }

    /// Insert a new document, allocating its id. The new id takes a read
    /// dependency so a racing creation of the same id conflicts.
    pub fn insert(&mut self, table: TableName, value: Object) -> anyhow::Result<DocumentId> {
        self.index.registry().require_table(&table)?;
        let id = DocumentId::new(table, Self::generate_id());
        let document = Document::new(id.clone(), value)?;
        self.writes.update(
            self.index.registry(),
            &mut self.reads,
            id.clone(),
            None,
            Some(document.clone()),
        )?;
        self.index.update(None, Some(&document));
        Ok(id)
    }

    /// Replace an existing document's value. Fails with InvalidWrite if the
    /// document does not exist at the transaction's snapshot.
    pub fn replace(&mut self, id: DocumentId, value: Object) -> anyhow::Result<Document> {
        let Some((old_document, old_ts)) = self.get_with_ts(&id)? else {
            anyhow::bail!(ErrorMetadata::invalid_write(format!(
                "Cannot replace nonexistent document {id}"
            )));
        };
        let new_document = Document::new(id.clone(), value)?;
        self.writes.update(
            self.index.registry(),
            &mut self.reads,
            id,
            Some((old_document.clone(), old_ts)),
            Some(new_document.clone()),
        )?;
        self.index.update(Some(&old_document), Some(&new_document));
        Ok(new_document)
    }

    /// Delete a document, writing a tombstone. Fails with InvalidWrite if it
    /// does not exist at the transaction's snapshot.
    pub fn delete(&mut self, id: DocumentId) -> anyhow::Result<Document> {
        let Some((old_document, old_ts)) = self.get_with_ts(&id)? else {
            anyhow::bail!(ErrorMetadata::invalid_write(format!(
                "Cannot delete nonexistent document {id}"
            )));
        };
        self.writes.update(
            self.index.registry(),
            &mut self.reads,
            id,
            Some((old_document.clone(), old_ts)),
            None,
        )?;
        self.index.update(Some(&old_document), None);
        Ok(old_document)
    }

    fn generate_id() -> InternalId {
        InternalId(fastrand::u128(..).to_be_bytes())
    }

    /// Produce the immutable commit payload. The transaction is consumed;
    /// this is also where the wall-clock deadline is enforced.
    pub fn finalize(self) -> anyhow::Result<FinalTransaction> {
        anyhow::ensure!(
            Instant::now() <= self.deadline,
            ErrorMetadata::transaction_timeout(),
        );
        Ok(FinalTransaction {
            begin_timestamp: self.begin_timestamp,
            reads: self.reads.into_read_set(),
            writes: self.writes,
        })
    }

    /// The transaction's reads as a subscription token valid at its begin
    /// timestamp.
    pub fn into_token(self) -> Token {
        Token::new(self.reads.into_read_set(), *self.begin_timestamp)
    }
}

/// An immutable, finalized transaction handed to the committer.
pub struct FinalTransaction {
    pub begin_timestamp: RepeatableTimestamp,
    pub reads: ReadSet,
    pub writes: Writes,
}

impl FinalTransaction {
    pub fn is_readonly(&self) -> bool {
        self.writes.is_empty()
    }
}
