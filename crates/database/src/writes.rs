//! Write set tracking for an active transaction.

use common::{
    document::{
        Document,
        DocumentId,
        DocumentUpdate,
    },
    errors::ErrorMetadata,
    interval::Interval,
    knobs::{
        TRANSACTION_MAX_NUM_WRITES,
        TRANSACTION_MAX_WRITE_SIZE_BYTES,
    },
    types::{
        IndexName,
        IndexedFields,
        Timestamp,
        WriteTimestamp,
    },
};
use imbl::OrdMap;
use indexing::IndexRegistry;

use crate::reads::TransactionReadSet;

/// A coalesced document update that remembers the commit timestamp of the
/// revision it replaced, for the persistence log's revision chain.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentUpdateWithPrevTs {
    pub id: DocumentId,
    pub old_document: Option<(Document, Timestamp)>,
    pub new_document: Option<Document>,
}

impl DocumentUpdateWithPrevTs {
    pub fn to_document_update(&self) -> DocumentUpdate {
        DocumentUpdate {
            id: self.id.clone(),
            old_document: self.old_document.as_ref().map(|(d, _)| d.clone()),
            new_document: self.new_document.clone(),
        }
    }
}

/// The write set of a transaction: an ordered map from document id to its
/// coalesced update. At most one update per id survives; later writes to the
/// same id replace the earlier new revision.
#[derive(Clone, Debug, PartialEq)]
pub struct Writes {
    updates: OrdMap<DocumentId, DocumentUpdateWithPrevTs>,

    // Recomputable from `updates`; tracked for cheap limit checks.
    num_writes: usize,
    size: usize,
}

impl Writes {
    pub fn new() -> Self {
        Self {
            updates: OrdMap::new(),
            num_writes: 0,
            size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Record one document mutation. `old_document` is the revision the
    /// caller observed (with its write timestamp), `None` for an insert.
    /// Writes also validate against the registry: unknown tables are schema
    /// errors, caught here before commit.
    pub fn update(
        &mut self,
        registry: &IndexRegistry,
        reads: &mut TransactionReadSet,
        document_id: DocumentId,
        old_document: Option<(Document, WriteTimestamp)>,
        new_document: Option<Document>,
    ) -> anyhow::Result<()> {
        registry.require_table(document_id.table())?;
        if old_document.is_none() {
            anyhow::ensure!(
                !self.updates.contains_key(&document_id),
                ErrorMetadata::invalid_write(format!(
                    "Duplicate insert of document id {document_id}"
                )),
            );
            Self::register_new_id(reads, &document_id);
        }

        let id_size = 16;
        let value_size = new_document.as_ref().map_or(0, Document::size);

        // Increment before the limit checks so a failed write is still
        // reflected in the running totals.
        self.num_writes += 1;
        self.size += id_size + value_size;
        anyhow::ensure!(
            self.num_writes <= *TRANSACTION_MAX_NUM_WRITES,
            ErrorMetadata::pagination_limit(
                "TooManyWrites",
                format!(
                    "Too many writes in a single transaction (limit: {})",
                    *TRANSACTION_MAX_NUM_WRITES,
                ),
            ),
        );
        anyhow::ensure!(
            self.size <= *TRANSACTION_MAX_WRITE_SIZE_BYTES,
            ErrorMetadata::pagination_limit(
                "TooManyBytesWritten",
                format!(
                    "Too many bytes written in a single transaction (limit: {} bytes)",
                    *TRANSACTION_MAX_WRITE_SIZE_BYTES,
                ),
            ),
        );

        if let Some(existing) = self.updates.get_mut(&document_id) {
            let (old_document, old_document_ts) = old_document.unzip();
            anyhow::ensure!(
                existing.new_document == old_document,
                "Inconsistent update: the caller's observed revision does not match the \
                 previously written one",
            );
            anyhow::ensure!(
                matches!(old_document_ts, None | Some(WriteTimestamp::Pending)),
                "Inconsistent update: rewriting an id written in this transaction requires a \
                 pending timestamp, got {old_document_ts:?}",
            );
            existing.new_document = new_document;
        } else {
            let old_document = match old_document {
                Some((d, WriteTimestamp::Committed(ts))) => Some((d, ts)),
                Some((_, WriteTimestamp::Pending)) => anyhow::bail!(
                    "Old revision has a pending timestamp but no pending write exists for \
                     {document_id}"
                ),
                None => None,
            };
            self.updates.insert(
                document_id.clone(),
                DocumentUpdateWithPrevTs {
                    id: document_id,
                    old_document,
                    new_document,
                },
            );
        }
        Ok(())
    }

    /// A new id takes a read dependency on its own `by_id` entry: the
    /// committer checks the id never existed before the begin timestamp, and
    /// this dependency makes a parallel commit creating the same id a
    /// conflict.
    fn register_new_id(reads: &mut TransactionReadSet, document_id: &DocumentId) {
        reads.record_indexed_derived(
            IndexName::by_id(document_id.table().clone()),
            IndexedFields::by_id(),
            Interval::prefix(Vec::from(document_id.index_key_bytes().0).into()),
        );
    }

    /// Iterate the coalesced writes; no document id appears twice.
    pub fn coalesced_writes(&self) -> impl Iterator<Item = (&DocumentId, &DocumentUpdateWithPrevTs)> {
        self.updates.iter()
    }

    pub fn into_updates(self) -> OrdMap<DocumentId, DocumentUpdateWithPrevTs> {
        self.updates
    }
}

impl Default for Writes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use common::{
        assert_obj,
        document::InternalId,
        types::IndexDescriptor,
    };

    use super::*;

    fn registry() -> IndexRegistry {
        let mut registry = IndexRegistry::new();
        registry.register_table("items".parse().unwrap()).unwrap();
        registry
            .register_index(
                "items".parse().unwrap(),
                IndexDescriptor::new("by_qty").unwrap(),
                vec!["qty".parse().unwrap()].try_into().unwrap(),
            )
            .unwrap();
        registry
    }

    fn doc(id_byte: u8, qty: i64) -> Document {
        let id = DocumentId::new("items".parse().unwrap(), InternalId([id_byte; 16]));
        Document::new(id, assert_obj!("qty" => qty)).unwrap()
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = registry();
        let mut writes = Writes::new();
        let mut reads = TransactionReadSet::new();
        let d = doc(1, 5);
        writes
            .update(&registry, &mut reads, d.id().clone(), None, Some(d.clone()))
            .unwrap();
        let err = writes
            .update(&registry, &mut reads, d.id().clone(), None, Some(d.clone()))
            .unwrap_err();
        assert_eq!(
            common::errors::ErrorMetadataAnyhowExt::short_msg(&err),
            Some("InvalidWrite")
        );
    }

    #[test]
    fn test_unknown_table_is_schema_error() {
        let registry = registry();
        let mut writes = Writes::new();
        let mut reads = TransactionReadSet::new();
        let id = DocumentId::new("missing".parse().unwrap(), InternalId([1; 16]));
        let d = Document::new(id.clone(), assert_obj!("qty" => 1)).unwrap();
        let err = writes
            .update(&registry, &mut reads, id, None, Some(d))
            .unwrap_err();
        assert_eq!(
            common::errors::ErrorMetadataAnyhowExt::short_msg(&err),
            Some("SchemaError")
        );
    }

    #[test]
    fn test_updates_coalesce() -> anyhow::Result<()> {
        let registry = registry();
        let mut writes = Writes::new();
        let mut reads = TransactionReadSet::new();
        let original = doc(1, 5);
        let rewritten = doc(1, 6);
        writes.update(
            &registry,
            &mut reads,
            original.id().clone(),
            None,
            Some(original.clone()),
        )?;
        writes.update(
            &registry,
            &mut reads,
            original.id().clone(),
            Some((original.clone(), WriteTimestamp::Pending)),
            Some(rewritten.clone()),
        )?;
        assert_eq!(writes.len(), 1);
        let (_, update) = writes.coalesced_writes().next().unwrap();
        assert_eq!(update.old_document, None);
        assert_eq!(update.new_document, Some(rewritten));
        Ok(())
    }

    #[test]
    fn test_insert_registers_id_read_dependency() -> anyhow::Result<()> {
        let registry = registry();
        let mut writes = Writes::new();
        let mut reads = TransactionReadSet::new();
        let d = doc(1, 5);
        writes.update(&registry, &mut reads, d.id().clone(), None, Some(d.clone()))?;
        // A parallel commit writing the same id must overlap our read set.
        assert!(reads.read_set().overlaps(&d).is_some());
        Ok(())
    }

    #[test]
    fn test_replace_retains_prev_ts() -> anyhow::Result<()> {
        let registry = registry();
        let mut writes = Writes::new();
        let mut reads = TransactionReadSet::new();
        let old = doc(2, 5);
        let new = doc(2, 50);
        writes.update(
            &registry,
            &mut reads,
            old.id().clone(),
            Some((old.clone(), WriteTimestamp::Committed(Timestamp::must(123)))),
            Some(new),
        )?;
        let (_, update) = writes.coalesced_writes().next().unwrap();
        assert_eq!(
            update.old_document.as_ref().map(|(_, ts)| *ts),
            Some(Timestamp::must(123))
        );
        Ok(())
    }
}
