use std::fmt;

use crate::{
    index::{
        IndexKey,
        IndexKeyBytes,
    },
    types::{
        IndexedFields,
        TableName,
    },
    value::Object,
};

/// Globally unique, immutable document identity. The table tag is part of
/// the id: two tables never share a document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InternalId(pub [u8; 16]);

impl InternalId {
    pub const MAX: InternalId = InternalId([u8::MAX; 16]);
    pub const MIN: InternalId = InternalId([0; 16]);
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DocumentId {
    table: TableName,
    internal_id: InternalId,
}

impl DocumentId {
    pub fn new(table: TableName, internal_id: InternalId) -> Self {
        Self { table, internal_id }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn internal_id(&self) -> InternalId {
        self.internal_id
    }

    /// Key of this document in its table's primary `by_id` index.
    pub fn index_key(&self) -> IndexKey {
        IndexKey::new(vec![], self.internal_id)
    }

    pub fn index_key_bytes(&self) -> IndexKeyBytes {
        self.index_key().to_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.table, self.internal_id)
    }
}

/// A single revision of a document. The commit timestamp of the revision is
/// tracked by the structure holding it (index entry, log entry), not here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Document {
    id: DocumentId,
    value: Object,
}

impl Document {
    pub fn new(id: DocumentId, value: Object) -> anyhow::Result<Self> {
        let size = value.size();
        anyhow::ensure!(
            size <= *crate::knobs::MAX_DOCUMENT_SIZE_BYTES,
            crate::errors::ErrorMetadata::bad_request(
                "DocumentTooLarge",
                format!(
                    "Document is {size} bytes (limit: {} bytes)",
                    *crate::knobs::MAX_DOCUMENT_SIZE_BYTES
                ),
            )
        );
        Ok(Self { id, value })
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn value(&self) -> &Object {
        &self.value
    }

    pub fn size(&self) -> usize {
        self.value.size() + 16
    }

    /// This document's key in an index over `fields`. Missing fields encode
    /// as undefined and sort first.
    pub fn index_key(&self, fields: &IndexedFields) -> IndexKey {
        let values = fields
            .iter()
            .map(|field| self.value.get(field).cloned())
            .collect();
        IndexKey::new_allow_missing(values, self.id.internal_id())
    }
}

/// One document's change within a commit: the prior revision (if any) and
/// the new revision. `new_document: None` is the tombstone.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentUpdate {
    pub id: DocumentId,
    pub old_document: Option<Document>,
    pub new_document: Option<Document>,
}

impl DocumentUpdate {
    pub fn size(&self) -> usize {
        self.old_document.as_ref().map_or(0, Document::size)
            + self.new_document.as_ref().map_or(0, Document::size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_obj;

    fn id(table: &str, byte: u8) -> DocumentId {
        DocumentId::new(table.parse().unwrap(), InternalId([byte; 16]))
    }

    #[test]
    fn test_by_id_key_orders_by_internal_id() {
        let a = id("items", 1).index_key_bytes();
        let b = id("items", 2).index_key_bytes();
        assert!(a < b);
    }

    #[test]
    fn test_index_key_missing_field_sorts_first() -> anyhow::Result<()> {
        let fields: IndexedFields = vec!["qty".parse()?].try_into()?;
        let with_field = Document::new(id("items", 1), assert_obj!("qty" => 1))?;
        let without_field = Document::new(id("items", 1), assert_obj!("name" => "x"))?;
        assert!(
            without_field.index_key(&fields).to_bytes() < with_field.index_key(&fields).to_bytes()
        );
        Ok(())
    }
}
