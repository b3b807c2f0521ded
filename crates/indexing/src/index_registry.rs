use std::collections::BTreeMap;

use common::{
    document::Document,
    errors::ErrorMetadata,
    index::IndexKeyBytes,
    types::{
        IndexDescriptor,
        IndexName,
        IndexedFields,
        TableName,
    },
};

/// Metadata for one registered index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Index {
    pub name: IndexName,
    pub fields: IndexedFields,
}

/// The set of tables and their indexes. Every registered table has a primary
/// `by_id` index; secondary indexes are keyed on document fields. The
/// registry is fixed at database construction: schema evolution is managed a
/// layer above this crate.
#[derive(Clone, Debug, Default)]
pub struct IndexRegistry {
    indexes: BTreeMap<IndexName, Index>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, creating its primary index.
    pub fn register_table(&mut self, table: TableName) -> anyhow::Result<()> {
        let by_id = IndexName::by_id(table);
        anyhow::ensure!(
            !self.indexes.contains_key(&by_id),
            "Table {} already registered",
            by_id.table(),
        );
        self.indexes.insert(
            by_id.clone(),
            Index {
                name: by_id,
                fields: IndexedFields::by_id(),
            },
        );
        Ok(())
    }

    /// Register a secondary index on an already registered table.
    pub fn register_index(
        &mut self,
        table: TableName,
        descriptor: IndexDescriptor,
        fields: IndexedFields,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.table_exists(&table),
            "Cannot index unregistered table {table}",
        );
        let name = IndexName::new(table, descriptor);
        anyhow::ensure!(!name.is_by_id(), "by_id is reserved for the primary index");
        anyhow::ensure!(
            !self.indexes.contains_key(&name),
            "Index {name} already registered",
        );
        anyhow::ensure!(!fields.is_empty(), "Secondary index {name} must have fields");
        self.indexes.insert(name.clone(), Index { name, fields });
        Ok(())
    }

    pub fn table_exists(&self, table: &TableName) -> bool {
        self.indexes.contains_key(&IndexName::by_id(table.clone()))
    }

    pub fn require_table(&self, table: &TableName) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.table_exists(table),
            ErrorMetadata::schema_error(format!("Table {table} is not registered")),
        );
        Ok(())
    }

    pub fn require_enabled(&self, name: &IndexName) -> anyhow::Result<&Index> {
        self.indexes.get(name).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::bad_request(
                "IndexNotFound",
                format!("Index {name} does not exist"),
            ))
        })
    }

    pub fn indexes_for_table<'a>(
        &'a self,
        table: &'a TableName,
    ) -> impl Iterator<Item = &'a Index> + 'a {
        self.indexes
            .values()
            .filter(move |index| index.name.table() == table)
    }

    pub fn all_indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.values()
    }

    /// The index mutations produced by one document's change: for each index
    /// on the document's table, one old-key delete (if the document existed)
    /// and one new-key insert (if it still does). An unchanged key collapses
    /// to a single insert.
    pub fn index_updates(
        &self,
        old_document: Option<&Document>,
        new_document: Option<&Document>,
    ) -> Vec<IndexUpdate> {
        let table = match (old_document, new_document) {
            (Some(old), _) => old.id().table(),
            (None, Some(new)) => new.id().table(),
            (None, None) => return Vec::new(),
        };
        let mut updates = Vec::new();
        for index in self.indexes_for_table(table) {
            let old_key = old_document.map(|d| d.index_key(&index.fields).to_bytes());
            let new_key = new_document.map(|d| d.index_key(&index.fields).to_bytes());
            match (old_key, new_key) {
                (Some(old_key), Some(new_key)) if old_key == new_key => {
                    updates.push(IndexUpdate {
                        index_name: index.name.clone(),
                        key: new_key,
                        value: IndexValue::Document(
                            new_document.expect("new key requires new document").clone(),
                        ),
                    });
                },
                (old_key, new_key) => {
                    if let Some(old_key) = old_key {
                        updates.push(IndexUpdate {
                            index_name: index.name.clone(),
                            key: old_key,
                            value: IndexValue::Deleted,
                        });
                    }
                    if let Some(new_key) = new_key {
                        updates.push(IndexUpdate {
                            index_name: index.name.clone(),
                            key: new_key,
                            value: IndexValue::Document(
                                new_document.expect("new key requires new document").clone(),
                            ),
                        });
                    }
                },
            }
        }
        updates
    }
}

/// One mutation of one index entry.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexUpdate {
    pub index_name: IndexName,
    pub key: IndexKeyBytes,
    pub value: IndexValue,
}

/// In-memory indexes are clustered: inserts carry the full document.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexValue {
    Deleted,
    Document(Document),
}
