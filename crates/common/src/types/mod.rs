mod timestamp;

use std::{
    fmt,
    str::FromStr,
};

#[cfg(any(test, feature = "testing"))]
pub use self::timestamp::unchecked_repeatable_ts;
pub use self::timestamp::{
    RepeatableReason,
    RepeatableTimestamp,
    Timestamp,
    WriteTimestamp,
};
use crate::value::FieldName;

/// Key of a registered subscriber in the subscription manager's slab.
pub type SubscriberId = usize;

fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Name of a user table. Tables are identified by name; a document's table
/// tag lives in its id.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableName(String);

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(valid_identifier(s), "Invalid table name: {s}");
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The name of an index within its table, e.g. `by_qty`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IndexDescriptor(String);

impl IndexDescriptor {
    pub fn new(s: impl AsRef<str>) -> anyhow::Result<Self> {
        let s = s.as_ref();
        anyhow::ensure!(valid_identifier(s), "Invalid index descriptor: {s}");
        Ok(Self(s.to_owned()))
    }

    pub fn by_id() -> Self {
        Self("by_id".to_owned())
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified index name: table plus descriptor. The primary index of
/// every table is `<table>.by_id`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IndexName {
    table: TableName,
    descriptor: IndexDescriptor,
}

impl IndexName {
    pub fn new(table: TableName, descriptor: IndexDescriptor) -> Self {
        Self { table, descriptor }
    }

    pub fn by_id(table: TableName) -> Self {
        Self {
            table,
            descriptor: IndexDescriptor::by_id(),
        }
    }

    pub fn is_by_id(&self) -> bool {
        self.descriptor.0 == "by_id"
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.descriptor)
    }
}

/// The document fields an index is keyed on, in key order. The primary
/// `by_id` index has no fields: its key is the document id alone.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct IndexedFields(Vec<FieldName>);

impl IndexedFields {
    pub fn by_id() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldName> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<FieldName>> for IndexedFields {
    type Error = anyhow::Error;

    fn try_from(fields: Vec<FieldName>) -> anyhow::Result<Self> {
        anyhow::ensure!(fields.len() <= 16, "Too many indexed fields");
        Ok(Self(fields))
    }
}

/// Scan direction for range reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn apply<T>(self, iter: impl DoubleEndedIterator<Item = T>) -> impl Iterator<Item = T> {
        let (forward, reverse) = match self {
            Order::Asc => (Some(iter), None),
            Order::Desc => (None, Some(iter.rev())),
        };
        forward.into_iter().flatten().chain(reverse.into_iter().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!("items".parse::<TableName>().is_ok());
        assert!("_system".parse::<TableName>().is_ok());
        assert!("".parse::<TableName>().is_err());
        assert!("9lives".parse::<TableName>().is_err());
        assert!("has space".parse::<TableName>().is_err());
        assert!(IndexDescriptor::new("by_qty").is_ok());
        assert!(IndexDescriptor::new("by-qty").is_err());
    }

    #[test]
    fn test_order_apply() {
        let v = vec![1, 2, 3];
        assert_eq!(Order::Asc.apply(v.iter()).collect::<Vec<_>>(), vec![&1, &2, &3]);
        assert_eq!(Order::Desc.apply(v.iter()).collect::<Vec<_>>(), vec![&3, &2, &1]);
    }
}
