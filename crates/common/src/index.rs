use std::{
    borrow::Borrow,
    fmt,
    ops::Deref,
};

use crate::{
    document::InternalId,
    value::Value,
};

/// The logical key of a document in one index: the values of the indexed
/// fields, in index order, followed by the document's internal id as a
/// tiebreaker. The id suffix makes every index key unique, so secondary
/// indexes need no separate uniqueness handling.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct IndexKey {
    values: Vec<Option<Value>>,
    id: InternalId,
}

impl IndexKey {
    pub fn new(values: Vec<Value>, id: InternalId) -> Self {
        Self::new_allow_missing(values.into_iter().map(Some).collect(), id)
    }

    pub fn new_allow_missing(values: Vec<Option<Value>>, id: InternalId) -> Self {
        Self { values, id }
    }

    /// The order-preserving byte encoding. Lexicographic order of the bytes
    /// matches `IndexKey`'s `Ord`.
    pub fn to_bytes(&self) -> IndexKeyBytes {
        let mut out = Vec::with_capacity(32);
        for value in &self.values {
            Value::write_optional_sort_key(value.as_ref(), &mut out);
        }
        out.extend_from_slice(&self.id.0);
        IndexKeyBytes(out)
    }
}

/// An encoded index key. Compares bytewise.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IndexKeyBytes(pub Vec<u8>);

impl Deref for IndexKeyBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Borrow<[u8]> for IndexKeyBytes {
    fn borrow(&self) -> &[u8] {
        &self.0[..]
    }
}

impl fmt::Display for IndexKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
