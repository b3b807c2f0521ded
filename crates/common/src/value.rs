//! Self-describing structured values and their order-preserving byte
//! encoding.
//!
//! Values sort by type first (in variant order), then by payload. The
//! encoding in [`Value::write_sort_key`] produces byte strings whose
//! lexicographic order matches [`Value`]'s `Ord`, which is what makes index
//! keys comparable as raw bytes.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    str::FromStr,
};

/// Tag bytes for the sort-key encoding. `0x00` is reserved for escape
/// sequences and `0x01` for composite terminators, so every tag must be
/// `>= 0x02` for terminators to sort below any following element.
const TAG_UNDEFINED: u8 = 0x02;
const TAG_NULL: u8 = 0x03;
const TAG_INT64: u8 = 0x04;
const TAG_FLOAT64: u8 = 0x05;
const TAG_BOOLEAN: u8 = 0x06;
const TAG_STRING: u8 = 0x07;
const TAG_BYTES: u8 = 0x08;
const TAG_ARRAY: u8 = 0x09;
const TAG_OBJECT: u8 = 0x0A;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

const MAX_OBJECT_FIELDS: usize = 1024;

#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Object),
}

impl Value {
    /// Approximate in-memory and on-wire size, used for transaction limits
    /// and cache accounting.
    pub fn size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Int64(_) | Value::Float64(_) => 9,
            Value::Boolean(_) => 2,
            Value::String(s) => 1 + s.len(),
            Value::Bytes(b) => 1 + b.len(),
            Value::Array(values) => 2 + values.iter().map(Value::size).sum::<usize>(),
            Value::Object(o) => o.size(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Int64(_) => TAG_INT64,
            Value::Float64(_) => TAG_FLOAT64,
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::String(_) => TAG_STRING,
            Value::Bytes(_) => TAG_BYTES,
            Value::Array(_) => TAG_ARRAY,
            Value::Object(_) => TAG_OBJECT,
        }
    }

    /// Append the order-preserving encoding of `self` to `out`.
    pub fn write_sort_key(&self, out: &mut Vec<u8>) {
        out.push(self.type_rank());
        match self {
            Value::Null => {},
            Value::Int64(i) => {
                // Flip the sign bit so negative values sort below positive.
                out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            },
            Value::Float64(f) => {
                out.extend_from_slice(&total_order_f64(*f).to_be_bytes());
            },
            Value::Boolean(b) => out.push(*b as u8),
            Value::String(s) => write_escaped(s.as_bytes(), out),
            Value::Bytes(b) => write_escaped(b, out),
            Value::Array(values) => {
                for value in values {
                    value.write_sort_key(out);
                }
                out.push(TERMINATOR);
            },
            Value::Object(o) => {
                for (field, value) in o.iter() {
                    write_escaped(field.as_ref().as_bytes(), out);
                    value.write_sort_key(out);
                }
                out.push(TERMINATOR);
            },
        }
    }

    /// Encoding of a value that may be missing, e.g. an indexed field absent
    /// from a document. `None` sorts below every present value.
    pub fn write_optional_sort_key(value: Option<&Value>, out: &mut Vec<u8>) {
        match value {
            None => out.push(TAG_UNDEFINED),
            Some(v) => v.write_sort_key(out),
        }
    }
}

/// `f64` bits remapped so unsigned comparison matches IEEE total order.
fn total_order_f64(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

/// Escaped, terminated byte-string encoding: `0x00` becomes `0x00 0xFF` and
/// the string ends with `0x00 0x01`, so shorter strings sort before their
/// extensions and no encoding is a prefix of another.
fn write_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(v)
    }
}

/// A validated document field name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldName(String);

impl FromStr for FieldName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !s.is_empty()
                && s.len() <= 64
                && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "Invalid field name: {s}"
        );
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FieldName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A document body: an ordered map of validated field names to values.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Object(BTreeMap<FieldName, Value>);

impl Object {
    pub fn get(&self, field: &FieldName) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn size(&self) -> usize {
        2 + self
            .0
            .iter()
            .map(|(field, value)| field.as_ref().len() + value.size())
            .sum::<usize>()
    }
}

impl TryFrom<BTreeMap<FieldName, Value>> for Object {
    type Error = anyhow::Error;

    fn try_from(fields: BTreeMap<FieldName, Value>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            fields.len() <= MAX_OBJECT_FIELDS,
            "Object has too many fields ({} > {MAX_OBJECT_FIELDS})",
            fields.len()
        );
        Ok(Self(fields))
    }
}

/// Construct a [`Value`] from a literal, panicking on invalid input.
#[macro_export]
macro_rules! val {
    (null) => {
        $crate::value::Value::Null
    };
    ($v:expr) => {
        $crate::value::Value::from($v)
    };
}

/// Construct an [`Object`] from field/value literals, panicking on invalid
/// input. Test and bootstrap use only.
#[macro_export]
macro_rules! assert_obj {
    ($($field:expr => $value:expr),* $(,)?) => {{
        let mut fields = ::std::collections::BTreeMap::new();
        $(
            fields.insert(
                $field.parse::<$crate::value::FieldName>().unwrap(),
                $crate::val!($value),
            );
        )*
        $crate::value::Object::try_from(fields).unwrap()
    }};
}

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for FieldName {
        type Parameters = ();
        type Strategy = BoxedStrategy<FieldName>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            "[a-z][a-z0-9_]{0,7}"
                .prop_map(|s| s.parse().unwrap())
                .boxed()
        }
    }

    impl Arbitrary for Value {
        type Parameters = ();
        type Strategy = BoxedStrategy<Value>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<i64>().prop_map(Value::Int64),
                any::<f64>().prop_map(Value::Float64),
                any::<bool>().prop_map(Value::Boolean),
                ".{0,8}".prop_map(Value::String),
                prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
            ];
            leaf.prop_recursive(2, 16, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map(any::<FieldName>(), inner, 0..4)
                        .prop_map(|m| Value::Object(Object::try_from(m).unwrap())),
                ]
            })
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sort_key(v: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        v.write_sort_key(&mut out);
        out
    }

    #[test]
    fn test_type_order() {
        let values = [
            Value::Null,
            val!(-1),
            val!(1.5),
            val!(false),
            val!("a"),
            Value::Bytes(vec![1]),
            Value::Array(vec![]),
            Value::Object(Object::default()),
        ];
        for window in values.windows(2) {
            assert!(window[0] < window[1], "{:?} >= {:?}", window[0], window[1]);
            assert!(sort_key(&window[0]) < sort_key(&window[1]));
        }
    }

    #[test]
    fn test_string_prefix_order() {
        // A string ending in NUL must sort between its prefix and the next
        // sibling, and the encoding must agree.
        let a = val!("a");
        let a_nul = Value::String("a\0".to_owned());
        let ab = val!("ab");
        assert!(a < a_nul && a_nul < ab);
        assert!(sort_key(&a) < sort_key(&a_nul));
        assert!(sort_key(&a_nul) < sort_key(&ab));
    }

    #[test]
    fn test_array_prefix_order() {
        let one = Value::Array(vec![val!(1)]);
        let one_two = Value::Array(vec![val!(1), val!(2)]);
        assert!(sort_key(&one) < sort_key(&one_two));
    }

    #[test]
    fn test_undefined_sorts_first() {
        let mut undefined = Vec::new();
        Value::write_optional_sort_key(None, &mut undefined);
        assert!(undefined < sort_key(&Value::Null));
    }

    #[test]
    fn test_assert_obj() {
        let o = assert_obj!("qty" => 5, "name" => "socks");
        assert_eq!(o.get(&"qty".parse().unwrap()), Some(&val!(5)));
        assert_eq!(o.len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 512, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_sort_key_preserves_order(a in any::<Value>(), b in any::<Value>()) {
            prop_assert_eq!(a.cmp(&b), sort_key(&a).cmp(&sort_key(&b)));
        }

        #[test]
        fn proptest_sort_key_prefix_free(a in any::<Value>(), b in any::<Value>()) {
            let (ka, kb) = (sort_key(&a), sort_key(&b));
            if a != b {
                prop_assert!(!ka.starts_with(&kb) && !kb.starts_with(&ka));
            }
        }
    }
}
