use std::ops::{
    Deref,
    DerefMut,
};

use crate::index::IndexKeyBytes;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BinaryKey {
    key: Vec<u8>,
}

impl From<IndexKeyBytes> for BinaryKey {
    fn from(key: IndexKeyBytes) -> Self {
        key.0.into()
    }
}

impl From<Vec<u8>> for BinaryKey {
    fn from(key: Vec<u8>) -> Self {
        Self { key }
    }
}

impl From<BinaryKey> for Vec<u8> {
    fn from(b: BinaryKey) -> Self {
        b.key
    }
}

impl Deref for BinaryKey {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.key[..]
    }
}

impl DerefMut for BinaryKey {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.key[..]
    }
}

impl BinaryKey {
    pub const fn min() -> Self {
        Self { key: Vec::new() }
    }

    /// For any key `k`, `increment(k)` is the minimum key such that every
    /// key prefixed by `k` is less than `increment(k)`. Returns `None` when
    /// no such key exists (all bytes are 0xFF).
    pub fn increment(&self) -> Option<Self> {
        let mut incremented = self.clone();
        while let Some(byte) = incremented.key.last_mut() {
            if *byte < u8::MAX {
                *byte += 1;
                return Some(incremented);
            }
            incremented.key.pop();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::BinaryKey;

    proptest! {
        #![proptest_config(ProptestConfig { cases: 512, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn test_increment_bounds_extensions(
            key in prop::collection::vec(any::<u8>(), 0..4),
            mut suffix in prop::collection::vec(any::<u8>(), 0..=2),
        ) {
            let key = BinaryKey::from(key);
            if let Some(incr) = key.increment() {
                let mut with_suffix = key.key.clone();
                with_suffix.append(&mut suffix);
                prop_assert!(incr > BinaryKey::from(with_suffix));
            } else {
                prop_assert!(key.iter().all(|b| *b == u8::MAX));
            }
        }

        #[test]
        fn test_increment_is_minimal(
            key in prop::collection::vec(any::<u8>(), 0..=2),
            other in prop::collection::vec(any::<u8>(), 0..=2),
        ) {
            let key = BinaryKey::from(key);
            let other = BinaryKey::from(other);
            if let Some(incr) = key.increment() {
                if key < other && other < incr {
                    prop_assert!(other.starts_with(&key));
                }
            }
        }
    }

    #[test]
    fn test_increment_samples() {
        let key: BinaryKey = vec![5, 6].into();
        assert_eq!(key.increment(), Some(vec![5, 7].into()));
        let key: BinaryKey = vec![5, 255, 255].into();
        assert_eq!(key.increment(), Some(vec![6].into()));
        let key: BinaryKey = vec![255, 255, 255].into();
        assert_eq!(key.increment(), None);
        let key: BinaryKey = vec![].into();
        assert_eq!(key.increment(), None);
    }
}
