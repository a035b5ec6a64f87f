//! Subspace-based namespace isolation over a flat key space.
//!
//! A subspace is a byte prefix under which all of one component's keys live.
//! Packing a tuple into a subspace prepends the prefix; `range()` brackets
//! every key strictly below the prefix for range reads and clears.

use crate::error::{Error, Result};

use super::Tuple;

/// A namespace within the key-value store, defined by a raw byte prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    raw_prefix: Vec<u8>,
}

impl Subspace {
    /// Create a subspace rooted at the packed form of `prefix`.
    pub fn new(prefix: &Tuple) -> Self {
        Self {
            raw_prefix: prefix.pack(),
        }
    }

    /// Create a subspace from a pre-computed byte prefix.
    pub fn from_bytes(raw_prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            raw_prefix: raw_prefix.into(),
        }
    }

    pub fn raw_prefix(&self) -> &[u8] {
        &self.raw_prefix
    }

    /// Key for `tuple` inside this subspace.
    pub fn pack(&self, tuple: &Tuple) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw_prefix.len() + tuple.len() * 9);
        out.extend_from_slice(&self.raw_prefix);
        tuple.pack_into(&mut out);
        out
    }

    /// Nested subspace rooted at `tuple`.
    pub fn subspace(&self, tuple: &Tuple) -> Subspace {
        Subspace {
            raw_prefix: self.pack(tuple),
        }
    }

    /// `(begin, end)` bracketing every key that extends this prefix.
    ///
    /// All tuple type codes are strictly between 0x00 and 0xFF, so the bare
    /// prefix key itself is excluded.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.raw_prefix.clone();
        begin.push(0x00);
        let mut end = self.raw_prefix.clone();
        end.push(0xFF);
        (begin, end)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.raw_prefix)
    }

    /// Decode the tuple part of `key` below this subspace.
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple> {
        if !self.contains(key) {
            return Err(Error::Corruption(
                "key does not belong to this subspace".into(),
            ));
        }
        Tuple::unpack(&key[self.raw_prefix.len()..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let root = Subspace::new(&Tuple::new().push_str("idx"));
        let key = root.pack(&Tuple::new().push_int(1).push_str("_0"));
        let tuple = root.unpack(&key).unwrap();
        assert_eq!(tuple.get_int(0).unwrap(), 1);
        assert_eq!(tuple.get_str(1).unwrap(), "_0");
    }

    #[test]
    fn test_range_brackets_members_only() {
        let root = Subspace::new(&Tuple::new().push_str("idx"));
        let inner = root.subspace(&Tuple::new().push_int(5));
        let (begin, end) = inner.range();

        let member = inner.pack(&Tuple::new().push_int(0));
        assert!(member > begin && member < end);

        // A sibling subspace must fall outside the range.
        let sibling = root.pack(&Tuple::new().push_int(6));
        assert!(sibling > end || sibling < begin);

        // The bare prefix is excluded.
        assert!(inner.raw_prefix().to_vec() < begin);
    }

    #[test]
    fn test_nested_subspace_equivalence() {
        let root = Subspace::new(&Tuple::new().push_str("idx"));
        let a = root.subspace(&Tuple::new().push_int(1)).pack(&Tuple::new().push_int(2));
        let b = root.pack(&Tuple::new().push_int(1).push_int(2));
        assert_eq!(a, b);
    }
}
