//! Order-preserving tuple encoding for KV keys.
//!
//! Keys are built from typed tuples packed into a self-describing byte form
//! whose lexicographic order matches the tuple's element-wise order. Integers
//! are encoded big-endian behind a length tag, so numerically larger values
//! always compare greater; bytes and strings are null-escaped and terminated.
//! This is what makes range scans over a subspace equivalent to ordered
//! iteration over the tuple space.

mod subspace;

pub use subspace::Subspace;

use uuid::Uuid;

use crate::error::{Error, Result};

// Type codes. Chosen so that encoded elements sort by type first, then value:
// bytes < strings < integers < uuids.
const BYTES_CODE: u8 = 0x01;
const STRING_CODE: u8 = 0x02;
const INT_ZERO_CODE: u8 = 0x14;
const UUID_CODE: u8 = 0x30;

/// One element of a key tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
    Uuid(Uuid),
}

impl Element {
    fn pack_into(&self, out: &mut Vec<u8>) {
        match self {
            Element::Bytes(b) => {
                out.push(BYTES_CODE);
                escape_into(b, out);
            }
            Element::Str(s) => {
                out.push(STRING_CODE);
                escape_into(s.as_bytes(), out);
            }
            Element::Int(v) => pack_int(*v, out),
            Element::Uuid(u) => {
                out.push(UUID_CODE);
                out.extend_from_slice(u.as_bytes());
            }
        }
    }
}

/// Escape 0x00 as 0x00 0xFF and terminate with a bare 0x00, preserving order.
fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        out.push(b);
        if b == 0 {
            out.push(0xFF);
        }
    }
    out.push(0);
}

fn minimal_bytes(v: u64) -> usize {
    ((64 - v.leading_zeros() as usize) + 7) / 8
}

fn pack_int(v: i64, out: &mut Vec<u8>) {
    if v == 0 {
        out.push(INT_ZERO_CODE);
    } else if v > 0 {
        let n = minimal_bytes(v as u64);
        out.push(INT_ZERO_CODE + n as u8);
        out.extend_from_slice(&(v as u64).to_be_bytes()[8 - n..]);
    } else {
        // Negative values are offset by 2^(8n) - 1 so that big-endian byte
        // order still matches numeric order within the same width.
        let n = minimal_bytes(v.unsigned_abs());
        let max = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        let enc = (max as i128 + v as i128) as u64;
        out.push(INT_ZERO_CODE - n as u8);
        out.extend_from_slice(&enc.to_be_bytes()[8 - n..]);
    }
}

/// A typed key tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tuple {
    elements: Vec<Element>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    pub fn push_bytes(mut self, b: impl Into<Vec<u8>>) -> Self {
        self.elements.push(Element::Bytes(b.into()));
        self
    }

    pub fn push_str(mut self, s: impl Into<String>) -> Self {
        self.elements.push(Element::Str(s.into()));
        self
    }

    pub fn push_int(mut self, v: i64) -> Self {
        self.elements.push(Element::Int(v));
        self
    }

    pub fn push_uuid(mut self, u: Uuid) -> Self {
        self.elements.push(Element::Uuid(u));
        self
    }

    /// Append all elements of `other`.
    pub fn concat(mut self, other: &Tuple) -> Self {
        self.elements.extend(other.elements.iter().cloned());
        self
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn get(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    pub fn get_int(&self, index: usize) -> Result<i64> {
        match self.elements.get(index) {
            Some(Element::Int(v)) => Ok(*v),
            other => Err(Error::Corruption(format!(
                "expected integer at tuple index {index}, found {other:?}"
            ))),
        }
    }

    pub fn get_str(&self, index: usize) -> Result<&str> {
        match self.elements.get(index) {
            Some(Element::Str(s)) => Ok(s),
            other => Err(Error::Corruption(format!(
                "expected string at tuple index {index}, found {other:?}"
            ))),
        }
    }

    pub fn get_uuid(&self, index: usize) -> Result<Uuid> {
        match self.elements.get(index) {
            Some(Element::Uuid(u)) => Ok(*u),
            other => Err(Error::Corruption(format!(
                "expected uuid at tuple index {index}, found {other:?}"
            ))),
        }
    }

    /// Tuple containing elements `0..n`.
    pub fn prefix(&self, n: usize) -> Tuple {
        Tuple {
            elements: self.elements[..n.min(self.elements.len())].to_vec(),
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.elements.len() * 9);
        self.pack_into(&mut out);
        out
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        for element in &self.elements {
            element.pack_into(out);
        }
    }

    pub fn unpack(mut data: &[u8]) -> Result<Tuple> {
        let mut elements = Vec::new();
        while !data.is_empty() {
            let (element, rest) = unpack_element(data)?;
            elements.push(element);
            data = rest;
        }
        Ok(Tuple { elements })
    }
}

fn unpack_element(data: &[u8]) -> Result<(Element, &[u8])> {
    let code = data[0];
    let rest = &data[1..];
    match code {
        BYTES_CODE => {
            let (bytes, rest) = unescape(rest)?;
            Ok((Element::Bytes(bytes), rest))
        }
        STRING_CODE => {
            let (bytes, rest) = unescape(rest)?;
            let s = String::from_utf8(bytes)
                .map_err(|e| Error::Corruption(format!("invalid utf-8 in tuple string: {e}")))?;
            Ok((Element::Str(s), rest))
        }
        UUID_CODE => {
            if rest.len() < 16 {
                return Err(Error::Corruption("truncated uuid in tuple".into()));
            }
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&rest[..16]);
            Ok((Element::Uuid(Uuid::from_bytes(raw)), &rest[16..]))
        }
        code if (INT_ZERO_CODE - 8..=INT_ZERO_CODE + 8).contains(&code) => {
            let (v, rest) = unpack_int(code, rest)?;
            Ok((Element::Int(v), rest))
        }
        other => Err(Error::Corruption(format!(
            "unknown tuple type code {other:#04x}"
        ))),
    }
}

fn unpack_int(code: u8, data: &[u8]) -> Result<(i64, &[u8])> {
    if code == INT_ZERO_CODE {
        return Ok((0, data));
    }
    let positive = code > INT_ZERO_CODE;
    let n = if positive {
        (code - INT_ZERO_CODE) as usize
    } else {
        (INT_ZERO_CODE - code) as usize
    };
    if data.len() < n {
        return Err(Error::Corruption("truncated integer in tuple".into()));
    }
    let mut raw = [0u8; 8];
    raw[8 - n..].copy_from_slice(&data[..n]);
    let magnitude = u64::from_be_bytes(raw);
    let value = if positive {
        magnitude as i64
    } else {
        let max = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        (magnitude as i128 - max as i128) as i64
    };
    Ok((value, &data[n..]))
}

fn unescape(data: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0 {
            if i + 1 < data.len() && data[i + 1] == 0xFF {
                out.push(0);
                i += 2;
            } else {
                return Ok((out, &data[i + 1..]));
            }
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    Err(Error::Corruption("unterminated byte string in tuple".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        for v in [
            0i64,
            1,
            -1,
            255,
            256,
            -255,
            -256,
            65_535,
            -65_536,
            1_623,
            i64::MAX,
            i64::MIN + 1,
            i64::MIN,
        ] {
            let packed = Tuple::new().push_int(v).pack();
            let unpacked = Tuple::unpack(&packed).unwrap();
            assert_eq!(unpacked.get_int(0).unwrap(), v, "roundtrip of {v}");
        }
    }

    #[test]
    fn test_int_order_matches_byte_order() {
        let values = [
            i64::MIN,
            -1_000_000,
            -65_536,
            -256,
            -2,
            -1,
            0,
            1,
            2,
            255,
            256,
            1_623,
            1_624,
            1_000_000,
            i64::MAX,
        ];
        for pair in values.windows(2) {
            let a = Tuple::new().push_int(pair[0]).pack();
            let b = Tuple::new().push_int(pair[1]).pack();
            assert!(a < b, "{} should pack before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_string_escaping() {
        let s = "doc\0name";
        let packed = Tuple::new().push_str(s).push_int(7).pack();
        let unpacked = Tuple::unpack(&packed).unwrap();
        assert_eq!(unpacked.get_str(0).unwrap(), s);
        assert_eq!(unpacked.get_int(1).unwrap(), 7);
    }

    #[test]
    fn test_bytes_order() {
        let a = Tuple::new().push_bytes(vec![0u8, 1]).pack();
        let b = Tuple::new().push_bytes(vec![0u8, 2]).pack();
        let c = Tuple::new().push_bytes(vec![1u8]).pack();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_mixed_tuple_roundtrip() {
        let uuid = Uuid::new_v4();
        let tuple = Tuple::new()
            .push_str("_0")
            .push_int(42)
            .push_bytes(vec![1, 2, 3])
            .push_uuid(uuid);
        let unpacked = Tuple::unpack(&tuple.pack()).unwrap();
        assert_eq!(unpacked, tuple);
        assert_eq!(unpacked.get_uuid(3).unwrap(), uuid);
    }

    #[test]
    fn test_prefix_ordering_with_suffix() {
        // A tuple is always a strict prefix of any of its extensions.
        let base = Tuple::new().push_int(10);
        let extended = Tuple::new().push_int(10).push_int(0);
        let packed_base = base.pack();
        let packed_extended = extended.pack();
        assert!(packed_extended.starts_with(&packed_base));
        assert!(packed_base < packed_extended);
    }
}
