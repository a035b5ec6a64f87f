//! Binary formats for segment files.
//!
//! Postings file (`<segment>.pst`):
//!   magic, num_docs, num_fields,
//!   per field: field id, num_terms,
//!     per term: len-prefixed term bytes, doc count, doc ids (u32 LE)
//!
//! Liveness file (`<segment>_<gen>.liv`): doc count + bitmap, bit set = live.
//! Written only once a segment has deletions; each rewrite bumps the
//! generation because virtual files are immutable.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const PST_MAGIC: u32 = 0x5053_5431; // "PST1"
const LIV_MAGIC: u32 = 0x4C49_5631; // "LIV1"

/// term -> sorted doc ids, per field id.
pub type PostingsMap = BTreeMap<u32, BTreeMap<String, Vec<u32>>>;

pub fn postings_file_name(segment: &str) -> String {
    format!("{segment}.pst")
}

pub fn liveness_file_name(segment: &str, generation: u32) -> String {
    format!("{segment}_{generation}.liv")
}

pub fn encode_postings(num_docs: u32, postings: &PostingsMap) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(PST_MAGIC)?;
    buf.write_u32::<LittleEndian>(num_docs)?;
    buf.write_u32::<LittleEndian>(postings.len() as u32)?;
    for (field_id, terms) in postings {
        buf.write_u32::<LittleEndian>(*field_id)?;
        buf.write_u32::<LittleEndian>(terms.len() as u32)?;
        for (term, doc_ids) in terms {
            let bytes = term.as_bytes();
            buf.write_u16::<LittleEndian>(bytes.len() as u16)?;
            buf.extend_from_slice(bytes);
            buf.write_u32::<LittleEndian>(doc_ids.len() as u32)?;
            for doc_id in doc_ids {
                buf.write_u32::<LittleEndian>(*doc_id)?;
            }
        }
    }
    Ok(buf)
}

pub fn decode_postings(data: &[u8]) -> Result<(u32, PostingsMap)> {
    let mut reader = Cursor::new(data);
    if reader.read_u32::<LittleEndian>()? != PST_MAGIC {
        return Err(Error::Corruption("bad postings magic".into()));
    }
    let num_docs = reader.read_u32::<LittleEndian>()?;
    let num_fields = reader.read_u32::<LittleEndian>()?;
    let mut postings = PostingsMap::new();
    for _ in 0..num_fields {
        let field_id = reader.read_u32::<LittleEndian>()?;
        let num_terms = reader.read_u32::<LittleEndian>()?;
        let mut terms = BTreeMap::new();
        for _ in 0..num_terms {
            let len = reader.read_u16::<LittleEndian>()? as usize;
            let mut term = vec![0u8; len];
            reader.read_exact(&mut term)?;
            let term = String::from_utf8(term)
                .map_err(|e| Error::Corruption(format!("invalid utf-8 term: {e}")))?;
            let count = reader.read_u32::<LittleEndian>()? as usize;
            let mut doc_ids = Vec::with_capacity(count);
            for _ in 0..count {
                doc_ids.push(reader.read_u32::<LittleEndian>()?);
            }
            terms.insert(term, doc_ids);
        }
        postings.insert(field_id, terms);
    }
    Ok((num_docs, postings))
}

/// Encode a liveness bitmap; `live[d]` tells whether doc `d` survives.
pub fn encode_liveness(live: &[bool]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + live.len() / 8 + 1);
    buf.write_u32::<LittleEndian>(LIV_MAGIC)?;
    buf.write_u32::<LittleEndian>(live.len() as u32)?;
    let mut bitmap = vec![0u8; live.len().div_ceil(8)];
    for (doc, &alive) in live.iter().enumerate() {
        if alive {
            bitmap[doc / 8] |= 1 << (doc % 8);
        }
    }
    buf.extend_from_slice(&bitmap);
    Ok(buf)
}

pub fn decode_liveness(data: &[u8]) -> Result<Vec<bool>> {
    let mut reader = Cursor::new(data);
    if reader.read_u32::<LittleEndian>()? != LIV_MAGIC {
        return Err(Error::Corruption("bad liveness magic".into()));
    }
    let num_docs = reader.read_u32::<LittleEndian>()? as usize;
    let bitmap = &data[8..];
    if bitmap.len() < num_docs.div_ceil(8) {
        return Err(Error::Corruption("truncated liveness bitmap".into()));
    }
    Ok((0..num_docs)
        .map(|doc| bitmap[doc / 8] & (1 << (doc % 8)) != 0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postings_roundtrip() {
        let mut postings = PostingsMap::new();
        let mut terms = BTreeMap::new();
        terms.insert("document".to_string(), vec![0, 1]);
        terms.insert("1".to_string(), vec![0]);
        postings.insert(1, terms);

        let encoded = encode_postings(3, &postings).unwrap();
        let (num_docs, decoded) = decode_postings(&encoded).unwrap();
        assert_eq!(num_docs, 3);
        assert_eq!(decoded, postings);
    }

    #[test]
    fn test_liveness_roundtrip() {
        let live = vec![true, false, true, true, false, false, true, true, true];
        let decoded = decode_liveness(&encode_liveness(&live).unwrap()).unwrap();
        assert_eq!(decoded, live);
    }

    #[test]
    fn test_liveness_rejects_garbage() {
        assert!(decode_liveness(&[1, 2, 3]).is_err());
    }
}
