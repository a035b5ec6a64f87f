//! Stored-fields codecs.
//!
//! Two interchangeable layouts for a segment's stored (retrievable) fields:
//!
//! - the optimized codec keeps one KV entry per document, so a single
//!   document fetch is one point read and a merge is one range scan
//! - the file codec serializes all records into a `.fld` virtual file with an
//!   offset table, the classic segment-file arrangement
//!
//! Both serialize the same length-delimited record of typed fields.

mod file_store;
mod stored_fields;

pub use file_store::{FileStoredFieldsReader, FileStoredFieldsWriter};
pub use stored_fields::{StoredFieldsReader, StoredFieldsWriter, MAX_PENDING_WRITES};

use std::io::{self, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::directories::KvDirectory;
use crate::dsl::FieldValue;
use crate::error::{Error, Result};

/// Typed per-document record of stored fields, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredFieldsRecord {
    pub fields: Vec<(u32, FieldValue)>,
}

/// Callback invoked for every field of a visited document.
pub trait StoredFieldVisitor {
    fn field(&mut self, field_number: u32, value: &FieldValue);
}

const TAG_I32: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_F32: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_TEXT: u8 = 5;

impl StoredFieldsRecord {
    pub fn push(&mut self, field_number: u32, value: FieldValue) {
        self.fields.push((field_number, value));
    }

    pub fn get(&self, field_number: u32) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| *n == field_number)
            .map(|(_, v)| v)
    }

    pub fn visit(&self, visitor: &mut dyn StoredFieldVisitor) {
        for (number, value) in &self.fields {
            visitor.field(*number, value);
        }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.write_u16::<LittleEndian>(self.fields.len() as u16)?;
        for (number, value) in &self.fields {
            buf.write_u32::<LittleEndian>(*number)?;
            match value {
                FieldValue::I32(v) => {
                    buf.push(TAG_I32);
                    buf.write_i32::<LittleEndian>(*v)?;
                }
                FieldValue::I64(v) => {
                    buf.push(TAG_I64);
                    buf.write_i64::<LittleEndian>(*v)?;
                }
                FieldValue::F32(v) => {
                    buf.push(TAG_F32);
                    buf.write_f32::<LittleEndian>(*v)?;
                }
                FieldValue::F64(v) => {
                    buf.push(TAG_F64);
                    buf.write_f64::<LittleEndian>(*v)?;
                }
                FieldValue::Bytes(b) => {
                    buf.push(TAG_BYTES);
                    buf.write_u32::<LittleEndian>(b.len() as u32)?;
                    buf.extend_from_slice(b);
                }
                FieldValue::Text(s) => {
                    buf.push(TAG_TEXT);
                    let bytes = s.as_bytes();
                    buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
                    buf.extend_from_slice(bytes);
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = data;
        let num_fields = reader.read_u16::<LittleEndian>()? as usize;
        let mut record = StoredFieldsRecord::default();
        for _ in 0..num_fields {
            let number = reader.read_u32::<LittleEndian>()?;
            let tag = reader.read_u8()?;
            let value = match tag {
                TAG_I32 => FieldValue::I32(reader.read_i32::<LittleEndian>()?),
                TAG_I64 => FieldValue::I64(reader.read_i64::<LittleEndian>()?),
                TAG_F32 => FieldValue::F32(reader.read_f32::<LittleEndian>()?),
                TAG_F64 => FieldValue::F64(reader.read_f64::<LittleEndian>()?),
                TAG_BYTES => {
                    let len = reader.read_u32::<LittleEndian>()? as usize;
                    let mut bytes = vec![0u8; len];
                    reader.read_exact(&mut bytes)?;
                    FieldValue::Bytes(bytes)
                }
                TAG_TEXT => {
                    let len = reader.read_u32::<LittleEndian>()? as usize;
                    let mut bytes = vec![0u8; len];
                    reader.read_exact(&mut bytes)?;
                    FieldValue::Text(String::from_utf8(bytes).map_err(|e| {
                        Error::Corruption(format!("invalid utf-8 in stored field: {e}"))
                    })?)
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown stored-field tag: {other}"
                    )))
                }
            };
            record.push(number, value);
        }
        Ok(record)
    }
}

/// Writer over whichever stored-fields layout the index is configured for.
pub enum StoredFieldsSink {
    Optimized(StoredFieldsWriter),
    File(FileStoredFieldsWriter),
}

impl StoredFieldsSink {
    pub fn new(directory: Arc<KvDirectory>, segment: &str, optimized: bool) -> Self {
        if optimized {
            Self::Optimized(StoredFieldsWriter::new(directory, segment))
        } else {
            Self::File(FileStoredFieldsWriter::new(directory, segment))
        }
    }

    pub fn start_document(&mut self) {
        match self {
            Self::Optimized(w) => w.start_document(),
            Self::File(w) => w.start_document(),
        }
    }

    pub fn write_field(&mut self, field_number: u32, value: FieldValue) {
        match self {
            Self::Optimized(w) => w.write_field(field_number, value),
            Self::File(w) => w.write_field(field_number, value),
        }
    }

    pub async fn finish_document(&mut self) -> Result<u32> {
        match self {
            Self::Optimized(w) => w.finish_document().await,
            Self::File(w) => w.finish_document().await,
        }
    }

    pub async fn finish(self, num_docs: u32) -> Result<()> {
        match self {
            Self::Optimized(w) => w.finish(num_docs).await,
            Self::File(w) => w.finish(num_docs).await,
        }
    }
}

/// Reader over whichever stored-fields layout a segment was written with.
pub enum StoredFieldsSource {
    Optimized(StoredFieldsReader),
    File(FileStoredFieldsReader),
}

impl StoredFieldsSource {
    pub fn new(directory: Arc<KvDirectory>, segment: &str, optimized: bool) -> Self {
        if optimized {
            Self::Optimized(StoredFieldsReader::new(directory, segment))
        } else {
            Self::File(FileStoredFieldsReader::new(directory, segment))
        }
    }

    pub async fn document(&self, doc_id: u32) -> Result<Option<StoredFieldsRecord>> {
        match self {
            Self::Optimized(r) => r.document(doc_id).await,
            Self::File(r) => r.document(doc_id).await,
        }
    }

    pub async fn visit_document(
        &self,
        doc_id: u32,
        visitor: &mut dyn StoredFieldVisitor,
    ) -> Result<()> {
        let record = self.document(doc_id).await?.ok_or_else(|| {
            Error::Corruption(format!("stored fields missing for doc {doc_id}"))
        })?;
        record.visit(visitor);
        Ok(())
    }

    /// Every record of the segment, ascending by doc id. Merges use this to
    /// avoid per-document round trips.
    pub async fn scan(&self) -> Result<Vec<(u32, StoredFieldsRecord)>> {
        match self {
            Self::Optimized(r) => r.scan().await,
            Self::File(r) => r.scan().await,
        }
    }

    /// Drop the segment's stored fields wholesale (after a merge retired it).
    pub async fn delete(&self, directory: &KvDirectory, segment: &str) -> Result<()> {
        match self {
            Self::Optimized(_) => directory.clear_stored_fields(segment).await,
            Self::File(r) => r.delete(directory, segment).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip_all_types() {
        let mut record = StoredFieldsRecord::default();
        record.push(0, FieldValue::I32(-5));
        record.push(1, FieldValue::I64(1_623));
        record.push(2, FieldValue::F32(1.5));
        record.push(3, FieldValue::F64(-2.25));
        record.push(4, FieldValue::Bytes(vec![0, 1, 255]));
        record.push(5, FieldValue::Text("Document 1".into()));

        let decoded = StoredFieldsRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_fields_preserved_in_insertion_order() {
        let mut record = StoredFieldsRecord::default();
        record.push(7, FieldValue::I32(1));
        record.push(3, FieldValue::I32(2));
        record.push(5, FieldValue::I32(3));
        let decoded = StoredFieldsRecord::decode(&record.encode().unwrap()).unwrap();
        let numbers: Vec<u32> = decoded.fields.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![7, 3, 5]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(StoredFieldsRecord::decode(&[9, 9, 9]).is_err());
    }

    #[test]
    fn test_visitor_sees_every_field_in_order() {
        struct Collect(Vec<(u32, FieldValue)>);
        impl StoredFieldVisitor for Collect {
            fn field(&mut self, field_number: u32, value: &FieldValue) {
                self.0.push((field_number, value.clone()));
            }
        }

        let mut record = StoredFieldsRecord::default();
        record.push(2, FieldValue::Text("a".into()));
        record.push(0, FieldValue::I64(1));
        let mut visitor = Collect(Vec::new());
        record.visit(&mut visitor);
        assert_eq!(
            visitor.0,
            vec![
                (2, FieldValue::Text("a".into())),
                (0, FieldValue::I64(1)),
            ]
        );
    }
}
