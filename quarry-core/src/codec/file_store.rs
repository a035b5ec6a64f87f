//! Default file-based stored-fields codec.
//!
//! All of a segment's records are serialized into one `.fld` virtual file:
//! length-prefixed records, then an offset table, then a fixed footer. Used
//! when the per-document KV layout is disabled.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::directories::KvDirectory;
use crate::dsl::FieldValue;
use crate::error::{Error, Result};
use crate::metrics;

use super::StoredFieldsRecord;

const FLD_MAGIC: u32 = 0x464C_4431; // "FLD1"
const FOOTER_LEN: u64 = 8;

fn file_name(segment: &str) -> String {
    format!("{segment}.fld")
}

pub struct FileStoredFieldsWriter {
    directory: Arc<KvDirectory>,
    segment: String,
    current: Option<StoredFieldsRecord>,
    records: Vec<Vec<u8>>,
}

impl FileStoredFieldsWriter {
    pub fn new(directory: Arc<KvDirectory>, segment: &str) -> Self {
        Self {
            directory,
            segment: segment.to_string(),
            current: None,
            records: Vec::new(),
        }
    }

    pub fn start_document(&mut self) {
        self.current = Some(StoredFieldsRecord::default());
    }

    pub fn write_field(&mut self, field_number: u32, value: FieldValue) {
        self.current
            .get_or_insert_with(StoredFieldsRecord::default)
            .push(field_number, value);
    }

    pub async fn finish_document(&mut self) -> Result<u32> {
        let record = self.current.take().unwrap_or_default();
        self.records.push(record.encode()?);
        Ok(self.records.len() as u32 - 1)
    }

    /// Write the `.fld` file: records, offset table, footer.
    pub async fn finish(self, num_docs: u32) -> Result<()> {
        if self.records.len() as u32 != num_docs {
            return Err(Error::Corruption(format!(
                "segment {} stored {} documents but expected {num_docs}",
                self.segment,
                self.records.len()
            )));
        }
        let mut output = self
            .directory
            .create_output(&file_name(&self.segment))
            .await?;

        let mut offsets = Vec::with_capacity(self.records.len());
        let mut position = 0u64;
        let mut len_prefix = [0u8; 4];
        for record in &self.records {
            offsets.push(position);
            LittleEndian::write_u32(&mut len_prefix, record.len() as u32);
            output.write_all(&len_prefix).await?;
            output.write_all(record).await?;
            position += 4 + record.len() as u64;
        }
        let mut table = vec![0u8; offsets.len() * 8];
        for (i, offset) in offsets.iter().enumerate() {
            LittleEndian::write_u64(&mut table[i * 8..(i + 1) * 8], *offset);
        }
        output.write_all(&table).await?;

        let mut footer = [0u8; FOOTER_LEN as usize];
        LittleEndian::write_u32(&mut footer[0..4], num_docs);
        LittleEndian::write_u32(&mut footer[4..8], FLD_MAGIC);
        output.write_all(&footer).await?;
        output.close().await?;
        Ok(())
    }
}

pub struct FileStoredFieldsReader {
    directory: Arc<KvDirectory>,
    segment: String,
}

impl FileStoredFieldsReader {
    pub fn new(directory: Arc<KvDirectory>, segment: &str) -> Self {
        Self {
            directory,
            segment: segment.to_string(),
        }
    }

    async fn load(&self) -> Result<(Vec<u64>, Vec<u8>)> {
        let input = self.directory.open_input(&file_name(&self.segment));
        let file_len = input.len().await?;
        if file_len < FOOTER_LEN {
            return Err(Error::Corruption(format!(
                "stored-fields file for {} too small",
                self.segment
            )));
        }
        let footer = input.read_bytes(file_len - FOOTER_LEN, FOOTER_LEN).await?;
        let num_docs = LittleEndian::read_u32(&footer[0..4]) as u64;
        if LittleEndian::read_u32(&footer[4..8]) != FLD_MAGIC {
            return Err(Error::Corruption(format!(
                "bad stored-fields magic for {}",
                self.segment
            )));
        }
        let table_start = file_len - FOOTER_LEN - num_docs * 8;
        let table = input.read_bytes(table_start, num_docs * 8).await?;
        let offsets = (0..num_docs as usize)
            .map(|i| LittleEndian::read_u64(&table[i * 8..(i + 1) * 8]))
            .collect();
        let data = input.read_bytes(0, table_start).await?;
        Ok((offsets, data))
    }

    pub async fn document(&self, doc_id: u32) -> Result<Option<StoredFieldsRecord>> {
        let (offsets, data) = self.load().await?;
        let Some(&offset) = offsets.get(doc_id as usize) else {
            return Ok(None);
        };
        let offset = offset as usize;
        let len = LittleEndian::read_u32(&data[offset..offset + 4]) as usize;
        Ok(Some(StoredFieldsRecord::decode(
            &data[offset + 4..offset + 4 + len],
        )?))
    }

    pub async fn scan(&self) -> Result<Vec<(u32, StoredFieldsRecord)>> {
        let (offsets, data) = self.load().await?;
        let mut records = Vec::with_capacity(offsets.len());
        for (doc_id, &offset) in offsets.iter().enumerate() {
            let offset = offset as usize;
            let len = LittleEndian::read_u32(&data[offset..offset + 4]) as usize;
            records.push((
                doc_id as u32,
                StoredFieldsRecord::decode(&data[offset + 4..offset + 4 + len])?,
            ));
        }
        Ok(records)
    }

    pub async fn delete(&self, directory: &KvDirectory, segment: &str) -> Result<()> {
        metrics::increment(&directory.metrics().delete_stored_fields);
        directory.delete_file(&file_name(segment)).await
    }
}
