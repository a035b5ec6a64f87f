//! Optimized stored-fields codec: one KV entry per document.
//!
//! The writer assigns contiguous doc ids in arrival order and issues each
//! record's put asynchronously, keeping at most [`MAX_PENDING_WRITES`] in
//! flight; when the queue is full it awaits the oldest write for
//! backpressure. The reader serves single-document fetches with a point read
//! and merges with one range scan.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::directories::KvDirectory;
use crate::dsl::FieldValue;
use crate::error::{Error, Result};

use super::StoredFieldsRecord;

/// Bound on in-flight stored-fields puts.
pub const MAX_PENDING_WRITES: usize = 20;

pub struct StoredFieldsWriter {
    directory: Arc<KvDirectory>,
    segment: String,
    doc_id: u32,
    current: Option<StoredFieldsRecord>,
    pending: VecDeque<tokio::task::JoinHandle<Result<()>>>,
}

impl StoredFieldsWriter {
    pub fn new(directory: Arc<KvDirectory>, segment: &str) -> Self {
        Self {
            directory,
            segment: segment.to_string(),
            doc_id: 0,
            current: None,
            pending: VecDeque::with_capacity(MAX_PENDING_WRITES),
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

    /// Serialize the current document and issue its put. Returns the doc id
    /// assigned to it.
    pub async fn finish_document(&mut self) -> Result<u32> {
        let record = self.current.take().unwrap_or_default();
        let encoded = record.encode()?;
        let doc_id = self.doc_id;
        self.doc_id += 1;

        if self.pending.len() == MAX_PENDING_WRITES {
            Self::await_one(&mut self.pending).await?;
        }
        let directory = Arc::clone(&self.directory);
        let segment = self.segment.clone();
        self.pending.push_back(tokio::spawn(async move {
            directory.write_stored_fields(&segment, doc_id, &encoded).await
        }));
        Ok(doc_id)
    }

    async fn await_one(
        pending: &mut VecDeque<tokio::task::JoinHandle<Result<()>>>,
    ) -> Result<()> {
        if let Some(handle) = pending.pop_front() {
            handle
                .await
                .map_err(|e| Error::Internal(format!("stored-fields write task failed: {e}")))??;
        }
        Ok(())
    }

    /// Drain outstanding writes and verify the doc count matches what the
    /// segment says it holds.
    pub async fn finish(mut self, num_docs: u32) -> Result<()> {
        while !self.pending.is_empty() {
            Self::await_one(&mut self.pending).await?;
        }
        if self.doc_id != num_docs {
            return Err(Error::Corruption(format!(
                "segment {} stored {} documents but expected {num_docs}",
                self.segment, self.doc_id
            )));
        }
        Ok(())
    }
}

pub struct StoredFieldsReader {
    directory: Arc<KvDirectory>,
    segment: String,
}

impl StoredFieldsReader {
    pub fn new(directory: Arc<KvDirectory>, segment: &str) -> Self {
        Self {
            directory,
            segment: segment.to_string(),
        }
    }

    pub async fn document(&self, doc_id: u32) -> Result<Option<StoredFieldsRecord>> {
        match self.directory.read_stored_fields(&self.segment, doc_id).await? {
            Some(raw) => Ok(Some(StoredFieldsRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn scan(&self) -> Result<Vec<(u32, StoredFieldsRecord)>> {
        let raw = self.directory.scan_stored_fields(&self.segment).await?;
        let mut records = Vec::with_capacity(raw.len());
        for (doc_id, bytes) in raw {
            records.push((doc_id, StoredFieldsRecord::decode(&bytes)?));
        }
        Ok(records)
    }
}
