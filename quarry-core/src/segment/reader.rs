//! Read-side view of one committed segment.

use std::sync::Arc;

use crate::codec::{StoredFieldsRecord, StoredFieldsSource};
use crate::config::IndexConfig;
use crate::directories::KvDirectory;
use crate::dsl::{Document, Field, FieldValue, Record, PRIMARY_KEY_FIELD};
use crate::error::{Error, Result};
use crate::tuple::Tuple;

use super::format::{decode_liveness, decode_postings, liveness_file_name, postings_file_name, PostingsMap};
use super::types::SegmentEntry;

pub struct SegmentReader {
    entry: SegmentEntry,
    postings: PostingsMap,
    /// Liveness bitmap; `None` means every document is live.
    live: Option<Vec<bool>>,
    stored: StoredFieldsSource,
}

impl SegmentReader {
    pub async fn open(
        directory: &Arc<KvDirectory>,
        entry: SegmentEntry,
        config: &IndexConfig,
    ) -> Result<Self> {
        let raw = directory
            .open_input(&postings_file_name(&entry.name))
            .read_all()
            .await?;
        let (num_docs, postings) = decode_postings(&raw)?;
        if num_docs != entry.num_docs {
            return Err(Error::Corruption(format!(
                "segment {} catalog says {} docs, postings file says {num_docs}",
                entry.name, entry.num_docs
            )));
        }

        let live = if entry.liveness_gen > 0 {
            let raw = directory
                .open_input(&liveness_file_name(&entry.name, entry.liveness_gen))
                .read_all()
                .await?;
            Some(decode_liveness(&raw)?)
        } else {
            None
        };

        let stored = StoredFieldsSource::new(
            Arc::clone(directory),
            &entry.name,
            config.optimized_stored_fields_enabled,
        );

        Ok(Self {
            entry,
            postings,
            live,
            stored,
        })
    }

    pub fn entry(&self) -> &SegmentEntry {
        &self.entry
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn num_docs(&self) -> u32 {
        self.entry.num_docs
    }

    pub fn is_live(&self, doc_id: u32) -> bool {
        match &self.live {
            Some(bitmap) => bitmap.get(doc_id as usize).copied().unwrap_or(false),
            None => doc_id < self.entry.num_docs,
        }
    }

    /// Doc ids matching `term` in `field`, deleted documents filtered out.
    pub fn postings(&self, field: Field, term: &str) -> Vec<u32> {
        self.postings
            .get(&field.0)
            .and_then(|terms| terms.get(term))
            .map(|doc_ids| {
                doc_ids
                    .iter()
                    .copied()
                    .filter(|&doc| self.is_live(doc))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn raw_postings(&self) -> &PostingsMap {
        &self.postings
    }

    pub async fn stored_record(&self, doc_id: u32) -> Result<Option<StoredFieldsRecord>> {
        self.stored.document(doc_id).await
    }

    pub fn stored(&self) -> &StoredFieldsSource {
        &self.stored
    }

    /// Reassemble a [`Record`] from a stored-fields record.
    pub fn record_from_stored(record: &StoredFieldsRecord) -> Result<Record> {
        let primary_key = match record.get(PRIMARY_KEY_FIELD) {
            Some(FieldValue::Bytes(raw)) => Tuple::unpack(raw)?,
            _ => {
                return Err(Error::Corruption(
                    "stored-fields record has no primary key".into(),
                ))
            }
        };
        let mut document = Document::new();
        for (number, value) in &record.fields {
            if *number != PRIMARY_KEY_FIELD {
                document.add(Field(*number), value.clone());
            }
        }
        Ok(Record::new(primary_key, document))
    }

    /// All live documents, as one stored-fields scan.
    pub async fn scan_live(&self) -> Result<Vec<(u32, StoredFieldsRecord)>> {
        let mut records = self.stored.scan().await?;
        records.retain(|(doc_id, _)| self.is_live(*doc_id));
        Ok(records)
    }

    /// Locate a live document by primary key by scanning the segment. The
    /// fallback path when the KV primary-key index is disabled.
    pub async fn find_by_primary_key(&self, primary_key: &Tuple) -> Result<Option<u32>> {
        let packed = primary_key.pack();
        for (doc_id, record) in self.stored.scan().await? {
            if !self.is_live(doc_id) {
                continue;
            }
            if let Some(FieldValue::Bytes(raw)) = record.get(PRIMARY_KEY_FIELD) {
                if raw == &packed {
                    return Ok(Some(doc_id));
                }
            }
        }
        Ok(None)
    }
}
