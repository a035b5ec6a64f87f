//! Builds one immutable segment from buffered records.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::StoredFieldsSink;
use crate::config::IndexConfig;
use crate::directories::KvDirectory;
use crate::dsl::{tokenize, FieldValue, Record, Schema, PRIMARY_KEY_FIELD};
use crate::error::{Error, Result};

use super::format::{encode_postings, postings_file_name, PostingsMap};
use super::types::SegmentEntry;

pub struct SegmentBuilder {
    schema: Arc<Schema>,
    records: Vec<Record>,
}

impl SegmentBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    pub fn add_record(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn num_docs(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the segment under `name`: postings file, stored fields, and (when
    /// enabled) primary-key index entries. Doc ids are assigned 0..N in
    /// arrival order.
    pub async fn build(
        self,
        directory: &Arc<KvDirectory>,
        name: &str,
        config: &IndexConfig,
    ) -> Result<SegmentEntry> {
        let num_docs = self.records.len() as u32;

        let mut postings = PostingsMap::new();
        let mut sink = StoredFieldsSink::new(
            Arc::clone(directory),
            name,
            config.optimized_stored_fields_enabled,
        );

        for (doc_id, record) in self.records.iter().enumerate() {
            let doc_id = doc_id as u32;
            sink.start_document();
            sink.write_field(
                PRIMARY_KEY_FIELD,
                FieldValue::Bytes(record.primary_key.pack()),
            );

            for (field, value) in record.document.field_values() {
                let entry = self.schema.entry(*field).ok_or_else(|| {
                    Error::InvalidArgument(format!("document uses unknown field {field:?}"))
                })?;
                if !value.matches_type(entry.field_type) {
                    return Err(Error::InvalidArgument(format!(
                        "field {} declared {:?} but value is {value:?}; implicit \
                         widening is not allowed",
                        entry.name, entry.field_type
                    )));
                }
                if entry.indexed {
                    if let FieldValue::Text(text) = value {
                        let terms = postings.entry(field.0).or_default();
                        for token in tokenize(text) {
                            let doc_ids = terms.entry(token).or_default();
                            if doc_ids.last() != Some(&doc_id) {
                                doc_ids.push(doc_id);
                            }
                        }
                    }
                }
                if entry.stored {
                    sink.write_field(field.0, value.clone());
                }
            }
            let assigned = sink.finish_document().await?;
            debug_assert_eq!(assigned, doc_id);

            if config.primary_key_index_v2_enabled {
                directory
                    .primary_key_set(&record.primary_key, name, doc_id)
                    .await?;
            }
        }
        sink.finish(num_docs).await?;

        write_postings(directory, name, num_docs, &postings).await?;

        Ok(SegmentEntry {
            name: name.to_string(),
            num_docs,
            deleted_docs: 0,
            liveness_gen: 0,
        })
    }
}

pub(crate) async fn write_postings(
    directory: &Arc<KvDirectory>,
    name: &str,
    num_docs: u32,
    postings: &PostingsMap,
) -> Result<()> {
    let encoded = encode_postings(num_docs, postings)?;
    let mut output = directory.create_output(&postings_file_name(name)).await?;
    output.write_all(&encoded).await?;
    output.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directories::testing;
    use crate::kv::MemoryDatabase;
    use crate::tuple::Tuple;

    fn schema() -> Arc<Schema> {
        let mut builder = Schema::builder();
        builder.add_i64_field("doc_id", true);
        builder.add_text_field("text", true, true);
        Arc::new(builder.build())
    }

    fn record(schema: &Schema, pk: i64, text: &str) -> Record {
        let mut doc = crate::dsl::Document::new();
        doc.add_i64(schema.field("doc_id").unwrap(), pk);
        doc.add_text(schema.field("text").unwrap(), text);
        Record::new(Tuple::new().push_int(pk), doc)
    }

    #[tokio::test]
    async fn test_build_writes_all_artifacts() {
        let db = MemoryDatabase::new();
        let dir = testing::directory(&db, false, 4096);
        let schema = schema();
        let config = IndexConfig::default();

        let mut builder = SegmentBuilder::new(Arc::clone(&schema));
        builder.add_record(record(&schema, 1623, "Document 1"));
        builder.add_record(record(&schema, 1624, "Document 2"));
        let entry = builder.build(&dir, "_0", &config).await.unwrap();
        assert_eq!(entry.num_docs, 2);

        assert!(dir.file_exists("_0.pst").await.unwrap());
        assert_eq!(dir.scan_stored_fields("_0").await.unwrap().len(), 2);
        assert_eq!(
            dir.primary_key_get(&Tuple::new().push_int(1624))
                .await
                .unwrap(),
            Some(("_0".to_string(), 1))
        );
    }

    #[tokio::test]
    async fn test_type_mismatch_rejected() {
        let db = MemoryDatabase::new();
        let dir = testing::directory(&db, false, 4096);
        let schema = schema();
        let config = IndexConfig::default();

        let mut doc = crate::dsl::Document::new();
        // `doc_id` is declared i64; an i32 value must not silently widen.
        doc.add_i32(schema.field("doc_id").unwrap(), 7);
        let mut builder = SegmentBuilder::new(Arc::clone(&schema));
        builder.add_record(Record::new(Tuple::new().push_int(7), doc));

        let err = builder.build(&dir, "_0", &config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got {err}");
    }
}
