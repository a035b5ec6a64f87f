//! Rewrites a group of segments into one, dropping deleted documents.
//!
//! Postings are carried over with doc ids remapped (never re-tokenized);
//! stored fields stream through one bulk scan per source segment. After the
//! new segment is durable the sources' files and stored-fields ranges are
//! deleted and the catalog rewritten.

use std::sync::Arc;

use crate::config::IndexConfig;
use crate::directories::KvDirectory;
use crate::dsl::{FieldValue, PRIMARY_KEY_FIELD};
use crate::error::{Error, Result};
use crate::tuple::Tuple;

use super::builder::write_postings;
use super::format::{liveness_file_name, postings_file_name, PostingsMap};
use super::reader::SegmentReader;
use super::types::{SegmentCatalog, SegmentEntry};
use crate::codec::StoredFieldsSink;

pub struct SegmentMerger<'a> {
    directory: &'a Arc<KvDirectory>,
    config: &'a IndexConfig,
}

impl<'a> SegmentMerger<'a> {
    pub fn new(directory: &'a Arc<KvDirectory>, config: &'a IndexConfig) -> Self {
        Self { directory, config }
    }

    /// Merge `names` into a fresh segment. Updates `catalog` in memory; the
    /// caller persists it. Returns the new entry, or `None` if the sources
    /// held no documents at all (they are still deleted).
    pub async fn merge(
        &self,
        catalog: &mut SegmentCatalog,
        names: &[String],
    ) -> Result<Option<SegmentEntry>> {
        let mut readers = Vec::with_capacity(names.len());
        for name in names {
            let entry = catalog
                .entry(name)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown segment {name}")))?
                .clone();
            readers.push(SegmentReader::open(self.directory, entry, self.config).await?);
        }

        let new_name = catalog.next_segment_name();
        let mut merged_postings = PostingsMap::new();
        let mut sink = StoredFieldsSink::new(
            Arc::clone(self.directory),
            &new_name,
            self.config.optimized_stored_fields_enabled,
        );
        let mut next_doc: u32 = 0;

        for reader in &readers {
            // One bulk scan per source instead of per-document fetches.
            let live = reader.scan_live().await?;
            let mut doc_map = vec![None::<u32>; reader.num_docs() as usize];
            for (old_doc, record) in &live {
                let new_doc = next_doc;
                next_doc += 1;
                doc_map[*old_doc as usize] = Some(new_doc);

                sink.start_document();
                for (number, value) in &record.fields {
                    sink.write_field(*number, value.clone());
                }
                let assigned = sink.finish_document().await?;
                debug_assert_eq!(assigned, new_doc);

                if self.config.primary_key_index_v2_enabled {
                    if let Some(FieldValue::Bytes(raw)) = record.get(PRIMARY_KEY_FIELD) {
                        let primary_key = Tuple::unpack(raw)?;
                        self.directory
                            .primary_key_set(&primary_key, &new_name, new_doc)
                            .await?;
                    }
                }
            }

            for (field_id, terms) in reader.raw_postings() {
                let merged_terms = merged_postings.entry(*field_id).or_default();
                for (term, doc_ids) in terms {
                    let remapped = merged_terms.entry(term.clone()).or_default();
                    for old_doc in doc_ids {
                        if let Some(new_doc) = doc_map[*old_doc as usize] {
                            remapped.push(new_doc);
                        }
                    }
                }
            }
        }

        sink.finish(next_doc).await?;

        let new_entry = if next_doc > 0 {
            // Remapped ids are appended source by source; keep each list sorted.
            for terms in merged_postings.values_mut() {
                for doc_ids in terms.values_mut() {
                    doc_ids.sort_unstable();
                }
            }
            write_postings(self.directory, &new_name, next_doc, &merged_postings).await?;
            Some(SegmentEntry {
                name: new_name,
                num_docs: next_doc,
                deleted_docs: 0,
                liveness_gen: 0,
            })
        } else {
            None
        };

        // Retire the sources only after the replacement is fully written.
        for reader in &readers {
            let entry = reader.entry().clone();
            self.directory
                .delete_file(&postings_file_name(&entry.name))
                .await?;
            if entry.liveness_gen > 0 {
                self.directory
                    .delete_file(&liveness_file_name(&entry.name, entry.liveness_gen))
                    .await?;
            }
            reader
                .stored()
                .delete(self.directory, &entry.name)
                .await?;
        }
        catalog.remove(names);
        if let Some(entry) = &new_entry {
            catalog.segments.push(entry.clone());
        }
        log::debug!(
            "merged segments {names:?} into {:?} ({next_doc} live docs)",
            new_entry.as_ref().map(|e| &e.name)
        );
        Ok(new_entry)
    }
}
