//! Single writer for one partition's physical index.
//!
//! Holds the partition's advisory write lock for its whole lifetime and runs
//! all file IO through its own agile context, so a flush or merge spans as
//! many sub-transactions as it needs. Documents and deletions buffer in
//! memory between flushes; a flush writes one new segment, applies deletions
//! as a new liveness generation, and may trigger a merge pass.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::IndexConfig;
use crate::directories::{AgilityContext, DirectoryLock, KvDirectory};
use crate::dsl::{Record, Schema};
use crate::error::Result;
use crate::segment::{
    encode_liveness, liveness_file_name, MergePolicy, SegmentBuilder, SegmentCatalog,
    SegmentInfo, SegmentMerger, SegmentReader, TieredMergePolicy,
};
use crate::tuple::Tuple;

/// Name of the per-partition write lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

#[derive(Default)]
struct WriterState {
    pending_adds: Vec<Record>,
    pending_deletes: Vec<Tuple>,
}

pub struct PartitionWriter {
    directory: Arc<KvDirectory>,
    agility: Arc<AgilityContext>,
    lock: DirectoryLock,
    schema: Arc<Schema>,
    config: Arc<IndexConfig>,
    state: tokio::sync::Mutex<WriterState>,
}

impl PartitionWriter {
    /// Acquire the partition's write lock and set up the writer. Fails with
    /// `LockFailed` while another actor holds the lock.
    pub(crate) async fn create(
        directory: Arc<KvDirectory>,
        agility: Arc<AgilityContext>,
        schema: Arc<Schema>,
        config: Arc<IndexConfig>,
    ) -> Result<Self> {
        let lock = directory.obtain_lock(WRITE_LOCK_NAME).await?;
        Ok(Self {
            directory,
            agility,
            lock,
            schema,
            config,
            state: tokio::sync::Mutex::new(WriterState::default()),
        })
    }

    pub fn directory(&self) -> &Arc<KvDirectory> {
        &self.directory
    }

    pub async fn add_document(&self, record: Record) {
        self.state.lock().await.pending_adds.push(record);
    }

    /// Buffer a deletion. A document added since the last flush is simply
    /// dropped from the buffer; anything else is resolved against committed
    /// segments at flush time.
    pub async fn delete_document(&self, primary_key: Tuple) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state
            .pending_adds
            .iter()
            .position(|r| r.primary_key == primary_key)
        {
            state.pending_adds.remove(pos);
        } else {
            state.pending_deletes.push(primary_key);
        }
    }

    pub async fn has_pending(&self) -> bool {
        let state = self.state.lock().await;
        !state.pending_adds.is_empty() || !state.pending_deletes.is_empty()
    }

    /// Flush buffered work: apply deletions, write one new segment from the
    /// buffered documents, run the merge policy, commit. Returns whether
    /// anything changed.
    pub async fn flush(&self) -> Result<bool> {
        let (adds, deletes) = {
            let mut state = self.state.lock().await;
            if state.pending_adds.is_empty() && state.pending_deletes.is_empty() {
                return Ok(false);
            }
            (
                std::mem::take(&mut state.pending_adds),
                std::mem::take(&mut state.pending_deletes),
            )
        };

        self.lock.ensure_valid().await?;
        let mut catalog = SegmentCatalog::load(&self.directory).await?;

        if !deletes.is_empty() {
            self.apply_deletes(&mut catalog, deletes).await?;
        }

        if !adds.is_empty() {
            let mut builder = SegmentBuilder::new(Arc::clone(&self.schema));
            let num_docs = adds.len();
            for record in adds {
                builder.add_record(record);
            }
            let name = catalog.next_segment_name();
            let entry = builder.build(&self.directory, &name, &self.config).await?;
            log::debug!("flushed segment {name} with {num_docs} docs");
            catalog.segments.push(entry);
        }

        catalog.save(&self.directory).await?;

        if self.config.auto_merge_enabled {
            self.merge_with_policy(&mut catalog).await?;
        }

        self.agility.flush().await?;
        Ok(true)
    }

    /// Resolve each deleted primary key to `(segment, doc)` and rewrite the
    /// affected segments' liveness files under a fresh generation.
    async fn apply_deletes(
        &self,
        catalog: &mut SegmentCatalog,
        deletes: Vec<Tuple>,
    ) -> Result<()> {
        let mut by_segment: FxHashMap<String, Vec<u32>> = FxHashMap::default();
        for primary_key in deletes {
            let located = if self.config.primary_key_index_v2_enabled {
                self.directory.primary_key_get(&primary_key).await?
            } else {
                self.locate_by_scan(catalog, &primary_key).await?
            };
            match located {
                Some((segment, doc_id)) => {
                    by_segment.entry(segment).or_default().push(doc_id);
                    if self.config.primary_key_index_v2_enabled {
                        self.directory.primary_key_clear(&primary_key).await?;
                    }
                }
                None => {
                    log::debug!("delete for unknown primary key, ignoring");
                }
            }
        }

        for (segment, doc_ids) in by_segment {
            let Some(entry) = catalog.entry(&segment).cloned() else {
                continue;
            };
            let reader = SegmentReader::open(&self.directory, entry.clone(), &self.config).await?;
            let mut live: Vec<bool> = (0..entry.num_docs).map(|d| reader.is_live(d)).collect();
            let mut newly_deleted = 0;
            for doc_id in doc_ids {
                if live
                    .get(doc_id as usize)
                    .copied()
                    .unwrap_or(false)
                {
                    live[doc_id as usize] = false;
                    newly_deleted += 1;
                }
            }
            if newly_deleted == 0 {
                continue;
            }

            let new_gen = entry.liveness_gen + 1;
            let mut output = self
                .directory
                .create_output(&liveness_file_name(&segment, new_gen))
                .await?;
            output.write_all(&encode_liveness(&live)?).await?;
            output.close().await?;
            if entry.liveness_gen > 0 {
                self.directory
                    .delete_file(&liveness_file_name(&segment, entry.liveness_gen))
                    .await?;
            }
            let entry = catalog
                .entry_mut(&segment)
                .expect("entry existed a moment ago");
            entry.deleted_docs += newly_deleted;
            entry.liveness_gen = new_gen;
        }
        Ok(())
    }

    /// Scan-based primary-key resolution, used when the KV primary-key index
    /// is disabled.
    async fn locate_by_scan(
        &self,
        catalog: &SegmentCatalog,
        primary_key: &Tuple,
    ) -> Result<Option<(String, u32)>> {
        for entry in &catalog.segments {
            let reader = SegmentReader::open(&self.directory, entry.clone(), &self.config).await?;
            if let Some(doc_id) = reader.find_by_primary_key(primary_key).await? {
                return Ok(Some((entry.name.clone(), doc_id)));
            }
        }
        Ok(None)
    }

    async fn merge_with_policy(&self, catalog: &mut SegmentCatalog) -> Result<()> {
        let policy = TieredMergePolicy::with_segments_per_tier(self.config.merge_segments_per_tier)?;
        let infos: Vec<SegmentInfo> = catalog
            .segments
            .iter()
            .map(|s| SegmentInfo {
                name: s.name.clone(),
                num_docs: s.live_docs(),
                deleted_docs: s.deleted_docs,
            })
            .collect();
        let candidates = policy.find_merges(&infos);
        if candidates.is_empty() {
            return Ok(());
        }
        let merger = SegmentMerger::new(&self.directory, &self.config);
        for candidate in candidates {
            self.lock.ensure_valid().await?;
            merger.merge(catalog, &candidate.segment_names).await?;
        }
        catalog.save(&self.directory).await?;
        Ok(())
    }

    /// Merge every segment of the partition into one, regardless of policy.
    pub async fn force_merge(&self) -> Result<()> {
        self.flush().await?;
        self.lock.ensure_valid().await?;
        let mut catalog = SegmentCatalog::load(&self.directory).await?;
        let names: Vec<String> = catalog.segments.iter().map(|s| s.name.clone()).collect();
        if names.is_empty() {
            return Ok(());
        }
        let has_deletes = catalog.segments.iter().any(|s| s.deleted_docs > 0);
        if names.len() == 1 && !has_deletes {
            return Ok(());
        }
        let merger = SegmentMerger::new(&self.directory, &self.config);
        merger.merge(&mut catalog, &names).await?;
        catalog.save(&self.directory).await?;
        self.agility.flush().await
    }

    /// Flush, release the lock, and close the context.
    pub async fn close(&self) -> Result<()> {
        self.flush().await?;
        self.lock.release().await?;
        self.agility.flush_and_close().await
    }

    /// Drop buffered work and tear down without flushing. The lock is cleared
    /// only if still ours.
    pub(crate) async fn discard(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.pending_adds.clear();
            state.pending_deletes.clear();
        }
        self.lock.clear_if_locked().await?;
        self.agility.flush_and_close().await
    }
}
