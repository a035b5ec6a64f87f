//! Process-wide manager of per-partition directories and writers.
//!
//! Keyed by `(grouping key, partition id)`. Directory *instances* are cheap
//! transaction-bound views, but each key's stable instance id keeps the block
//! cache shared across transactions; writers are long-lived and hold the
//! partition's write lock, so there is exactly one per key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::IndexConfig;
use crate::directories::{AgilityContext, BlockCache, KvDirectory};
use crate::dsl::Schema;
use crate::error::Result;
use crate::kv::KvDatabase;
use crate::metrics::Metrics;
use crate::partition::partition_data_subspace;
use crate::tuple::{Subspace, Tuple};

use super::writer::PartitionWriter;

pub(crate) type PartitionKey = (Vec<u8>, Option<i32>);

pub struct DirectoryManager {
    index_subspace: Subspace,
    config: Arc<IndexConfig>,
    metrics: Arc<Metrics>,
    block_cache: Arc<BlockCache>,
    next_instance: AtomicU64,
    instances: RwLock<FxHashMap<PartitionKey, u64>>,
    writers: tokio::sync::Mutex<FxHashMap<PartitionKey, Arc<PartitionWriter>>>,
}

impl DirectoryManager {
    pub fn new(index_subspace: Subspace, config: Arc<IndexConfig>, metrics: Arc<Metrics>) -> Self {
        let block_cache = Arc::new(BlockCache::new(config.block_cache_bytes));
        Self {
            index_subspace,
            config,
            metrics,
            block_cache,
            next_instance: AtomicU64::new(1),
            instances: RwLock::new(FxHashMap::default()),
            writers: tokio::sync::Mutex::new(FxHashMap::default()),
        }
    }

    fn instance_id(&self, key: &PartitionKey) -> u64 {
        if let Some(&id) = self.instances.read().get(key) {
            return id;
        }
        let mut instances = self.instances.write();
        *instances
            .entry(key.clone())
            .or_insert_with(|| self.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    /// A directory over `(group, partition)` bound to the given context.
    /// Views share the stable instance id, so blocks decoded under one
    /// transaction serve reads under later ones.
    pub fn bind_directory(
        &self,
        agility: Arc<AgilityContext>,
        group: &Tuple,
        partition: Option<i32>,
    ) -> Arc<KvDirectory> {
        let key = (group.pack(), partition);
        let instance = self.instance_id(&key);
        Arc::new(KvDirectory::new(
            partition_data_subspace(&self.index_subspace, group, partition),
            instance,
            agility,
            Arc::clone(&self.block_cache),
            Arc::clone(&self.metrics),
            self.config.block_size,
            self.config.index_compression_enabled,
            self.config.effective_lock_window_ms(),
        ))
    }

    /// The single writer for `(group, partition)`, created on first use.
    /// Creation acquires the partition's write lock and fails fast if another
    /// actor holds it.
    pub async fn writer(
        &self,
        database: &Arc<dyn KvDatabase>,
        schema: &Arc<Schema>,
        group: &Tuple,
        partition: Option<i32>,
    ) -> Result<Arc<PartitionWriter>> {
        let key = (group.pack(), partition);
        let mut writers = self.writers.lock().await;
        if let Some(writer) = writers.get(&key) {
            return Ok(Arc::clone(writer));
        }
        let agility = Arc::new(AgilityContext::agile(
            Arc::clone(database),
            self.config.agile_commit_time_quota_ms,
            self.config.agile_commit_size_quota_bytes,
            Arc::clone(&self.metrics),
        ));
        let directory = self.bind_directory(Arc::clone(&agility), group, partition);
        let writer = Arc::new(
            PartitionWriter::create(
                directory,
                agility,
                Arc::clone(schema),
                Arc::clone(&self.config),
            )
            .await?,
        );
        writers.insert(key, Arc::clone(&writer));
        Ok(writer)
    }

    /// Flush every open writer. Returns how many had pending work.
    pub async fn flush_all(&self) -> Result<usize> {
        let writers: Vec<Arc<PartitionWriter>> =
            self.writers.lock().await.values().cloned().collect();
        let mut flushed = 0;
        for writer in writers {
            if writer.flush().await? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Drop every writer of a group without flushing, releasing their locks.
    /// Used by group deletion, where the data is about to be cleared anyway.
    pub async fn discard_group(&self, group: &Tuple) -> Result<()> {
        let packed = group.pack();
        let doomed: Vec<Arc<PartitionWriter>> = {
            let mut writers = self.writers.lock().await;
            let keys: Vec<PartitionKey> = writers
                .keys()
                .filter(|(g, _)| *g == packed)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| writers.remove(k)).collect()
        };
        for writer in doomed {
            writer.discard().await?;
        }
        Ok(())
    }

    /// Flush and close every writer, releasing all locks.
    pub async fn close_all(&self) -> Result<()> {
        let writers: Vec<Arc<PartitionWriter>> = {
            let mut map = self.writers.lock().await;
            map.drain().map(|(_, w)| w).collect()
        };
        for writer in writers {
            writer.close().await?;
        }
        Ok(())
    }
}
