//! Process-wide cache of decoded virtual-file blocks.
//!
//! Keyed by (directory instance, file id, block number) and shared across
//! every directory bound to the same subspace, so a block decompressed for
//! one transaction serves later transactions too. Eviction is byte-bounded
//! and least-recently-used. Concurrent readers of the same missing block
//! coalesce onto a single fetch.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;

use crate::error::Result;

/// (directory instance, file id, block number)
pub type BlockKey = (u64, u64, u64);

struct CachedBlock {
    data: Arc<Vec<u8>>,
    /// Access stamp for LRU eviction.
    access: u64,
}

struct CacheState {
    blocks: FxHashMap<BlockKey, CachedBlock>,
    total_bytes: usize,
    access_counter: u64,
}

/// Byte-bounded LRU of uncompressed blocks.
pub struct BlockCache {
    max_bytes: usize,
    state: Mutex<CacheState>,
    /// In-flight fetches; readers of the same key share one cell.
    pending: Mutex<FxHashMap<BlockKey, Arc<OnceCell<Arc<Vec<u8>>>>>>,
}

impl BlockCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(CacheState {
                blocks: FxHashMap::default(),
                total_bytes: 0,
                access_counter: 0,
            }),
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    /// Cached block, if present. Bumps the access stamp.
    pub fn get(&self, key: BlockKey) -> Option<Arc<Vec<u8>>> {
        let mut state = self.state.lock();
        state.access_counter += 1;
        let counter = state.access_counter;
        state.blocks.get_mut(&key).map(|block| {
            block.access = counter;
            Arc::clone(&block.data)
        })
    }

    /// Get a block, fetching it on miss. Concurrent callers for the same key
    /// await the same underlying fetch; a failed fetch is surfaced to the
    /// callers of that attempt and retried by the next one.
    pub async fn get_or_load<F, Fut>(&self, key: BlockKey, fetch: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let cell = {
            let mut pending = self.pending.lock();
            Arc::clone(pending.entry(key).or_default())
        };

        let result = cell
            .get_or_try_init(|| async { fetch().await.map(Arc::new) })
            .await
            .map(Arc::clone);

        self.pending.lock().remove(&key);

        let data = result?;
        self.insert(key, Arc::clone(&data));
        Ok(data)
    }

    fn insert(&self, key: BlockKey, data: Arc<Vec<u8>>) {
        let mut state = self.state.lock();
        if state.blocks.contains_key(&key) {
            return;
        }
        let len = data.len();
        while state.total_bytes + len > self.max_bytes && !state.blocks.is_empty() {
            let lru_key = state
                .blocks
                .iter()
                .min_by_key(|(_, block)| block.access)
                .map(|(&k, _)| k);
            match lru_key {
                Some(k) => {
                    if let Some(evicted) = state.blocks.remove(&k) {
                        state.total_bytes -= evicted.data.len();
                    }
                }
                None => break,
            }
        }
        state.access_counter += 1;
        let access = state.access_counter;
        state.total_bytes += len;
        state.blocks.insert(key, CachedBlock { data, access });
    }

    pub fn stats(&self) -> BlockCacheStats {
        let state = self.state.lock();
        BlockCacheStats {
            blocks: state.blocks.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockCacheStats {
    pub blocks: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_hit_after_load() {
        let cache = BlockCache::new(1024);
        let fetches = AtomicUsize::new(0);

        let block = cache
            .get_or_load((1, 1, 0), || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1, 2, 3])
            })
            .await
            .unwrap();
        assert_eq!(*block, vec![1, 2, 3]);

        let again = cache
            .get_or_load((1, 1, 0), || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(vec![9, 9, 9])
            })
            .await
            .unwrap();
        assert_eq!(*again, vec![1, 2, 3]);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_coalesce() {
        let cache = Arc::new(BlockCache::new(1024));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_load((1, 7, 3), move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(vec![42u8])
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(*task.await.unwrap(), vec![42u8]);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_byte_bounded_eviction() {
        let cache = BlockCache::new(10);
        for i in 0..5u64 {
            cache
                .get_or_load((1, 1, i), || async { Ok(vec![0u8; 4]) })
                .await
                .unwrap();
        }
        let stats = cache.stats();
        assert!(stats.total_bytes <= 10, "cache over budget: {stats:?}");
        assert!(stats.blocks <= 2);
    }

    #[tokio::test]
    async fn test_lru_keeps_recent() {
        let cache = BlockCache::new(8);
        cache
            .get_or_load((1, 1, 0), || async { Ok(vec![0u8; 4]) })
            .await
            .unwrap();
        cache
            .get_or_load((1, 1, 1), || async { Ok(vec![1u8; 4]) })
            .await
            .unwrap();
        // Touch block 0 so block 1 is the eviction victim.
        assert!(cache.get((1, 1, 0)).is_some());
        cache
            .get_or_load((1, 1, 2), || async { Ok(vec![2u8; 4]) })
            .await
            .unwrap();

        assert!(cache.get((1, 1, 0)).is_some());
        assert!(cache.get((1, 1, 1)).is_none());
    }
}
