//! Persistence primitives: the virtual-file directory and its supporting
//! machinery (block cache, lazy handles, agility context, file lock).

mod agility;
mod block_cache;
mod directory;
mod lazy;
mod lock;

pub use agility::AgilityContext;
pub use block_cache::{BlockCache, BlockCacheStats, BlockKey};
pub use directory::{FileReference, KvDirectory, KvIndexInput, KvIndexOutput};
pub use lazy::LazyHandle;
pub use lock::DirectoryLock;
#[cfg(test)]
pub(crate) use lock::now_ms as lock_clock_ms;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::*;
    use crate::kv::MemoryDatabase;
    use crate::metrics::Metrics;
    use crate::tuple::{Subspace, Tuple};

    /// A directory over a fresh agile context, suitable for most unit tests.
    pub fn directory(db: &MemoryDatabase, compression: bool, block_size: usize) -> Arc<KvDirectory> {
        let metrics = Arc::new(Metrics::new());
        let agility = Arc::new(AgilityContext::agile(
            Arc::new(db.clone()),
            60_000,
            u64::MAX,
            Arc::clone(&metrics),
        ));
        Arc::new(KvDirectory::new(
            Subspace::new(&Tuple::new().push_str("test-idx").push_int(1)),
            1,
            agility,
            Arc::new(BlockCache::new(1 << 20)),
            metrics,
            block_size,
            compression,
            600_000,
        ))
    }
}
