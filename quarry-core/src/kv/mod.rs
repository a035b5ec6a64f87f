//! Transactional ordered key-value store contract.
//!
//! The index core is written against these traits; the store underneath is an
//! external collaborator. Transactions offer snapshot reads, buffered writes,
//! and an atomic commit that may fail with [`Error::CommitConflict`]; the
//! caller decides whether to retry. All operations are async and take `&self`;
//! implementations synchronize internally so one transaction can be driven
//! from several tasks.

mod memory;

pub use memory::MemoryDatabase;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// A key and its value, as returned by range reads.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Handle to a transactional ordered KV database.
#[async_trait]
pub trait KvDatabase: Send + Sync + 'static {
    /// Open a new read/write transaction at the current committed version.
    async fn begin(&self) -> Result<Arc<dyn KvTransaction>>;
}

/// One serializable read/write transaction.
///
/// Reads observe the snapshot taken at `begin` plus this transaction's own
/// writes. Writes are buffered locally and become durable, all or nothing, at
/// `commit`.
#[async_trait]
pub trait KvTransaction: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered scan of `[begin, end)`. `reverse` returns entries from the end
    /// of the range; `limit` caps the number of entries either way.
    async fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<KeyValue>>;

    fn set(&self, key: &[u8], value: &[u8]);

    fn clear(&self, key: &[u8]);

    fn clear_range(&self, begin: &[u8], end: &[u8]);

    /// Atomically publish all buffered writes. Fails with
    /// [`Error::CommitConflict`](crate::Error::CommitConflict) when a
    /// conflicting transaction committed first; the transaction is unusable
    /// afterwards either way.
    async fn commit(&self) -> Result<()>;

    /// Discard the transaction without publishing anything.
    fn cancel(&self);
}
