//! Commit driver that splits long-running work across sub-transactions.
//!
//! A non-agile context passes every operation to the caller's transaction and
//! never commits it. An agile context opens floating sub-transactions lazily
//! and commits the current one whenever a wall-time or written-bytes quota is
//! exceeded, so merges and repartitioning never outgrow a single transaction.
//!
//! Lock plan:
//! - ordinary operations take the read side of `op_lock`, released when the
//!   operation's future completes
//! - sub-transaction creation runs under the read side, serialized by
//!   `create_sync`
//! - `commit_now` takes the write side so no operation is in flight during a
//!   commit; `committing_now` keeps racing threads from piling up on the
//!   commit path
//!
//! Agile mode deliberately gives up cross-sub-transaction atomicity: writes
//! become visible as each sub-transaction commits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::kv::{KeyValue, KvDatabase, KvTransaction};
use crate::metrics::{self, Metrics};

struct CurrentTxn {
    txn: Arc<dyn KvTransaction>,
    created_at: Instant,
}

struct AgileState {
    database: Arc<dyn KvDatabase>,
    time_quota_ms: u64,
    size_quota_bytes: u64,
    current: Mutex<Option<CurrentTxn>>,
    op_lock: RwLock<()>,
    create_sync: tokio::sync::Mutex<()>,
    commit_sync: tokio::sync::Mutex<()>,
    /// Not a lock: keeps quota checks from stampeding the commit path while
    /// one thread is already committing.
    committing_now: AtomicBool,
    write_size: AtomicU64,
}

struct NonAgileState {
    txn: Arc<dyn KvTransaction>,
}

enum Inner {
    NonAgile(NonAgileState),
    Agile(AgileState),
}

/// See module docs.
pub struct AgilityContext {
    inner: Inner,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
}

impl AgilityContext {
    /// Pass-through context over the caller's transaction. The caller commits.
    pub fn non_agile(txn: Arc<dyn KvTransaction>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Inner::NonAgile(NonAgileState { txn }),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Floating-window context over `database`.
    pub fn agile(
        database: Arc<dyn KvDatabase>,
        time_quota_ms: u64,
        size_quota_bytes: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        log::debug!(
            "starting agility context: time_quota_ms={time_quota_ms} size_quota_bytes={size_quota_bytes}"
        );
        Self {
            inner: Inner::Agile(AgileState {
                database,
                time_quota_ms,
                size_quota_bytes,
                current: Mutex::new(None),
                op_lock: RwLock::new(()),
                create_sync: tokio::sync::Mutex::new(()),
                commit_sync: tokio::sync::Mutex::new(()),
                committing_now: AtomicBool::new(false),
                write_size: AtomicU64::new(0),
            }),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_agile(&self) -> bool {
        matches!(self.inner, Inner::Agile(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::AgilityContextClosed);
        }
        Ok(())
    }

    /// Run one operation against the current transaction, under the
    /// appropriate lock. The read lock is held for as long as the operation's
    /// future runs.
    pub async fn apply<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: FnOnce(Arc<dyn KvTransaction>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.ensure_open()?;
        self.apply_inner(op).await
    }

    /// Same as [`apply`](Self::apply) but usable after `flush_and_close`.
    /// Reserved for teardown paths that must still reach the store (e.g.
    /// clearing a leftover lock cell).
    pub async fn apply_in_recovery_path<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: FnOnce(Arc<dyn KvTransaction>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.apply_inner(op).await
    }

    async fn apply_inner<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: FnOnce(Arc<dyn KvTransaction>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match &self.inner {
            Inner::NonAgile(state) => op(Arc::clone(&state.txn)).await,
            Inner::Agile(state) => {
                let result = {
                    let _read_guard = state.op_lock.read().await;
                    let txn = Self::create_if_needed(state).await?;
                    op(txn).await
                };
                self.commit_if_needed().await?;
                result
            }
        }
    }

    async fn create_if_needed(state: &AgileState) -> Result<Arc<dyn KvTransaction>> {
        if let Some(current) = state.current.lock().as_ref() {
            return Ok(Arc::clone(&current.txn));
        }
        let _create_guard = state.create_sync.lock().await;
        if let Some(current) = state.current.lock().as_ref() {
            return Ok(Arc::clone(&current.txn));
        }
        let txn = state.database.begin().await?;
        *state.current.lock() = Some(CurrentTxn {
            txn: Arc::clone(&txn),
            created_at: Instant::now(),
        });
        Ok(txn)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = key.to_vec();
        self.apply(move |txn| async move { txn.get(&key).await }).await
    }

    pub async fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<KeyValue>> {
        let begin = begin.to_vec();
        let end = end.to_vec();
        self.apply(move |txn| async move { txn.get_range(&begin, &end, limit, reverse).await })
            .await
    }

    /// Buffer a write, tracking its size against the quota. The size is
    /// counted up front so the quota check following this very operation
    /// already sees it.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Inner::Agile(state) = &self.inner {
            state
                .write_size
                .fetch_add((key.len() + value.len()) as u64, Ordering::AcqRel);
        }
        let key = key.to_vec();
        let value = value.to_vec();
        self.apply(move |txn| async move {
            txn.set(&key, &value);
            Ok(())
        })
        .await
    }

    pub async fn clear(&self, key: &[u8]) -> Result<()> {
        let key = key.to_vec();
        self.apply(move |txn| async move {
            txn.clear(&key);
            Ok(())
        })
        .await
    }

    pub async fn clear_range(&self, begin: &[u8], end: &[u8]) -> Result<()> {
        let begin = begin.to_vec();
        let end = end.to_vec();
        self.apply(move |txn| async move {
            txn.clear_range(&begin, &end);
            Ok(())
        })
        .await
    }

    fn should_commit(&self) -> bool {
        let Inner::Agile(state) = &self.inner else {
            return false;
        };
        if state.committing_now.load(Ordering::Acquire) {
            return false;
        }
        let current = state.current.lock();
        let Some(current) = current.as_ref() else {
            return false;
        };
        if state.write_size.load(Ordering::Acquire) > state.size_quota_bytes {
            metrics::increment(&self.metrics.agile_commits_size_quota);
            return true;
        }
        if current.created_at.elapsed().as_millis() as u64 > state.time_quota_ms {
            metrics::increment(&self.metrics.agile_commits_time_quota);
            return true;
        }
        false
    }

    async fn commit_if_needed(&self) -> Result<()> {
        if self.should_commit() {
            self.commit_now().await?;
        }
        Ok(())
    }

    /// Commit and discard the current sub-transaction, if any. No operation
    /// is in flight while this holds the write lock.
    pub async fn commit_now(&self) -> Result<()> {
        let Inner::Agile(state) = &self.inner else {
            return Ok(());
        };
        let _commit_guard = state.commit_sync.lock().await;
        let txn = {
            let current = state.current.lock();
            match current.as_ref() {
                Some(c) => Arc::clone(&c.txn),
                None => return Ok(()),
            }
        };
        state.committing_now.store(true, Ordering::Release);
        let _write_guard = state.op_lock.write().await;
        match txn.commit().await {
            Ok(()) => {
                *state.current.lock() = None;
                state.write_size.store(0, Ordering::Release);
                state.committing_now.store(false, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                // Leave the context stuck until abort_and_reset so no further
                // work lands in a transaction that already failed.
                self.report_commit_failure(state, &err);
                Err(err)
            }
        }
    }

    fn report_commit_failure(&self, state: &AgileState, err: &Error) {
        let age_ms = state
            .current
            .lock()
            .as_ref()
            .map(|c| c.created_at.elapsed().as_millis())
            .unwrap_or(0);
        log::debug!(
            "agility context commit failed: age_ms={age_ms} write_size={} error={err}",
            state.write_size.load(Ordering::Acquire)
        );
    }

    /// Commit the current sub-transaction. The context stays usable.
    pub async fn flush(&self) -> Result<()> {
        self.commit_now().await?;
        log::debug!("flushed agility context");
        Ok(())
    }

    /// Commit and forbid further operations. `flush` afterwards still
    /// succeeds; reads and writes fail.
    pub async fn flush_and_close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.commit_now().await?;
        log::debug!("flushed and closed agility context");
        Ok(())
    }

    /// Discard the current sub-transaction and recover internal state after a
    /// failure. Guards held by operations that were cancelled mid-flight drop
    /// on their own; this path only needs to clear the commit flag and the
    /// dead transaction. The context is not closed, so the caller may continue
    /// with post-failure cleanups.
    pub async fn abort_and_reset(&self) {
        let Inner::Agile(state) = &self.inner else {
            return;
        };
        let _commit_guard = state.commit_sync.lock().await;
        state.committing_now.store(false, Ordering::Release);
        if let Some(current) = state.current.lock().take() {
            current.txn.cancel();
        }
        state.write_size.store(0, Ordering::Release);
        log::debug!("abort and reset agility context");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryDatabase;

    fn agile(db: &MemoryDatabase, time_ms: u64, size: u64) -> AgilityContext {
        AgilityContext::agile(
            Arc::new(db.clone()),
            time_ms,
            size,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_non_agile_passes_through() {
        let db = MemoryDatabase::new();
        let txn = db.begin().await.unwrap();
        let ctx = AgilityContext::non_agile(Arc::clone(&txn), Arc::new(Metrics::new()));

        ctx.set(b"a", b"1").await.unwrap();
        assert_eq!(ctx.get(b"a").await.unwrap(), Some(b"1".to_vec()));

        // flush is a no-op: nothing visible before the caller commits.
        ctx.flush().await.unwrap();
        let other = db.begin().await.unwrap();
        assert_eq!(other.get(b"a").await.unwrap(), None);

        txn.commit().await.unwrap();
        let other = db.begin().await.unwrap();
        assert_eq!(other.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_agile_flush_commits() {
        let db = MemoryDatabase::new();
        let ctx = agile(&db, 60_000, u64::MAX);
        ctx.set(b"a", b"1").await.unwrap();

        let other = db.begin().await.unwrap();
        assert_eq!(other.get(b"a").await.unwrap(), None);

        ctx.flush().await.unwrap();
        let other = db.begin().await.unwrap();
        assert_eq!(other.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_size_quota_triggers_commit() {
        let db = MemoryDatabase::new();
        let ctx = agile(&db, 60_000, 64);

        // Each write is ~40 bytes; the second one trips the quota.
        for i in 0..4u8 {
            ctx.set(&[b'k', i], &[0u8; 32]).await.unwrap();
        }
        assert!(ctx.metrics().snapshot().agile_commits_size_quota >= 1);

        // Everything written before the quota commit is already visible.
        let other = db.begin().await.unwrap();
        assert!(
            !other
                .get_range(b"k", b"l", None, false)
                .await
                .unwrap()
                .is_empty()
        );
        ctx.flush().await.unwrap();
        let other = db.begin().await.unwrap();
        assert_eq!(other.get_range(b"k", b"l", None, false).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_time_quota_triggers_commit() {
        let db = MemoryDatabase::new();
        let ctx = agile(&db, 5, u64::MAX);
        ctx.set(b"a", b"1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ctx.set(b"b", b"2").await.unwrap();
        assert!(ctx.metrics().snapshot().agile_commits_time_quota >= 1);
    }

    #[tokio::test]
    async fn test_flush_and_close_forbids_ops() {
        let db = MemoryDatabase::new();
        let ctx = agile(&db, 60_000, u64::MAX);
        ctx.set(b"a", b"1").await.unwrap();
        ctx.flush_and_close().await.unwrap();

        assert!(matches!(
            ctx.get(b"a").await.unwrap_err(),
            Error::AgilityContextClosed
        ));
        // flush after close still succeeds.
        ctx.flush().await.unwrap();
        // The recovery path bypasses the closed check.
        assert_eq!(
            ctx.apply_in_recovery_path(|txn| async move { txn.get(b"a").await })
                .await
                .unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_abort_and_reset_recovers() {
        let db = MemoryDatabase::new();
        let ctx = agile(&db, 60_000, u64::MAX);
        ctx.set(b"a", b"1").await.unwrap();
        ctx.abort_and_reset().await;

        // The pending write was discarded; the context keeps working.
        ctx.set(b"b", b"2").await.unwrap();
        ctx.flush().await.unwrap();

        let other = db.begin().await.unwrap();
        assert_eq!(other.get(b"a").await.unwrap(), None);
        assert_eq!(other.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    }
}
