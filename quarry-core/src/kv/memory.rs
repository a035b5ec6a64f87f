//! In-memory transactional ordered KV store.
//!
//! Embedded backend used by tests and small deployments. Committed state is a
//! persistent snapshot behind an `Arc`; transactions read their snapshot plus
//! a local overlay and validate their read set optimistically at commit.
//! Tombstones are retained so deletions participate in conflict detection.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

use super::{KeyValue, KvDatabase, KvTransaction};

type Version = u64;

#[derive(Debug, Clone)]
struct Entry {
    version: Version,
    /// `None` marks a deletion that still conflicts with concurrent readers.
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Committed {
    version: Version,
    map: Arc<BTreeMap<Vec<u8>, Entry>>,
}

/// An in-memory [`KvDatabase`].
#[derive(Debug, Default, Clone)]
pub struct MemoryDatabase {
    committed: Arc<RwLock<Committed>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys in the committed state. Test hook.
    pub fn num_keys(&self) -> usize {
        self.committed
            .read()
            .map
            .values()
            .filter(|e| e.value.is_some())
            .count()
    }
}

#[async_trait]
impl KvDatabase for MemoryDatabase {
    async fn begin(&self) -> Result<Arc<dyn KvTransaction>> {
        let committed = self.committed.read();
        Ok(Arc::new(MemoryTransaction {
            committed: Arc::clone(&self.committed),
            snapshot: Arc::clone(&committed.map),
            read_version: committed.version,
            state: Mutex::new(TxnState::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct TxnState {
    /// Local writes: `Some` = set, `None` = single-key clear.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Ranges cleared by this transaction, applied before the overlay.
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
    read_keys: Vec<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    closed: bool,
}

struct MemoryTransaction {
    committed: Arc<RwLock<Committed>>,
    snapshot: Arc<BTreeMap<Vec<u8>, Entry>>,
    read_version: Version,
    state: Mutex<TxnState>,
}

impl MemoryTransaction {
    fn ensure_open(state: &TxnState) -> Result<()> {
        if state.closed {
            return Err(Error::TransactionClosed(
                "transaction already committed or cancelled".into(),
            ));
        }
        Ok(())
    }

    fn in_cleared(state: &TxnState, key: &[u8]) -> bool {
        state
            .cleared
            .iter()
            .any(|(begin, end)| key >= begin.as_slice() && key < end.as_slice())
    }

    fn snapshot_get(&self, state: &TxnState, key: &[u8]) -> Option<Vec<u8>> {
        if Self::in_cleared(state, key) {
            return None;
        }
        self.snapshot.get(key).and_then(|e| e.value.clone())
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.read_keys.push(key.to_vec());
        if let Some(local) = state.overlay.get(key) {
            return Ok(local.clone());
        }
        Ok(self.snapshot_get(&state, key))
    }

    async fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<KeyValue>> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.read_ranges.push((begin.to_vec(), end.to_vec()));

        let bounds = (Bound::Included(begin.to_vec()), Bound::Excluded(end.to_vec()));
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, entry) in self.snapshot.range::<Vec<u8>, _>(bounds.clone()) {
            if Self::in_cleared(&state, key) {
                continue;
            }
            if let Some(value) = &entry.value {
                merged.insert(key.clone(), value.clone());
            }
        }
        for (key, local) in state.overlay.range::<Vec<u8>, _>(bounds) {
            match local {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        let limit = limit.unwrap_or(usize::MAX);
        let result = if reverse {
            merged.into_iter().rev().take(limit).collect()
        } else {
            merged.into_iter().take(limit).collect()
        };
        Ok(result)
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.overlay.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn clear(&self, key: &[u8]) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.overlay.insert(key.to_vec(), None);
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let doomed: Vec<Vec<u8>> = state
            .overlay
            .range::<Vec<u8>, _>((Bound::Included(begin.to_vec()), Bound::Excluded(end.to_vec())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.overlay.remove(&key);
        }
        state.cleared.push((begin.to_vec(), end.to_vec()));
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.closed = true;

        let mut committed = self.committed.write();

        // Optimistic validation: any key we read that was rewritten by a
        // later commit invalidates this transaction.
        for key in &state.read_keys {
            if let Some(entry) = committed.map.get(key) {
                if entry.version > self.read_version {
                    return Err(Error::CommitConflict);
                }
            }
        }
        for (begin, end) in &state.read_ranges {
            let bounds = (Bound::Included(begin.clone()), Bound::Excluded(end.clone()));
            for (_, entry) in committed.map.range::<Vec<u8>, _>(bounds) {
                if entry.version > self.read_version {
                    return Err(Error::CommitConflict);
                }
            }
        }

        if state.overlay.is_empty() && state.cleared.is_empty() {
            return Ok(());
        }

        let version = committed.version + 1;
        let mut map = (*committed.map).clone();
        for (begin, end) in state.cleared.drain(..) {
            let bounds = (Bound::Included(begin), Bound::Excluded(end));
            let doomed: Vec<Vec<u8>> = map
                .range::<Vec<u8>, _>(bounds)
                .filter(|(_, e)| e.value.is_some())
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                map.insert(key, Entry { version, value: None });
            }
        }
        for (key, value) in std::mem::take(&mut state.overlay) {
            map.insert(key, Entry { version, value });
        }

        committed.version = version;
        committed.map = Arc::new(map);
        Ok(())
    }

    fn cancel(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_commit() {
        let db = MemoryDatabase::new();
        let txn = db.begin().await.unwrap();
        txn.set(b"a", b"1");
        assert_eq!(txn.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        txn.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        assert_eq!(txn.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let db = MemoryDatabase::new();
        let setup = db.begin().await.unwrap();
        setup.set(b"a", b"1");
        setup.commit().await.unwrap();

        let reader = db.begin().await.unwrap();
        let writer = db.begin().await.unwrap();
        writer.set(b"a", b"2");
        writer.commit().await.unwrap();

        // The reader still sees its snapshot.
        assert_eq!(reader.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_read_write_conflict() {
        let db = MemoryDatabase::new();
        let setup = db.begin().await.unwrap();
        setup.set(b"a", b"1");
        setup.commit().await.unwrap();

        let t1 = db.begin().await.unwrap();
        let t2 = db.begin().await.unwrap();

        // t1 reads `a`, t2 rewrites it and commits first.
        t1.get(b"a").await.unwrap();
        t1.set(b"b", b"from-t1");
        t2.set(b"a", b"2");
        t2.commit().await.unwrap();

        let err = t1.commit().await.unwrap_err();
        assert!(matches!(err, Error::CommitConflict));
    }

    #[tokio::test]
    async fn test_blind_writes_do_not_conflict() {
        let db = MemoryDatabase::new();
        let t1 = db.begin().await.unwrap();
        let t2 = db.begin().await.unwrap();
        t1.set(b"a", b"1");
        t2.set(b"a", b"2");
        t1.commit().await.unwrap();
        t2.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        assert_eq!(txn.get(b"a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_range_scan_and_clear_range() {
        let db = MemoryDatabase::new();
        let txn = db.begin().await.unwrap();
        for i in 0..5u8 {
            txn.set(&[b'k', i], &[i]);
        }
        txn.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        let all = txn.get_range(b"k", b"l", None, false).await.unwrap();
        assert_eq!(all.len(), 5);

        let last_two = txn.get_range(b"k", b"l", Some(2), true).await.unwrap();
        assert_eq!(last_two[0].0, vec![b'k', 4]);
        assert_eq!(last_two[1].0, vec![b'k', 3]);

        txn.clear_range(&[b'k', 1], &[b'k', 4]);
        let remaining = txn.get_range(b"k", b"l", None, false).await.unwrap();
        assert_eq!(remaining.len(), 2);
        txn.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        let remaining = txn.get_range(b"k", b"l", None, false).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_set_after_clear_range_wins() {
        let db = MemoryDatabase::new();
        let txn = db.begin().await.unwrap();
        txn.set(b"k1", b"old");
        txn.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        txn.clear_range(b"k", b"l");
        txn.set(b"k1", b"new");
        assert_eq!(txn.get(b"k1").await.unwrap(), Some(b"new".to_vec()));
        txn.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        assert_eq!(txn.get(b"k1").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_use_after_commit_fails() {
        let db = MemoryDatabase::new();
        let txn = db.begin().await.unwrap();
        txn.commit().await.unwrap();
        assert!(matches!(
            txn.get(b"a").await.unwrap_err(),
            Error::TransactionClosed(_)
        ));
    }
}
