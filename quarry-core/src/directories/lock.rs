//! Cross-actor advisory lock stored in a KV cell.
//!
//! The cell holds `(owner_uuid, acquired_at_ms)`. A holder must heartbeat
//! within the time window or any other actor may steal the lock; a crashed
//! holder therefore never deadlocks the partition. The lock cell deliberately
//! outlives any single KV transaction: it is cleared explicitly, not by
//! transaction teardown.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};
use crate::tuple::Tuple;

use super::agility::AgilityContext;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn pack_lock_value(uuid: Uuid, timestamp_ms: i64) -> Vec<u8> {
    Tuple::new().push_uuid(uuid).push_int(timestamp_ms).pack()
}

fn parse_lock_value(value: &[u8]) -> Option<(Uuid, i64)> {
    let tuple = Tuple::unpack(value).ok()?;
    let uuid = tuple.get_uuid(0).ok()?;
    let timestamp = tuple.get_int(1).ok()?;
    Some((uuid, timestamp))
}

/// A held directory lock. Obtained through
/// [`KvDirectory::obtain_lock`](super::KvDirectory::obtain_lock).
pub struct DirectoryLock {
    agility: Arc<AgilityContext>,
    lock_name: String,
    key: Vec<u8>,
    self_uuid: Uuid,
    timestamp_ms: AtomicI64,
    time_window_ms: i64,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryLock")
            .field("lock_name", &self.lock_name)
            .field("self_uuid", &self.self_uuid)
            .finish()
    }
}

impl DirectoryLock {
    /// Acquire the lock or fail fast if another actor holds it within the
    /// window. The acquisition is committed before this returns.
    pub(crate) async fn obtain(
        agility: Arc<AgilityContext>,
        metrics: Arc<Metrics>,
        lock_name: String,
        key: Vec<u8>,
        time_window_ms: i64,
    ) -> Result<Self> {
        let lock = Self {
            agility,
            lock_name,
            key,
            self_uuid: Uuid::new_v4(),
            timestamp_ms: AtomicI64::new(0),
            time_window_ms,
            closed: AtomicBool::new(false),
            metrics,
        };
        log::debug!(
            "attempting to take file lock {} uuid={}",
            lock.lock_name,
            lock.self_uuid
        );
        lock.set_cell(false).await?;
        lock.agility.flush().await?;
        log::debug!("took file lock {} uuid={}", lock.lock_name, lock.self_uuid);
        Ok(lock)
    }

    pub fn name(&self) -> &str {
        &self.lock_name
    }

    pub fn owner_uuid(&self) -> Uuid {
        self.self_uuid
    }

    /// Heartbeat. Verifies we still own the cell and refreshes its timestamp.
    /// Call before every sensitive operation.
    pub async fn ensure_valid(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed(format!(
                "lock instance already released: {self}",
            )));
        }
        let now = now_ms();
        if now > self.timestamp_ms.load(Ordering::Acquire) + self.time_window_ms {
            return Err(Error::AlreadyClosed(format!("lock is too old: {self} now={now}")));
        }
        self.set_cell(true).await
    }

    /// Write `(self_uuid, now)` into the cell after validating the existing
    /// holder: for a fresh acquisition the cell must be absent or stale; for a
    /// heartbeat it must still carry our uuid.
    async fn set_cell(&self, is_heartbeat: bool) -> Result<()> {
        metrics::increment(&self.metrics.wait_file_lock_set);
        let now = now_ms();
        let key = self.key.clone();
        let value = pack_lock_value(self.self_uuid, now);
        self.agility
            .apply(|txn| async move {
                let existing = txn.get(&key).await?;
                if is_heartbeat {
                    self.check_heartbeat(existing.as_deref())?;
                } else {
                    self.check_new_lock(existing.as_deref(), now)?;
                }
                txn.set(&key, &value);
                Ok(())
            })
            .await?;
        self.timestamp_ms.store(now, Ordering::Release);
        Ok(())
    }

    fn check_heartbeat(&self, existing: Option<&[u8]>) -> Result<()> {
        let Some((uuid, timestamp)) = existing.and_then(parse_lock_value) else {
            return Err(Error::AlreadyClosed(format!("lock cell was deleted: {self}")));
        };
        if uuid != self.self_uuid {
            return Err(Error::AlreadyClosed(format!(
                "lock taken over by {uuid} at {timestamp}: {self}"
            )));
        }
        Ok(())
    }

    fn check_new_lock(&self, existing: Option<&[u8]>, now: i64) -> Result<()> {
        let Some((uuid, timestamp)) = existing.and_then(parse_lock_value) else {
            return Ok(());
        };
        if timestamp > now - self.time_window_ms && timestamp < now + self.time_window_ms {
            return Err(Error::LockFailed(format!(
                "already locked by another entity: holder={uuid} held_at={timestamp} name={}",
                self.lock_name
            )));
        }
        // Stale or implausibly far in the future: steal it.
        log::warn!(
            "discarding an existing old file lock: holder={uuid} held_at={timestamp} name={}",
            self.lock_name
        );
        Ok(())
    }

    /// Release the lock. The cell is cleared only if we still own it.
    pub async fn release(&self) -> Result<()> {
        metrics::increment(&self.metrics.wait_file_lock_clear);
        let key = self.key.clone();
        let result = self
            .agility
            .apply(|txn| async move {
                let existing = txn.get(&key).await?;
                self.check_heartbeat(existing.as_deref())?;
                txn.clear(&key);
                Ok(())
            })
            .await;
        self.flush_and_mark_closed().await?;
        result
    }

    /// Recovery path for abnormal teardown: clear the cell if and only if it
    /// still carries our uuid. Usable after the agility context was closed.
    pub async fn clear_if_locked(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        metrics::increment(&self.metrics.wait_file_lock_clear);
        let key = self.key.clone();
        let self_uuid = self.self_uuid;
        let op = |txn: Arc<dyn crate::kv::KvTransaction>| async move {
            let existing = txn.get(&key).await?;
            if let Some((uuid, _)) = existing.as_deref().and_then(parse_lock_value) {
                if uuid == self_uuid {
                    txn.clear(&key);
                    log::debug!("cleared file lock in recovery path");
                }
            }
            Ok(())
        };
        if self.agility.is_closed() {
            self.agility.apply_in_recovery_path(op).await?;
        } else {
            self.agility.apply(op).await?;
        }
        self.flush_and_mark_closed().await
    }

    /// Always flush before declaring this lock closed, so a failed commit
    /// cannot be silently skipped past.
    async fn flush_and_mark_closed(&self) -> Result<()> {
        self.agility.flush().await?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Display for DirectoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{lock name={} uuid={} time_ms={}}}",
            self.lock_name,
            self.self_uuid,
            self.timestamp_ms.load(Ordering::Relaxed)
        )
    }
}
