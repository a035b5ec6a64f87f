//! Process-local counters for the persistence core.
//!
//! Shared by the directory, codec, agility context, lock, and partitioner so
//! tests (and operators, through periodic dumps) can observe commit-quota
//! trips, stored-fields traffic, and rebalance activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters are monotonically increasing; readers use [`Metrics::snapshot`].
#[derive(Debug, Default)]
pub struct Metrics {
    /// Single-document stored-fields fetches awaited.
    pub wait_get_stored_fields: AtomicU64,
    /// Bytes written through the stored-fields codec.
    pub write_stored_fields_bytes: AtomicU64,
    /// Stored-fields ranges deleted (one tick per segment dropped).
    pub delete_stored_fields: AtomicU64,
    /// Agile sub-transaction commits triggered by the size quota.
    pub agile_commits_size_quota: AtomicU64,
    /// Agile sub-transaction commits triggered by the time quota.
    pub agile_commits_time_quota: AtomicU64,
    /// Lock-cell writes awaited (acquire + heartbeat).
    pub wait_file_lock_set: AtomicU64,
    /// Lock-cell clears awaited.
    pub wait_file_lock_clear: AtomicU64,
    /// Nanoseconds spent moving documents between partitions.
    pub rebalance_partition_nanos: AtomicU64,
    /// Documents moved between partitions.
    pub rebalance_partition_docs: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            wait_get_stored_fields: self.wait_get_stored_fields.load(Ordering::Relaxed),
            write_stored_fields_bytes: self.write_stored_fields_bytes.load(Ordering::Relaxed),
            delete_stored_fields: self.delete_stored_fields.load(Ordering::Relaxed),
            agile_commits_size_quota: self.agile_commits_size_quota.load(Ordering::Relaxed),
            agile_commits_time_quota: self.agile_commits_time_quota.load(Ordering::Relaxed),
            wait_file_lock_set: self.wait_file_lock_set.load(Ordering::Relaxed),
            wait_file_lock_clear: self.wait_file_lock_clear.load(Ordering::Relaxed),
            rebalance_partition_nanos: self.rebalance_partition_nanos.load(Ordering::Relaxed),
            rebalance_partition_docs: self.rebalance_partition_docs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub wait_get_stored_fields: u64,
    pub write_stored_fields_bytes: u64,
    pub delete_stored_fields: u64,
    pub agile_commits_size_quota: u64,
    pub agile_commits_time_quota: u64,
    pub wait_file_lock_set: u64,
    pub wait_file_lock_clear: u64,
    pub rebalance_partition_nanos: u64,
    pub rebalance_partition_docs: u64,
}

/// Bump a counter by one.
pub(crate) fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bump a counter by a measured size or duration.
pub(crate) fn add(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}
