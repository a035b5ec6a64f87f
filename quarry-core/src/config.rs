//! Index configuration: the option surface recognized by the persistence core.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default per-partition document cap.
pub const DEFAULT_PARTITION_HIGH_WATERMARK: i64 = 400_000;

/// Default wall-time quota for one agile sub-transaction.
pub const DEFAULT_AGILE_TIME_QUOTA_MS: u64 = 1_000;

/// Default written-bytes quota for one agile sub-transaction.
pub const DEFAULT_AGILE_SIZE_QUOTA_BYTES: u64 = 900_000;

/// Default file-lock staleness window.
pub const DEFAULT_LOCK_TIME_WINDOW_MS: i64 = 10 * 60 * 1_000;

/// Minimum accepted lock window; anything lower falls back to the default.
pub const MIN_LOCK_TIME_WINDOW_MS: i64 = 10 * 1_000;

/// Default virtual-file block size.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Store one KV per document instead of the file-based stored-fields file.
    pub optimized_stored_fields_enabled: bool,
    /// Keep a KV-resident primary-key → (segment, doc) index. When disabled,
    /// deletes fall back to scanning segments.
    pub primary_key_index_v2_enabled: bool,
    /// Compress virtual-file blocks.
    pub index_compression_enabled: bool,
    /// Virtual-file block size in bytes.
    pub block_size: usize,
    /// Dot-separated record field holding the partitioning timestamp.
    /// `None` disables partitioning.
    pub partition_by_field_name: Option<String>,
    /// Record field whose single value forms the grouping key. `None` keeps
    /// all documents in one group.
    pub group_by_field_name: Option<String>,
    /// Per-partition document cap.
    pub partition_high_watermark: i64,
    /// Documents moved per repartition step.
    pub repartition_document_count: usize,
    /// Hard cap on documents moved in one rebalance pass.
    pub max_documents_to_move: usize,
    /// Segments per tier before the merge policy fires. Must be >= 2.0.
    pub merge_segments_per_tier: f64,
    /// Agile commit wall-time quota in milliseconds.
    pub agile_commit_time_quota_ms: u64,
    /// Agile commit written-bytes quota.
    pub agile_commit_size_quota_bytes: u64,
    /// File-lock staleness window in milliseconds (floored at 10 s).
    pub file_lock_time_window_ms: i64,
    /// Run a merge pass on every commit.
    pub auto_merge_enabled: bool,
    /// Run the rebalancer on every commit.
    pub auto_repartition_enabled: bool,
    /// Block-cache budget in bytes.
    pub block_cache_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            optimized_stored_fields_enabled: true,
            primary_key_index_v2_enabled: true,
            index_compression_enabled: true,
            block_size: DEFAULT_BLOCK_SIZE,
            partition_by_field_name: None,
            group_by_field_name: None,
            partition_high_watermark: DEFAULT_PARTITION_HIGH_WATERMARK,
            repartition_document_count: 1_000,
            max_documents_to_move: 10_000,
            merge_segments_per_tier: 10.0,
            agile_commit_time_quota_ms: DEFAULT_AGILE_TIME_QUOTA_MS,
            agile_commit_size_quota_bytes: DEFAULT_AGILE_SIZE_QUOTA_BYTES,
            file_lock_time_window_ms: DEFAULT_LOCK_TIME_WINDOW_MS,
            auto_merge_enabled: true,
            auto_repartition_enabled: false,
            block_cache_bytes: 64 * 1024 * 1024,
        }
    }
}

impl IndexConfig {
    /// Validate option combinations that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.partition_by_field_name {
            if name.trim().is_empty() {
                return Err(Error::InvalidArgument(
                    "partition timestamp field name is blank".into(),
                ));
            }
        }
        if self.merge_segments_per_tier < 2.0 {
            return Err(Error::InvalidArgument(format!(
                "merge_segments_per_tier must be >= 2.0, got {}",
                self.merge_segments_per_tier
            )));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidArgument("block_size must be non-zero".into()));
        }
        Ok(())
    }

    /// Effective lock window: values under the floor fall back to the default.
    pub fn effective_lock_window_ms(&self) -> i64 {
        if self.file_lock_time_window_ms > MIN_LOCK_TIME_WINDOW_MS {
            self.file_lock_time_window_ms
        } else {
            DEFAULT_LOCK_TIME_WINDOW_MS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        IndexConfig::default().validate().unwrap();
    }

    #[test]
    fn test_blank_partition_field_rejected() {
        let config = IndexConfig {
            partition_by_field_name: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_merge_tier_floor() {
        let config = IndexConfig {
            merge_segments_per_tier: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_window_floor() {
        let config = IndexConfig {
            file_lock_time_window_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(config.effective_lock_window_ms(), DEFAULT_LOCK_TIME_WINDOW_MS);

        let config = IndexConfig {
            file_lock_time_window_ms: 30_000,
            ..Default::default()
        };
        assert_eq!(config.effective_lock_window_ms(), 30_000);
    }
}
