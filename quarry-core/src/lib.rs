//! Quarry: a segment-oriented full-text index persisted in a transactional
//! ordered key-value store.
//!
//! Instead of files on a local disk, every byte of the index lives in KV
//! entries under an index subspace:
//! - a virtual-file directory chunks segment files into cached, optionally
//!   compressed blocks
//! - stored fields are one KV entry per document, so a fetch is a point read
//!   and a merge is a range scan
//! - an agility context splits long merges across auto-committing
//!   sub-transactions
//! - a heartbeat file lock serializes writers per partition across processes
//! - a time-based partitioner shards one logical index into bounded physical
//!   sub-indexes and rebalances them as they fill

pub mod codec;
pub mod config;
pub mod directories;
pub mod dsl;
pub mod error;
pub mod index;
pub mod kv;
pub mod metrics;
pub mod partition;
pub mod segment;
pub mod tuple;

pub use config::IndexConfig;
pub use directories::{
    AgilityContext, BlockCache, DirectoryLock, FileReference, KvDirectory, KvIndexInput,
    KvIndexOutput, LazyHandle,
};
pub use dsl::{Document, Field, FieldType, FieldValue, Record, Schema, SchemaBuilder, Sort};
pub use error::{Error, Result};
pub use index::{IndexMaintainer, PartitionWriter};
pub use kv::{KvDatabase, KvTransaction, MemoryDatabase};
pub use metrics::{Metrics, MetricsSnapshot};
pub use partition::{validate_partition_metadata, PartitionMeta, Partitioner};
pub use segment::{SegmentCatalog, SegmentEntry, SegmentReader};
pub use tuple::{Element, Subspace, Tuple};
