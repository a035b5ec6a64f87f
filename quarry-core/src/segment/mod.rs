//! Segments: immutable units of the inverted index within one partition.

mod builder;
mod format;
mod merge_policy;
mod merger;
mod reader;
mod types;

pub use builder::SegmentBuilder;
pub use format::{
    decode_liveness, decode_postings, encode_liveness, encode_postings, liveness_file_name,
    postings_file_name, PostingsMap,
};
pub use merge_policy::{MergeCandidate, MergePolicy, NoMergePolicy, SegmentInfo, TieredMergePolicy};
pub use merger::SegmentMerger;
pub use reader::SegmentReader;
pub use types::{SegmentCatalog, SegmentEntry};
