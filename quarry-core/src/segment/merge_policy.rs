//! Merge policies for background segment merging.
//!
//! A policy looks at the live segments of one partition and proposes groups
//! to rewrite into single segments. The default is a tiered policy: segments
//! are sorted by live size and grouped greedily while they stay within a
//! size ratio of each other, so a large settled segment is not rewritten just
//! to absorb a few small ones.

use std::fmt::Debug;

use crate::error::{Error, Result};

/// Segment facts a policy decides on.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub name: String,
    /// Live documents (deletions already subtracted).
    pub num_docs: u32,
    /// Deleted documents still physically present.
    pub deleted_docs: u32,
}

#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub segment_names: Vec<String>,
}

pub trait MergePolicy: Send + Sync + Debug {
    /// All eligible merge groups. Groups never share a segment.
    fn find_merges(&self, segments: &[SegmentInfo]) -> Vec<MergeCandidate>;
}

/// Never merges.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _segments: &[SegmentInfo]) -> Vec<MergeCandidate> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    /// Segments accumulated in one tier before a merge fires. Fractional
    /// values are allowed for tuning; the effective group size is the ceiling.
    pub segments_per_tier: f64,
    /// Hard cap on segments rewritten in one merge.
    pub max_merge_at_once: usize,
    /// Size ratio between neighbors within one group.
    pub tier_factor: f64,
    /// Hard cap on documents in one merge output.
    pub max_merged_docs: u32,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self {
            segments_per_tier: 10.0,
            max_merge_at_once: 10,
            tier_factor: 10.0,
            max_merged_docs: 5_000_000,
        }
    }
}

impl TieredMergePolicy {
    pub fn with_segments_per_tier(segments_per_tier: f64) -> Result<Self> {
        if segments_per_tier < 2.0 {
            return Err(Error::InvalidArgument(format!(
                "segments_per_tier must be >= 2.0, got {segments_per_tier}"
            )));
        }
        Ok(Self {
            segments_per_tier,
            ..Default::default()
        })
    }

    fn min_group(&self) -> usize {
        (self.segments_per_tier.ceil() as usize).max(2)
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(&self, segments: &[SegmentInfo]) -> Vec<MergeCandidate> {
        if segments.len() < 2 {
            return Vec::new();
        }
        let mut sorted: Vec<&SegmentInfo> = segments.iter().collect();
        sorted.sort_by_key(|s| s.num_docs);

        let max_ratio = self.tier_factor as u64;
        let mut used = vec![false; sorted.len()];
        let mut candidates = Vec::new();

        let mut start = 0;
        loop {
            while start < sorted.len() && used[start] {
                start += 1;
            }
            if start >= sorted.len() {
                break;
            }

            let mut group = vec![start];
            let mut total_docs = sorted[start].num_docs as u64;
            for next in (start + 1)..sorted.len() {
                if used[next] || group.len() >= self.max_merge_at_once {
                    break;
                }
                let next_docs = sorted[next].num_docs as u64;
                if total_docs + next_docs > self.max_merged_docs as u64 {
                    break;
                }
                if next_docs > total_docs.max(1) * max_ratio {
                    break;
                }
                group.push(next);
                total_docs += next_docs;
            }

            if group.len() >= self.min_group() {
                for &i in &group {
                    used[i] = true;
                }
                candidates.push(MergeCandidate {
                    segment_names: group.iter().map(|&i| sorted[i].name.clone()).collect(),
                });
            }
            start += 1;
        }
        candidates
    }
}
