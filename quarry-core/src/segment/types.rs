//! Segment catalog: the per-partition list of committed segments.
//!
//! Persisted as a JSON virtual file with a generation suffix. Virtual files
//! are immutable, so every save writes `segments_<g+1>` and deletes
//! `segments_<g>`; load picks the highest generation found in the namespace.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::directories::KvDirectory;
use crate::error::{Error, Result};

const CATALOG_PREFIX: &str = "segments_";
const CATALOG_VERSION: u32 = 1;

/// One committed segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Segment name, `_<n>` in base 36.
    pub name: String,
    /// Documents written into the segment, including deleted ones.
    pub num_docs: u32,
    /// Documents since marked deleted.
    pub deleted_docs: u32,
    /// Liveness file generation; 0 means no deletions and no liveness file.
    pub liveness_gen: u32,
}

impl SegmentEntry {
    pub fn live_docs(&self) -> u32 {
        self.num_docs - self.deleted_docs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentCatalog {
    pub version: u32,
    /// Counter feeding segment names.
    pub next_segment: u64,
    pub segments: Vec<SegmentEntry>,
    /// Catalog file generation; not persisted, derived from the file name.
    #[serde(skip)]
    pub generation: u64,
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

impl SegmentCatalog {
    pub fn new() -> Self {
        Self {
            version: CATALOG_VERSION,
            ..Default::default()
        }
    }

    /// Allocate the next segment name.
    pub fn next_segment_name(&mut self) -> String {
        let name = format!("_{}", base36(self.next_segment));
        self.next_segment += 1;
        name
    }

    pub fn entry(&self, name: &str) -> Option<&SegmentEntry> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut SegmentEntry> {
        self.segments.iter_mut().find(|s| s.name == name)
    }

    pub fn remove(&mut self, names: &[String]) {
        self.segments.retain(|s| !names.contains(&s.name));
    }

    pub async fn load(directory: &Arc<KvDirectory>) -> Result<Self> {
        let mut latest: Option<(u64, String)> = None;
        for name in directory.list_all().await? {
            if let Some(gen) = name
                .strip_prefix(CATALOG_PREFIX)
                .and_then(|suffix| suffix.parse::<u64>().ok())
            {
                if latest.as_ref().map_or(true, |(g, _)| gen > *g) {
                    latest = Some((gen, name));
                }
            }
        }
        let Some((generation, file)) = latest else {
            return Ok(Self::new());
        };
        let raw = directory.open_input(&file).read_all().await?;
        let mut catalog: SegmentCatalog = serde_json::from_slice(&raw)
            .map_err(|e| Error::Corruption(format!("malformed segment catalog: {e}")))?;
        catalog.generation = generation;
        Ok(catalog)
    }

    /// Two-phase save: write the new generation under a pending name, rename
    /// it live (a metadata-only operation), then drop the old generation.
    pub async fn save(&mut self, directory: &Arc<KvDirectory>) -> Result<()> {
        let next_gen = self.generation + 1;
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Internal(format!("catalog serialization failed: {e}")))?;
        let pending = format!("pending_{CATALOG_PREFIX}{next_gen}");
        let mut output = directory.create_output(&pending).await?;
        output.write_all(&raw).await?;
        output.close().await?;
        directory
            .rename(&pending, &format!("{CATALOG_PREFIX}{next_gen}"))
            .await?;
        if self.generation > 0 {
            directory
                .delete_file(&format!("{CATALOG_PREFIX}{}", self.generation))
                .await?;
        }
        self.generation = next_gen;
        Ok(())
    }
}
