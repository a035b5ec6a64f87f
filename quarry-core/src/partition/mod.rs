//! Time-based logical partitioning.
//!
//! One logical index is sharded into partitions, each an independent physical
//! sub-index, keyed by a monotone timestamp field. Partition metadata lives
//! under `IDX · G · 0 · fromTs`; because the key *is* the `from` boundary,
//! moving a boundary clears the old key and writes a new one. Partition data
//! (the virtual directory) lives under `IDX · G · 1 · id`.
//!
//! Assignment on insert picks the partition with the greatest `from <=
//! timestamp`; a document older than a full partition opens a fresh partition
//! instead, so the full one does not immediately need rebalancing.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::IndexConfig;
use crate::directories::AgilityContext;
use crate::dsl::{compile_field_path, evaluate_i64_path, FieldPath, Record, Schema, Sort};
use crate::error::{Error, Result};
use crate::tuple::{Subspace, Tuple};

/// Tag of the per-group partition metadata subspace.
pub const PARTITION_META_SUBSPACE: i64 = 0;
/// Tag of the per-group partition data subspace.
pub const PARTITION_DATA_SUBSPACE: i64 = 1;

const META_VERSION: u8 = 1;

/// Per-partition metadata record `{id, count, from, to}`.
///
/// `from` and `to` are packed timestamp tuples bounding the documents inside;
/// `count` is the exact number of physically resident documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub id: i32,
    pub count: i64,
    pub from: Vec<u8>,
    pub to: Vec<u8>,
}

impl PartitionMeta {
    pub fn new(timestamp: i64, id: i32) -> Self {
        let packed = Tuple::new().push_int(timestamp).pack();
        Self {
            id,
            count: 0,
            from: packed.clone(),
            to: packed,
        }
    }

    pub fn from_ts(&self) -> Result<i64> {
        Tuple::unpack(&self.from)?.get_int(0)
    }

    pub fn to_ts(&self) -> Result<i64> {
        Tuple::unpack(&self.to)?.get_int(0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21 + self.from.len() + self.to.len());
        buf.push(META_VERSION);
        let mut scratch = [0u8; 8];
        LittleEndian::write_i32(&mut scratch[..4], self.id);
        buf.extend_from_slice(&scratch[..4]);
        LittleEndian::write_i64(&mut scratch, self.count);
        buf.extend_from_slice(&scratch);
        LittleEndian::write_u32(&mut scratch[..4], self.from.len() as u32);
        buf.extend_from_slice(&scratch[..4]);
        buf.extend_from_slice(&self.from);
        LittleEndian::write_u32(&mut scratch[..4], self.to.len() as u32);
        buf.extend_from_slice(&scratch[..4]);
        buf.extend_from_slice(&self.to);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let corrupt = || Error::Corruption("malformed partition metadata".into());
        if data.len() < 21 || data[0] != META_VERSION {
            return Err(corrupt());
        }
        let id = LittleEndian::read_i32(&data[1..5]);
        let count = LittleEndian::read_i64(&data[5..13]);
        let from_len = LittleEndian::read_u32(&data[13..17]) as usize;
        let from_end = 17 + from_len;
        if data.len() < from_end + 4 {
            return Err(corrupt());
        }
        let from = data[17..from_end].to_vec();
        let to_len = LittleEndian::read_u32(&data[from_end..from_end + 4]) as usize;
        let to_end = from_end + 4 + to_len;
        if data.len() != to_end {
            return Err(corrupt());
        }
        let to = data[from_end + 4..to_end].to_vec();
        Ok(Self { id, count, from, to })
    }
}

/// Where one partition's virtual directory lives.
pub fn partition_data_subspace(
    index_subspace: &Subspace,
    group: &Tuple,
    partition: Option<i32>,
) -> Subspace {
    let mut tuple = group.clone().push_int(PARTITION_DATA_SUBSPACE);
    if let Some(id) = partition {
        tuple = tuple.push_int(id as i64);
    }
    index_subspace.subspace(&tuple)
}

/// Manages partition metadata for one logical index.
pub struct Partitioner {
    subspace: Subspace,
    schema: Arc<Schema>,
    field_name: Option<String>,
    field_path: Option<FieldPath>,
    high_watermark: i64,
}

impl Partitioner {
    pub fn new(subspace: Subspace, schema: Arc<Schema>, config: &IndexConfig) -> Result<Self> {
        let field_name = config.partition_by_field_name.clone();
        if let Some(name) = &field_name {
            if name.trim().is_empty() {
                return Err(Error::InvalidArgument(
                    "partition timestamp field name is blank".into(),
                ));
            }
        }
        let field_path = field_name.as_deref().map(compile_field_path);
        Ok(Self {
            subspace,
            schema,
            field_name,
            field_path,
            high_watermark: config.partition_high_watermark,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.field_path.is_some()
    }

    pub fn timestamp_field_name(&self) -> Option<&str> {
        self.field_name.as_deref()
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark
    }

    /// The partitioning timestamp of a record.
    pub fn timestamp_of(&self, record: &Record) -> Result<i64> {
        let path = self
            .field_path
            .as_ref()
            .ok_or_else(|| Error::Internal("partitioning is not enabled".into()))?;
        evaluate_i64_path(&self.schema, &record.document, path)
    }

    fn meta_subspace(&self, group: &Tuple) -> Subspace {
        self.subspace
            .subspace(&group.clone().push_int(PARTITION_META_SUBSPACE))
    }

    fn meta_key(&self, group: &Tuple, timestamp: i64) -> Vec<u8> {
        self.subspace.pack(
            &group
                .clone()
                .push_int(PARTITION_META_SUBSPACE)
                .push_int(timestamp),
        )
    }

    pub async fn save_partition_metadata(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        meta: &PartitionMeta,
    ) -> Result<()> {
        let key = self.meta_key(group, meta.from_ts()?);
        ctx.set(&key, &meta.encode()).await
    }

    /// The partition with the greatest `from` at or below `timestamp`
    /// (`inclusive`), or strictly below it (`!inclusive`).
    async fn find_partition_at(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        timestamp: i64,
        inclusive: bool,
    ) -> Result<Option<PartitionMeta>> {
        let (begin, _) = self.meta_subspace(group).range();
        let bound = if inclusive {
            timestamp.saturating_add(1)
        } else {
            timestamp
        };
        let end = self.meta_key(group, bound);
        let entries = ctx.get_range(&begin, &end, Some(1), true).await?;
        entries
            .first()
            .map(|(_, value)| PartitionMeta::decode(value))
            .transpose()
    }

    /// Partition containing strictly-older timestamps; used to find the
    /// destination of re-partitioned documents.
    pub async fn find_destination(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        timestamp: i64,
    ) -> Result<Option<PartitionMeta>> {
        self.find_partition_at(ctx, group, timestamp, false).await
    }

    async fn edge_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        newest: bool,
    ) -> Result<Option<PartitionMeta>> {
        let (begin, end) = self.meta_subspace(group).range();
        let entries = ctx.get_range(&begin, &end, Some(1), newest).await?;
        entries
            .first()
            .map(|(_, value)| PartitionMeta::decode(value))
            .transpose()
    }

    pub async fn oldest_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
    ) -> Result<Option<PartitionMeta>> {
        self.edge_partition(ctx, group, false).await
    }

    pub async fn newest_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
    ) -> Result<Option<PartitionMeta>> {
        self.edge_partition(ctx, group, true).await
    }

    /// The next partition older than the one starting at `from_ts`.
    pub async fn next_older_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        from_ts: i64,
    ) -> Result<Option<PartitionMeta>> {
        let (begin, _) = self.meta_subspace(group).range();
        let end = self.meta_key(group, from_ts);
        let entries = ctx.get_range(&begin, &end, Some(1), true).await?;
        entries
            .first()
            .map(|(_, value)| PartitionMeta::decode(value))
            .transpose()
    }

    /// The next partition newer than the one starting at `from_ts`.
    pub async fn next_newer_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        from_ts: i64,
    ) -> Result<Option<PartitionMeta>> {
        let mut begin = self.meta_key(group, from_ts);
        begin.push(0x00);
        let (_, end) = self.meta_subspace(group).range();
        let entries = ctx.get_range(&begin, &end, Some(1), false).await?;
        entries
            .first()
            .map(|(_, value)| PartitionMeta::decode(value))
            .transpose()
    }

    /// All partition metadata of a group, oldest first.
    pub async fn all_partitions(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
    ) -> Result<Vec<PartitionMeta>> {
        let (begin, end) = self.meta_subspace(group).range();
        let entries = ctx.get_range(&begin, &end, None, false).await?;
        entries
            .iter()
            .map(|(_, value)| PartitionMeta::decode(value))
            .collect()
    }

    pub async fn partition_by_id(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        id: i32,
    ) -> Result<Option<PartitionMeta>> {
        Ok(self
            .all_partitions(ctx, group)
            .await?
            .into_iter()
            .find(|meta| meta.id == id))
    }

    /// Assign a partition for an insert (`create_if_not_exists`) or a delete.
    async fn assign_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        timestamp: i64,
        create_if_not_exists: bool,
    ) -> Result<PartitionMeta> {
        if let Some(meta) = self.find_partition_at(ctx, group, timestamp, true).await? {
            return Ok(meta);
        }
        // The document predates every partition: it belongs to the oldest one.
        match self.oldest_partition(ctx, group).await? {
            Some(oldest) => Ok(oldest),
            None if create_if_not_exists => Ok(PartitionMeta::new(timestamp, 0)),
            None => Err(Error::PartitionNotFound(timestamp)),
        }
    }

    async fn get_or_create_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        timestamp: i64,
    ) -> Result<PartitionMeta> {
        let assigned = self.assign_partition(ctx, group, timestamp, true).await?;
        // A document older than a full partition opens a fresh partition
        // instead of forcing an immediate rebalance of the full one.
        if assigned.count >= self.high_watermark && timestamp < assigned.from_ts()? {
            let max_id = self
                .all_partitions(ctx, group)
                .await?
                .iter()
                .map(|meta| meta.id)
                .max()
                .unwrap_or(0);
            return Ok(PartitionMeta::new(timestamp, max_id + 1));
        }
        Ok(assigned)
    }

    /// Account for an inserted document: bump the count and widen the
    /// bounding interval, rewriting the metadata key when `from` moves.
    /// Returns the assigned partition id, or `None` with partitioning off.
    pub async fn add_to_and_save(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        record: &Record,
    ) -> Result<Option<i32>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let timestamp = self.timestamp_of(record)?;
        let mut meta = self.get_or_create_partition(ctx, group, timestamp).await?;
        meta.count += 1;
        if timestamp < meta.from_ts()? {
            // The key is the `from` value: clear the old one first.
            ctx.clear(&self.meta_key(group, meta.from_ts()?)).await?;
            meta.from = Tuple::new().push_int(timestamp).pack();
        }
        if timestamp > meta.to_ts()? {
            meta.to = Tuple::new().push_int(timestamp).pack();
        }
        self.save_partition_metadata(ctx, group, &meta).await?;
        Ok(Some(meta.id))
    }

    /// Account for a deleted document. `from`/`to` stay as a (still valid)
    /// bounding interval; narrowing them would require knowing the next
    /// boundary values.
    pub async fn remove_from_and_save(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        record: &Record,
    ) -> Result<Option<i32>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let timestamp = self.timestamp_of(record)?;
        let mut meta = self.assign_partition(ctx, group, timestamp, false).await?;
        meta.count -= 1;
        if meta.count < 0 {
            return Err(Error::InvariantViolation(format!(
                "partition {} count went negative",
                meta.id
            )));
        }
        self.save_partition_metadata(ctx, group, &meta).await?;
        Ok(Some(meta.id))
    }

    /// Move a source partition's boundary after `moved` documents were taken
    /// out of it. The old metadata key is cleared because the key is the old
    /// `from` value.
    pub async fn apply_source_boundary(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        source: &PartitionMeta,
        moved: i64,
        new_boundary: i64,
    ) -> Result<PartitionMeta> {
        let mut updated = source.clone();
        updated.count -= moved;
        if updated.count < 0 {
            return Err(Error::InvariantViolation(format!(
                "partition {} count went negative during repartitioning",
                source.id
            )));
        }
        ctx.clear(&self.meta_key(group, source.from_ts()?)).await?;
        updated.from = Tuple::new().push_int(new_boundary).pack();
        self.save_partition_metadata(ctx, group, &updated).await?;
        Ok(updated)
    }

    /// Create and persist a fresh partition starting at `timestamp`.
    pub async fn create_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        timestamp: i64,
        id: i32,
    ) -> Result<PartitionMeta> {
        let meta = PartitionMeta::new(timestamp, id);
        self.save_partition_metadata(ctx, group, &meta).await?;
        Ok(meta)
    }

    /// The partition a query should run against: the newest, unless sorted
    /// ascending by the partitioning field, in which case the oldest.
    pub async fn select_query_partition(
        &self,
        ctx: &AgilityContext,
        group: &Tuple,
        sort: Option<&Sort>,
    ) -> Result<Option<PartitionMeta>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        if let Some(sort) = sort {
            let by_partition_field = self.field_name.as_deref() == Some(sort.field.as_str());
            if by_partition_field && !sort.reverse {
                return self.oldest_partition(ctx, group).await;
            }
        }
        self.newest_partition(ctx, group).await
    }

    /// Distinct grouping keys present under the index, discovered by skipping
    /// from each group's subtree to the next.
    pub async fn list_groups(
        &self,
        ctx: &AgilityContext,
        grouping_count: usize,
    ) -> Result<Vec<Tuple>> {
        let (mut cursor, end) = self.subspace.range();
        let mut groups = Vec::new();
        loop {
            let entries = ctx.get_range(&cursor, &end, Some(1), false).await?;
            let Some((key, _)) = entries.first() else {
                break;
            };
            let tuple = self.subspace.unpack(key)?;
            let group = tuple.prefix(grouping_count);
            cursor = self.subspace.subspace(&group).range().1;
            groups.push(group);
        }
        Ok(groups)
    }
}

/// Check the structural invariants of one group's partition metadata.
///
/// Holds after any quiescent rebalance: counts within bounds, boundaries
/// strictly ordered and non-overlapping, ids unique. The lower count bound
/// depends on position: the oldest partition may hold stragglers inserted
/// after its neighbors filled, and the partition just below the newest is the
/// tail of the most recent move chain, so it may hold as little as one
/// repartitioning step's worth.
pub fn validate_partition_metadata(
    partitions: &[PartitionMeta],
    high_watermark: i64,
    repartition_count: usize,
) -> Result<()> {
    let mut seen_ids = std::collections::HashSet::new();
    for (index, meta) in partitions.iter().enumerate() {
        if !seen_ids.insert(meta.id) {
            return Err(Error::InvariantViolation(format!(
                "duplicate partition id {}",
                meta.id
            )));
        }
        if meta.count < 0 {
            return Err(Error::InvariantViolation(format!(
                "partition {} has negative count {}",
                meta.id, meta.count
            )));
        }
        if meta.count > high_watermark {
            return Err(Error::InvariantViolation(format!(
                "partition {} count {} exceeds high watermark {high_watermark}",
                meta.id, meta.count
            )));
        }
        let low_bound = if partitions.len() == 1 || index == 0 {
            1
        } else if index == partitions.len() - 2 {
            std::cmp::min(repartition_count as i64, high_watermark)
        } else {
            std::cmp::max(1, high_watermark - repartition_count as i64)
        };
        if meta.count < low_bound {
            return Err(Error::InvariantViolation(format!(
                "partition {} count {} below lower bound {low_bound}",
                meta.id, meta.count
            )));
        }
        if meta.from_ts()? > meta.to_ts()? {
            return Err(Error::InvariantViolation(format!(
                "partition {} has from > to",
                meta.id
            )));
        }
        if index > 0 {
            let previous = &partitions[index - 1];
            if previous.to_ts()? >= meta.from_ts()? {
                return Err(Error::InvariantViolation(format!(
                    "partitions {} and {} overlap",
                    previous.id, meta.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Document;
    use crate::kv::{KvDatabase, MemoryDatabase};
    use crate::metrics::Metrics;

    fn schema() -> Arc<Schema> {
        let mut builder = Schema::builder();
        builder.add_i64_field("created", true);
        builder.add_text_field("text", true, true);
        Arc::new(builder.build())
    }

    fn config(hwm: i64) -> IndexConfig {
        IndexConfig {
            partition_by_field_name: Some("created".into()),
            partition_high_watermark: hwm,
            ..Default::default()
        }
    }

    fn partitioner(hwm: i64) -> Partitioner {
        Partitioner::new(
            Subspace::new(&Tuple::new().push_str("idx")),
            schema(),
            &config(hwm),
        )
        .unwrap()
    }

    fn record(ts: i64) -> Record {
        let mut doc = Document::new();
        doc.add_i64(Field(0), ts);
        doc.add_text(Field(1), "Document");
        Record::new(Tuple::new().push_int(ts), doc)
    }

    use crate::dsl::Field;

    async fn ctx(db: &MemoryDatabase) -> Arc<AgilityContext> {
        Arc::new(AgilityContext::agile(
            Arc::new(db.clone()),
            60_000,
            u64::MAX,
            Arc::new(Metrics::new()),
        ))
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = PartitionMeta {
            id: 3,
            count: 42,
            from: Tuple::new().push_int(100).pack(),
            to: Tuple::new().push_int(900).pack(),
        };
        let decoded = PartitionMeta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.from_ts().unwrap(), 100);
        assert_eq!(decoded.to_ts().unwrap(), 900);
    }

    #[tokio::test]
    async fn test_first_insert_creates_partition_zero() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);
        let group = Tuple::new();

        let id = p.add_to_and_save(&ctx, &group, &record(500)).await.unwrap();
        assert_eq!(id, Some(0));

        let all = p.all_partitions(&ctx, &group).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].count, 1);
        assert_eq!(all[0].from_ts().unwrap(), 500);
        assert_eq!(all[0].to_ts().unwrap(), 500);
    }

    #[tokio::test]
    async fn test_insert_widens_interval_and_moves_key() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);
        let group = Tuple::new();

        p.add_to_and_save(&ctx, &group, &record(500)).await.unwrap();
        p.add_to_and_save(&ctx, &group, &record(900)).await.unwrap();
        // Older than `from`: the metadata key must move to the new boundary.
        p.add_to_and_save(&ctx, &group, &record(100)).await.unwrap();

        let all = p.all_partitions(&ctx, &group).await.unwrap();
        assert_eq!(all.len(), 1, "old meta key must have been cleared");
        assert_eq!(all[0].count, 3);
        assert_eq!(all[0].from_ts().unwrap(), 100);
        assert_eq!(all[0].to_ts().unwrap(), 900);
    }

    #[tokio::test]
    async fn test_old_doc_against_full_partition_opens_new_one() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(2);
        let group = Tuple::new();

        p.add_to_and_save(&ctx, &group, &record(500)).await.unwrap();
        p.add_to_and_save(&ctx, &group, &record(600)).await.unwrap();
        // Partition 0 is at the watermark; an older doc opens partition 1.
        let id = p.add_to_and_save(&ctx, &group, &record(100)).await.unwrap();
        assert_eq!(id, Some(1));

        let all = p.all_partitions(&ctx, &group).await.unwrap();
        assert_eq!(all.len(), 2);
        // Oldest first.
        assert_eq!(all[0].id, 1);
        assert_eq!(all[0].from_ts().unwrap(), 100);
        assert_eq!(all[1].id, 0);
        // A newer doc against the full partition still lands in it.
        let id = p.add_to_and_save(&ctx, &group, &record(700)).await.unwrap();
        assert_eq!(id, Some(0));
    }

    #[tokio::test]
    async fn test_remove_decrements_and_guards_negative() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);
        let group = Tuple::new();

        p.add_to_and_save(&ctx, &group, &record(500)).await.unwrap();
        let id = p
            .remove_from_and_save(&ctx, &group, &record(500))
            .await
            .unwrap();
        assert_eq!(id, Some(0));

        let all = p.all_partitions(&ctx, &group).await.unwrap();
        assert_eq!(all[0].count, 0);
        // The bounding interval is not narrowed.
        assert_eq!(all[0].from_ts().unwrap(), 500);

        let err = p
            .remove_from_and_save(&ctx, &group, &record(500))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_remove_without_partitions_fails() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);
        let err = p
            .remove_from_and_save(&ctx, &Tuple::new(), &record(500))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionNotFound(500)));
    }

    #[tokio::test]
    async fn test_edge_and_neighbor_lookups() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);
        let group = Tuple::new();

        for meta in [
            PartitionMeta::new(100, 0),
            PartitionMeta::new(500, 1),
            PartitionMeta::new(900, 2),
        ] {
            p.save_partition_metadata(&ctx, &group, &meta).await.unwrap();
        }

        let oldest = p.oldest_partition(&ctx, &group).await.unwrap().unwrap();
        let newest = p.newest_partition(&ctx, &group).await.unwrap().unwrap();
        assert_eq!((oldest.id, newest.id), (0, 2));

        let older = p
            .next_older_partition(&ctx, &group, 500)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(older.id, 0);
        let newer = p
            .next_newer_partition(&ctx, &group, 500)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newer.id, 2);
        assert!(p
            .next_older_partition(&ctx, &group, 100)
            .await
            .unwrap()
            .is_none());

        // Destination lookup is strictly-older.
        let dest = p.find_destination(&ctx, &group, 500).await.unwrap().unwrap();
        assert_eq!(dest.id, 0);
    }

    #[tokio::test]
    async fn test_select_query_partition_respects_sort() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);
        let group = Tuple::new();

        p.save_partition_metadata(&ctx, &group, &PartitionMeta::new(100, 0))
            .await
            .unwrap();
        p.save_partition_metadata(&ctx, &group, &PartitionMeta::new(500, 1))
            .await
            .unwrap();

        let newest = p
            .select_query_partition(&ctx, &group, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest.id, 1);

        let asc = Sort {
            field: "created".into(),
            reverse: false,
        };
        let oldest = p
            .select_query_partition(&ctx, &group, Some(&asc))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(oldest.id, 0);

        let desc = Sort {
            field: "created".into(),
            reverse: true,
        };
        let newest = p
            .select_query_partition(&ctx, &group, Some(&desc))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest.id, 1);
    }

    #[tokio::test]
    async fn test_list_groups() {
        let db = MemoryDatabase::new();
        let ctx = ctx(&db).await;
        let p = partitioner(100);

        for group_value in [1i64, 2, 5] {
            let group = Tuple::new().push_int(group_value);
            p.save_partition_metadata(&ctx, &group, &PartitionMeta::new(100, 0))
                .await
                .unwrap();
        }
        let groups = p.list_groups(&ctx, 1).await.unwrap();
        let values: Vec<i64> = groups.iter().map(|g| g.get_int(0).unwrap()).collect();
        assert_eq!(values, vec![1, 2, 5]);
    }

    #[test]
    fn test_validator() {
        let make = |id: i32, count: i64, from: i64, to: i64| PartitionMeta {
            id,
            count,
            from: Tuple::new().push_int(from).pack(),
            to: Tuple::new().push_int(to).pack(),
        };

        // Healthy layout: oldest partition may be small.
        let good = vec![make(1, 2, 0, 99), make(0, 18, 100, 200)];
        validate_partition_metadata(&good, 20, 3).unwrap();

        // The partition just below the newest is the tail of a move chain
        // and may hold as little as one repartitioning step.
        let tail = vec![make(1, 18, 0, 99), make(2, 3, 100, 150), make(0, 18, 200, 300)];
        validate_partition_metadata(&tail, 20, 3).unwrap();

        // Over the watermark.
        let over = vec![make(0, 21, 0, 99)];
        assert!(validate_partition_metadata(&over, 20, 3).is_err());

        // Non-oldest partition under the lower bound.
        let under = vec![make(0, 10, 0, 99), make(1, 5, 100, 200)];
        assert!(validate_partition_metadata(&under, 20, 3).is_err());

        // Overlapping intervals.
        let overlap = vec![make(0, 18, 0, 150), make(1, 18, 100, 200)];
        assert!(validate_partition_metadata(&overlap, 20, 3).is_err());

        // Duplicate ids.
        let dup = vec![make(0, 18, 0, 99), make(0, 18, 100, 200)];
        assert!(validate_partition_metadata(&dup, 20, 3).is_err());
    }
}
