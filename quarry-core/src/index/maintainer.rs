//! The index maintainer: routes record operations into partitions.
//!
//! On every insert/delete/update it computes the grouping key and the
//! partitioning timestamp, lets the partitioner assign (and account for) a
//! partition, and hands the document to that partition's writer. Commit
//! flushes the writers; repartitioning moves documents between partitions
//! under an agile context so one pass never outgrows a transaction.

use std::sync::Arc;
use std::time::Instant;

use crate::config::IndexConfig;
use crate::directories::AgilityContext;
use crate::dsl::{FieldValue, Record, Schema, Sort};
use crate::error::{Error, Result};
use crate::kv::KvDatabase;
use crate::metrics::{self, Metrics};
use crate::partition::{PartitionMeta, Partitioner};
use crate::segment::{SegmentCatalog, SegmentReader};
use crate::tuple::{Element, Subspace, Tuple};

use super::manager::DirectoryManager;

pub struct IndexMaintainer {
    database: Arc<dyn KvDatabase>,
    subspace: Subspace,
    schema: Arc<Schema>,
    config: Arc<IndexConfig>,
    metrics: Arc<Metrics>,
    partitioner: Partitioner,
    manager: Arc<DirectoryManager>,
}

impl IndexMaintainer {
    pub fn new(
        database: Arc<dyn KvDatabase>,
        subspace: Subspace,
        schema: Arc<Schema>,
        config: IndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let partitioner = Partitioner::new(subspace.clone(), Arc::clone(&schema), &config)?;
        let manager = Arc::new(DirectoryManager::new(
            subspace.clone(),
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        Ok(Self {
            database,
            subspace,
            schema,
            config,
            metrics,
            partitioner,
            manager,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Context over the caller's transaction, for record-level operations.
    pub fn transaction_context(&self, txn: Arc<dyn crate::kv::KvTransaction>) -> Arc<AgilityContext> {
        Arc::new(AgilityContext::non_agile(txn, Arc::clone(&self.metrics)))
    }

    fn grouping_count(&self) -> usize {
        usize::from(self.config.group_by_field_name.is_some())
    }

    /// The grouping key of a record: empty when ungrouped, otherwise the
    /// single value of the configured grouping field.
    pub fn group_of(&self, record: &Record) -> Result<Tuple> {
        let Some(name) = &self.config.group_by_field_name else {
            return Ok(Tuple::new());
        };
        let field = self
            .schema
            .field(name)
            .ok_or_else(|| Error::InvalidArgument(format!("no such grouping field: {name}")))?;
        match record.document.get_first(field) {
            Some(FieldValue::I64(v)) => Ok(Tuple::new().push_int(*v)),
            Some(FieldValue::I32(v)) => Ok(Tuple::new().push_int(*v as i64)),
            Some(FieldValue::Text(s)) => Ok(Tuple::new().push_str(s.clone())),
            Some(other) => Err(Error::InvalidArgument(format!(
                "grouping field {name} has unsupported type: {other:?}"
            ))),
            None => Err(Error::InvalidArgument(format!(
                "record is missing grouping field {name}"
            ))),
        }
    }

    pub async fn save_record(&self, ctx: &Arc<AgilityContext>, record: &Record) -> Result<()> {
        self.update(ctx, None, Some(record)).await
    }

    pub async fn delete_record(&self, ctx: &Arc<AgilityContext>, record: &Record) -> Result<()> {
        self.update(ctx, Some(record), None).await
    }

    pub async fn update_record(
        &self,
        ctx: &Arc<AgilityContext>,
        old_record: &Record,
        new_record: &Record,
    ) -> Result<()> {
        self.update(ctx, Some(old_record), Some(new_record)).await
    }

    /// Record-level update: remove the old version, insert the new one.
    /// Partition metadata changes ride the caller's context; the documents
    /// themselves buffer in the partition writers until commit.
    async fn update(
        &self,
        ctx: &Arc<AgilityContext>,
        old_record: Option<&Record>,
        new_record: Option<&Record>,
    ) -> Result<()> {
        if let Some(old) = old_record {
            let group = self.group_of(old)?;
            let partition = self.partitioner.remove_from_and_save(ctx, &group, old).await?;
            let writer = self
                .manager
                .writer(&self.database, &self.schema, &group, partition)
                .await?;
            writer.delete_document(old.primary_key.clone()).await;
        }
        if let Some(new) = new_record {
            let group = self.group_of(new)?;
            let partition = self.partitioner.add_to_and_save(ctx, &group, new).await?;
            let writer = self
                .manager
                .writer(&self.database, &self.schema, &group, partition)
                .await?;
            writer.add_document(new.clone()).await;
        }
        Ok(())
    }

    /// Flush every partition writer (running merges where the policy fires),
    /// then rebalance partitions when configured to.
    pub async fn commit(&self) -> Result<()> {
        self.manager.flush_all().await?;
        if self.config.auto_repartition_enabled {
            self.rebalance_partitions().await?;
        }
        Ok(())
    }

    /// Flush and close every writer, releasing all partition locks.
    pub async fn close(&self) -> Result<()> {
        self.manager.close_all().await
    }

    /// Merge every partition of `group` down to one segment each.
    pub async fn force_merge(&self, group: &Tuple) -> Result<()> {
        let partitions = self.partition_ids(group).await?;
        for partition in partitions {
            let writer = self
                .manager
                .writer(&self.database, &self.schema, group, partition)
                .await?;
            writer.force_merge().await?;
        }
        Ok(())
    }

    async fn partition_ids(&self, group: &Tuple) -> Result<Vec<Option<i32>>> {
        if !self.partitioner.is_enabled() {
            return Ok(vec![None]);
        }
        let ctx = self.read_context().await?;
        let all = self.partitioner.all_partitions(&ctx, group).await?;
        Ok(all.into_iter().map(|meta| Some(meta.id)).collect())
    }

    /// Drop everything stored for one grouping key: every partition's data
    /// and every partition metadata record, in one range clear.
    pub async fn delete_group(&self, ctx: &Arc<AgilityContext>, group: &Tuple) -> Result<()> {
        self.manager.discard_group(group).await?;
        let (begin, end) = self.subspace.subspace(group).range();
        ctx.clear_range(&begin, &end).await
    }

    /// Fresh snapshot context for reads.
    async fn read_context(&self) -> Result<Arc<AgilityContext>> {
        let txn = self.database.begin().await?;
        Ok(Arc::new(AgilityContext::non_agile(
            txn,
            Arc::clone(&self.metrics),
        )))
    }

    /// Term query against the partition the partitioner picks for `sort`
    /// (newest, or oldest when sorting ascending by the partitioning field).
    pub async fn query_term(
        &self,
        group: &Tuple,
        field_name: &str,
        text: &str,
        sort: Option<&Sort>,
    ) -> Result<Vec<Record>> {
        let ctx = self.read_context().await?;
        let partition = if self.partitioner.is_enabled() {
            match self
                .partitioner
                .select_query_partition(&ctx, group, sort)
                .await?
            {
                Some(meta) => Some(meta.id),
                None => return Ok(Vec::new()),
            }
        } else {
            None
        };
        self.query_partition(&ctx, group, partition, field_name, text)
            .await
    }

    /// Term query across every partition of the group, newest to oldest.
    pub async fn query_term_all_partitions(
        &self,
        group: &Tuple,
        field_name: &str,
        text: &str,
    ) -> Result<Vec<Record>> {
        let ctx = self.read_context().await?;
        if !self.partitioner.is_enabled() {
            return self.query_partition(&ctx, group, None, field_name, text).await;
        }
        let mut results = Vec::new();
        let mut current = self.partitioner.newest_partition(&ctx, group).await?;
        while let Some(meta) = current {
            results.extend(
                self.query_partition(&ctx, group, Some(meta.id), field_name, text)
                    .await?,
            );
            current = self
                .partitioner
                .next_older_partition(&ctx, group, meta.from_ts()?)
                .await?;
        }
        Ok(results)
    }

    async fn query_partition(
        &self,
        ctx: &Arc<AgilityContext>,
        group: &Tuple,
        partition: Option<i32>,
        field_name: &str,
        text: &str,
    ) -> Result<Vec<Record>> {
        let field = self
            .schema
            .field(field_name)
            .ok_or_else(|| Error::InvalidArgument(format!("no such field: {field_name}")))?;
        let Some(term) = crate::dsl::tokenize(text).into_iter().next() else {
            return Ok(Vec::new());
        };

        let directory = self
            .manager
            .bind_directory(Arc::clone(ctx), group, partition);
        let catalog = SegmentCatalog::load(&directory).await?;
        let mut results = Vec::new();
        for entry in &catalog.segments {
            let reader = SegmentReader::open(&directory, entry.clone(), &self.config).await?;
            for doc_id in reader.postings(field, &term) {
                let record = reader.stored_record(doc_id).await?.ok_or_else(|| {
                    Error::Corruption(format!(
                        "stored fields missing for {}:{doc_id}",
                        entry.name
                    ))
                })?;
                results.push(SegmentReader::record_from_stored(&record)?);
            }
        }
        Ok(results)
    }

    /// Segment catalog of one partition, read from a fresh snapshot. Test and
    /// inspection hook.
    pub async fn partition_catalog(
        &self,
        group: &Tuple,
        partition: Option<i32>,
    ) -> Result<SegmentCatalog> {
        let ctx = self.read_context().await?;
        let directory = self.manager.bind_directory(ctx, group, partition);
        SegmentCatalog::load(&directory).await
    }

    // --- repartitioning -----------------------------------------------------

    /// Rebalance every group until nothing is over the high watermark or the
    /// per-pass document cap is reached. Returns documents moved.
    pub async fn rebalance_partitions(&self) -> Result<usize> {
        if !self.partitioner.is_enabled() {
            return Ok(0);
        }
        let repartition_count = self.config.repartition_document_count;
        if repartition_count == 0 {
            return Ok(0);
        }
        let ctx = Arc::new(AgilityContext::agile(
            Arc::clone(&self.database),
            self.config.agile_commit_time_quota_ms,
            self.config.agile_commit_size_quota_bytes,
            Arc::clone(&self.metrics),
        ));
        // Group discovery probes arbitrary key ranges; keep those reads on a
        // throwaway snapshot so the metadata context commits cleanly.
        let groups = if self.grouping_count() == 0 {
            vec![Tuple::new()]
        } else {
            let snapshot = self.read_context().await?;
            self.partitioner
                .list_groups(&snapshot, self.grouping_count())
                .await?
        };

        let mut total_moved = 0;
        'groups: for group in groups {
            loop {
                if total_moved >= self.config.max_documents_to_move {
                    break 'groups;
                }
                let (moved, _remaining) = self
                    .process_partition_rebalancing(&ctx, &group, repartition_count)
                    .await?;
                if moved == 0 {
                    break;
                }
                total_moved += moved;
            }
        }
        ctx.flush_and_close().await?;
        Ok(total_moved)
    }

    /// Rebalance the first over-watermark partition of one group by moving
    /// its oldest documents out. Returns `(documents moved, excess remaining
    /// in the source partition)`.
    pub async fn process_partition_rebalancing(
        &self,
        ctx: &Arc<AgilityContext>,
        group: &Tuple,
        repartition_count: usize,
    ) -> Result<(usize, i64)> {
        if repartition_count == 0 {
            return Err(Error::InvalidArgument(
                "number of documents to move cannot be zero".into(),
            ));
        }
        // Start from a fresh sub-transaction so this pass observes the
        // previous pass's commits.
        ctx.flush().await?;

        let high_watermark = self.partitioner.high_watermark();
        let partitions = self.partitioner.all_partitions(ctx, group).await?;
        let max_id = partitions.iter().map(|m| m.id).max().unwrap_or(0);

        for meta in &partitions {
            if meta.count <= high_watermark {
                continue;
            }
            log::debug!(
                "repartitioning group={group:?} partition={} count={} high_watermark={high_watermark}",
                meta.id,
                meta.count
            );
            let started = Instant::now();
            let take = 1 + repartition_count.min(high_watermark as usize);
            // Read the documents on a throwaway snapshot: the writers are
            // about to rewrite the data keys, and this context must only
            // carry partition-metadata reads into its next commit.
            let snapshot = self.read_context().await?;
            let oldest = self
                .oldest_documents_in_partition(&snapshot, group, meta.id, take)
                .await?;
            if oldest.len() <= 1 {
                return Ok((0, 0));
            }

            // The newest fetched document stays put; its timestamp becomes
            // the source partition's new lower boundary.
            let boundary = self.partitioner.timestamp_of(&oldest[oldest.len() - 1])?;
            let before_boundary = self.partitioner.timestamp_of(&oldest[oldest.len() - 2])?;
            if boundary == before_boundary {
                return Err(Error::InvariantViolation(format!(
                    "documents to be repartitioned share timestamp {boundary} in partition {}",
                    meta.id
                )));
            }
            let moved_docs = &oldest[..oldest.len() - 1];

            // Physically delete from the source partition, bypassing the
            // partition metadata (the boundary update below accounts for it).
            let source_writer = self
                .manager
                .writer(&self.database, &self.schema, group, Some(meta.id))
                .await?;
            for record in moved_docs {
                source_writer.delete_document(record.primary_key.clone()).await;
            }
            source_writer.flush().await?;

            self.partitioner
                .apply_source_boundary(ctx, group, meta, moved_docs.len() as i64, boundary)
                .await?;

            // Destination: the partition containing the oldest moved
            // timestamp, or a fresh overflow partition when there is none,
            // it would overflow, or it is the source itself.
            let destination_from = self.partitioner.timestamp_of(&moved_docs[0])?;
            let destination = self
                .partitioner
                .find_destination(ctx, group, destination_from)
                .await?;
            let needs_new = match &destination {
                None => true,
                Some(d) => {
                    d.count + moved_docs.len() as i64 > high_watermark || d.id == meta.id
                }
            };
            if needs_new {
                self.partitioner
                    .create_partition(ctx, group, destination_from, max_id + 1)
                    .await?;
            }

            for record in moved_docs {
                self.update(ctx, None, Some(record)).await?;
            }
            self.manager.flush_all().await?;

            metrics::add(
                &self.metrics.rebalance_partition_nanos,
                started.elapsed().as_nanos() as u64,
            );
            metrics::add(
                &self.metrics.rebalance_partition_docs,
                moved_docs.len() as u64,
            );
            let remaining =
                std::cmp::max(meta.count - moved_docs.len() as i64 - high_watermark, 0);
            return Ok((moved_docs.len(), remaining));
        }
        Ok((0, 0))
    }

    /// The `n` oldest live documents of one partition by the partitioning
    /// field, ties broken by primary key.
    async fn oldest_documents_in_partition(
        &self,
        ctx: &Arc<AgilityContext>,
        group: &Tuple,
        partition: i32,
        n: usize,
    ) -> Result<Vec<Record>> {
        let directory = self
            .manager
            .bind_directory(Arc::clone(ctx), group, Some(partition));
        let catalog = SegmentCatalog::load(&directory).await?;
        let mut documents: Vec<(i64, Record)> = Vec::new();
        for entry in &catalog.segments {
            let reader = SegmentReader::open(&directory, entry.clone(), &self.config).await?;
            for (_, stored) in reader.scan_live().await? {
                let record = SegmentReader::record_from_stored(&stored)?;
                let timestamp = self.partitioner.timestamp_of(&record)?;
                documents.push((timestamp, record));
            }
        }
        documents.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.primary_key.cmp(&b.1.primary_key))
        });
        Ok(documents
            .into_iter()
            .take(n)
            .map(|(_, record)| record)
            .collect())
    }

    /// Validate partition-metadata invariants and physical doc counts for
    /// every group. Inspection hook used by maintenance tooling and tests.
    pub async fn validate_partitions(&self, repartition_count: usize) -> Result<()> {
        if !self.partitioner.is_enabled() {
            return Ok(());
        }
        let ctx = self.read_context().await?;
        let groups = if self.grouping_count() == 0 {
            vec![Tuple::new()]
        } else {
            self.partitioner.list_groups(&ctx, self.grouping_count()).await?
        };
        for group in groups {
            let partitions = self.partitioner.all_partitions(&ctx, &group).await?;
            crate::partition::validate_partition_metadata(
                &partitions,
                self.partitioner.high_watermark(),
                repartition_count,
            )?;
            for meta in &partitions {
                let resident = self.count_live_documents(&ctx, &group, meta).await?;
                if resident != meta.count {
                    return Err(Error::InvariantViolation(format!(
                        "partition {} of group {group:?} holds {resident} documents but \
                         metadata says {}",
                        meta.id, meta.count
                    )));
                }
            }
        }
        Ok(())
    }

    async fn count_live_documents(
        &self,
        ctx: &Arc<AgilityContext>,
        group: &Tuple,
        meta: &PartitionMeta,
    ) -> Result<i64> {
        let directory = self
            .manager
            .bind_directory(Arc::clone(ctx), group, Some(meta.id));
        let catalog = SegmentCatalog::load(&directory).await?;
        Ok(catalog
            .segments
            .iter()
            .map(|s| s.live_docs() as i64)
            .sum())
    }
}

/// Convenience for building a grouping key literal.
pub fn group_key(value: i64) -> Tuple {
    Tuple::from_elements(vec![Element::Int(value)])
}
