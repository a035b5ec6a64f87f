use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{primary_keys, TestIndex};
use crate::config::IndexConfig;
use crate::dsl::{Document, Record, Schema, Sort};
use crate::kv::KvDatabase;
use crate::tuple::Tuple;

fn partitioned_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_i64_field("group", true);
    builder.add_i64_field("created", true);
    builder.add_text_field("text", true, true);
    builder.build()
}

fn partitioned_config(high_watermark: i64, repartition_count: usize) -> IndexConfig {
    IndexConfig {
        group_by_field_name: Some("group".into()),
        partition_by_field_name: Some("created".into()),
        partition_high_watermark: high_watermark,
        repartition_document_count: repartition_count,
        ..Default::default()
    }
}

fn doc(schema: &Schema, group: i64, pk: i64, created: i64) -> Record {
    let mut document = Document::new();
    document.add_i64(schema.field("group").unwrap(), group);
    document.add_i64(schema.field("created").unwrap(), created);
    document.add_text(schema.field("text").unwrap(), format!("Document {pk}"));
    Record::new(Tuple::new().push_int(pk), document)
}

#[tokio::test]
async fn test_randomized_rebalance_restores_invariants() {
    let schema = partitioned_schema();
    let high_watermark = 20;
    let repartition_count = 3;
    let index = TestIndex::new(
        schema.clone(),
        partitioned_config(high_watermark, repartition_count),
    );

    // Seed two groups with 64 documents each: mostly ascending timestamps
    // (lightly shuffled within each batch) plus a few stragglers older than
    // everything, which exercise the open-a-partition-instead-of-rebalancing
    // path. Timestamps are unique per group so move boundaries are
    // unambiguous.
    let mut rng = StdRng::seed_from_u64(42);
    let mut expected: std::collections::HashMap<i64, std::collections::BTreeSet<i64>> =
        Default::default();
    for group in 1..=2i64 {
        let mut batches: Vec<Vec<i64>> = (0..6)
            .map(|b| ((b * 10 + 1)..=(b * 10 + 10)).map(|i| i * 10).collect())
            .collect();
        // Stragglers far older than the rest, inserted mid-stream.
        batches.insert(3, vec![-100, -90, -80, -70]);
        for batch in &mut batches {
            batch.shuffle(&mut rng);
            let records: Vec<Record> = batch
                .iter()
                .map(|&ts| doc(&schema, group, group * 10_000 + ts, ts))
                .collect();
            index.save_all(&records).await.unwrap();
            expected
                .entry(group)
                .or_default()
                .extend(batch.iter().map(|&ts| group * 10_000 + ts));
        }
    }

    let moved = index.maintainer.rebalance_partitions().await.unwrap();
    assert!(moved > 0, "seeding should have produced oversized partitions");

    // Counts within bounds, boundaries ordered and disjoint, ids unique, and
    // metadata counts equal to physically resident documents.
    index
        .maintainer
        .validate_partitions(repartition_count)
        .await
        .unwrap();

    // No document was lost or duplicated by the moves.
    for group in 1..=2i64 {
        let hits = index
            .maintainer
            .query_term_all_partitions(&Tuple::new().push_int(group), "text", "document")
            .await
            .unwrap();
        assert_eq!(hits.len(), 64, "group {group} lost documents");
        assert_eq!(primary_keys(&hits), expected[&group]);
    }

    // Rebalancing is idempotent once balanced.
    assert_eq!(index.maintainer.rebalance_partitions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rebalance_splits_one_oversized_partition() {
    let schema = partitioned_schema();
    let index = TestIndex::new(schema.clone(), partitioned_config(3, 2));
    let group = Tuple::new().push_int(1);

    // Ascending timestamps all land in partition 0, well over the watermark.
    let records: Vec<Record> = (1..=10).map(|i| doc(&schema, 1, i, i * 100)).collect();
    index.save_all(&records).await.unwrap();

    let ctx = index
        .maintainer
        .transaction_context(index.db.begin().await.unwrap());
    let before = index
        .maintainer
        .partitioner()
        .all_partitions(&ctx, &group)
        .await
        .unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].count, 10);

    index.maintainer.rebalance_partitions().await.unwrap();
    index.maintainer.validate_partitions(2).await.unwrap();

    let ctx = index
        .maintainer
        .transaction_context(index.db.begin().await.unwrap());
    let after = index
        .maintainer
        .partitioner()
        .all_partitions(&ctx, &group)
        .await
        .unwrap();
    assert!(after.len() > 1, "expected a split, got {after:?}");
    let total: i64 = after.iter().map(|p| p.count).sum();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn test_query_partition_selection_with_sort() {
    let schema = partitioned_schema();
    let index = TestIndex::new(schema.clone(), partitioned_config(3, 2));
    let group = Tuple::new().push_int(1);

    let records: Vec<Record> = (1..=9).map(|i| doc(&schema, 1, i, i * 100)).collect();
    index.save_all(&records).await.unwrap();
    index.maintainer.rebalance_partitions().await.unwrap();

    let ctx = index
        .maintainer
        .transaction_context(index.db.begin().await.unwrap());
    let partitions = index
        .maintainer
        .partitioner()
        .all_partitions(&ctx, &group)
        .await
        .unwrap();
    assert!(partitions.len() > 1);

    // Unsorted queries hit the newest partition.
    let newest_hits = index
        .maintainer
        .query_term(&group, "text", "document", None)
        .await
        .unwrap();
    let newest = partitions.last().unwrap();
    assert_eq!(newest_hits.len() as i64, newest.count);

    // Ascending sort on the partitioning field hits the oldest partition.
    let sort = Sort {
        field: "created".into(),
        reverse: false,
    };
    let oldest_hits = index
        .maintainer
        .query_term(&group, "text", "document", Some(&sort))
        .await
        .unwrap();
    let oldest = partitions.first().unwrap();
    assert_eq!(oldest_hits.len() as i64, oldest.count);
    assert_ne!(primary_keys(&newest_hits), primary_keys(&oldest_hits));

    // Every partition is reachable through the iteration helper.
    let all_hits = index
        .maintainer
        .query_term_all_partitions(&group, "text", "document")
        .await
        .unwrap();
    assert_eq!(all_hits.len(), 9);
}

#[tokio::test]
async fn test_group_delete_removes_everything() {
    let schema = partitioned_schema();
    let index = TestIndex::new(schema.clone(), partitioned_config(20, 3));
    let group1 = Tuple::new().push_int(1);
    let group2 = Tuple::new().push_int(2);

    for group in 1..=2i64 {
        let records: Vec<Record> = (1..=5)
            .map(|i| doc(&schema, group, group * 100 + i, i * 10))
            .collect();
        index.save_all(&records).await.unwrap();
    }

    // Delete group 1 wholesale.
    let txn = index.db.begin().await.unwrap();
    let ctx = index.maintainer.transaction_context(Arc::clone(&txn));
    index.maintainer.delete_group(&ctx, &group1).await.unwrap();
    txn.commit().await.unwrap();

    // Every partition meta and every physical key under the group is gone.
    let ctx = index
        .maintainer
        .transaction_context(index.db.begin().await.unwrap());
    assert!(index
        .maintainer
        .partitioner()
        .all_partitions(&ctx, &group1)
        .await
        .unwrap()
        .is_empty());
    let (begin, end) = index.subspace.subspace(&group1).range();
    let txn = index.db.begin().await.unwrap();
    assert!(txn
        .get_range(&begin, &end, None, false)
        .await
        .unwrap()
        .is_empty());

    assert!(index
        .maintainer
        .query_term_all_partitions(&group1, "text", "document")
        .await
        .unwrap()
        .is_empty());

    // The sibling group is untouched.
    let hits = index
        .maintainer
        .query_term_all_partitions(&group2, "text", "document")
        .await
        .unwrap();
    assert_eq!(hits.len(), 5);
}
