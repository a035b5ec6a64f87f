use std::sync::Arc;

use super::{primary_keys, TestIndex};
use crate::config::IndexConfig;
use crate::directories::{AgilityContext, BlockCache, KvDirectory};
use crate::dsl::{Document, Record, Schema};
use crate::error::Error;
use crate::index::WRITE_LOCK_NAME;
use crate::kv::KvDatabase;
use crate::metrics::Metrics;
use crate::partition::partition_data_subspace;
use crate::tuple::Tuple;

fn grouped_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_i64_field("group", true);
    builder.add_i64_field("created", true);
    builder.add_text_field("text", true, true);
    builder.build()
}

fn grouped_config() -> IndexConfig {
    IndexConfig {
        group_by_field_name: Some("group".into()),
        partition_by_field_name: Some("created".into()),
        ..Default::default()
    }
}

fn grouped_doc(schema: &Schema, group: i64, pk: i64, created: i64, text: &str) -> Record {
    let mut document = Document::new();
    document.add_i64(schema.field("group").unwrap(), group);
    document.add_i64(schema.field("created").unwrap(), created);
    document.add_text(schema.field("text").unwrap(), text);
    Record::new(Tuple::new().push_int(pk), document)
}

/// A foreign actor's directory over one partition, with its own agile
/// context so its lock acquisition commits independently.
fn foreign_directory(index: &TestIndex, group: &Tuple, partition: i32) -> Arc<KvDirectory> {
    let metrics = Arc::new(Metrics::new());
    let agility = Arc::new(AgilityContext::agile(
        Arc::new(index.db.clone()),
        60_000,
        u64::MAX,
        Arc::clone(&metrics),
    ));
    Arc::new(KvDirectory::new(
        partition_data_subspace(&index.subspace, group, Some(partition)),
        u64::MAX - 1,
        agility,
        Arc::new(BlockCache::new(1 << 20)),
        metrics,
        16 * 1024,
        false,
        600_000,
    ))
}

#[tokio::test]
async fn test_foreign_lock_blocks_save_record() {
    let schema = grouped_schema();
    let index = TestIndex::new(schema.clone(), grouped_config());
    let group1 = Tuple::new().push_int(1);

    // Seed another group so queries have something to find.
    index
        .save_all(&[grouped_doc(&schema, 2, 100, 1_000, "Document other")])
        .await
        .unwrap();

    // A foreign entity takes the write lock on (group=1, partition=0) and
    // commits it.
    let foreign = foreign_directory(&index, &group1, 0);
    let foreign_lock = foreign.obtain_lock(WRITE_LOCK_NAME).await.unwrap();

    // Saving into that partition now fails acquiring the write lock.
    let txn = index.db.begin().await.unwrap();
    let ctx = index.maintainer.transaction_context(Arc::clone(&txn));
    let err = index
        .maintainer
        .save_record(&ctx, &grouped_doc(&schema, 1, 200, 2_000, "Document one"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockFailed(_)), "got {err}");
    assert!(
        err.to_string().contains("already locked by another entity"),
        "got {err}"
    );
    txn.cancel();

    // Queries are unaffected by the foreign lock.
    let hits = index
        .maintainer
        .query_term(&Tuple::new().push_int(2), "text", "Document", None)
        .await
        .unwrap();
    assert_eq!(primary_keys(&hits), [100].into());
    assert!(index
        .maintainer
        .query_term(&group1, "text", "Document", None)
        .await
        .unwrap()
        .is_empty());

    // Once the foreign entity releases, the save goes through.
    foreign_lock.release().await.unwrap();
    index
        .save_all(&[grouped_doc(&schema, 1, 200, 2_000, "Document one")])
        .await
        .unwrap();
    let hits = index
        .maintainer
        .query_term(&group1, "text", "Document", None)
        .await
        .unwrap();
    assert_eq!(primary_keys(&hits), [200].into());
}

#[tokio::test]
async fn test_stale_foreign_lock_is_stolen_by_writer() {
    let schema = grouped_schema();
    let index = TestIndex::new(schema.clone(), grouped_config());
    let group1 = Tuple::new().push_int(1);

    // Plant a stale lock cell directly: a holder that stopped heartbeating
    // 100 minutes ago, far beyond the 10-minute window.
    let foreign = foreign_directory(&index, &group1, 0);
    let key = foreign.lock_key(WRITE_LOCK_NAME);
    let stale = Tuple::new()
        .push_uuid(uuid::Uuid::new_v4())
        .push_int(crate::directories::lock_clock_ms() - 100 * 60 * 1_000)
        .pack();
    let txn = index.db.begin().await.unwrap();
    txn.set(&key, &stale);
    txn.commit().await.unwrap();

    // The writer steals the stale lock and the save succeeds.
    index
        .save_all(&[grouped_doc(&schema, 1, 300, 3_000, "Document stolen")])
        .await
        .unwrap();
    let hits = index
        .maintainer
        .query_term(&group1, "text", "stolen", None)
        .await
        .unwrap();
    assert_eq!(primary_keys(&hits), [300].into());
}
