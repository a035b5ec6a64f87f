mod lock;
mod partition;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::directories::{AgilityContext, BlockCache, KvDirectory};
use crate::dsl::{Document, Record, Schema};
use crate::error::Result;
use crate::index::IndexMaintainer;
use crate::kv::{KvDatabase, MemoryDatabase};
use crate::metrics::Metrics;
use crate::partition::partition_data_subspace;
use crate::tuple::{Subspace, Tuple};

/// An index over an in-memory store, with transaction plumbing for tests.
pub(crate) struct TestIndex {
    pub db: MemoryDatabase,
    pub subspace: Subspace,
    pub maintainer: IndexMaintainer,
}

impl TestIndex {
    pub fn new(schema: Schema, config: IndexConfig) -> Self {
        let db = MemoryDatabase::new();
        let subspace = Subspace::new(&Tuple::new().push_str("test-index"));
        let maintainer = IndexMaintainer::new(
            Arc::new(db.clone()),
            subspace.clone(),
            Arc::new(schema),
            config,
        )
        .unwrap();
        Self {
            db,
            subspace,
            maintainer,
        }
    }

    /// Save all records and commit, in one transaction.
    pub async fn save_all(&self, records: &[Record]) -> Result<()> {
        let txn = self.db.begin().await?;
        let ctx = self.maintainer.transaction_context(Arc::clone(&txn));
        for record in records {
            self.maintainer.save_record(&ctx, record).await?;
        }
        self.maintainer.commit().await?;
        txn.commit().await
    }

    pub async fn delete(&self, record: &Record) -> Result<()> {
        let txn = self.db.begin().await?;
        let ctx = self.maintainer.transaction_context(Arc::clone(&txn));
        self.maintainer.delete_record(&ctx, record).await?;
        self.maintainer.commit().await?;
        txn.commit().await
    }

    pub async fn update(&self, old_record: &Record, new_record: &Record) -> Result<()> {
        let txn = self.db.begin().await?;
        let ctx = self.maintainer.transaction_context(Arc::clone(&txn));
        self.maintainer
            .update_record(&ctx, old_record, new_record)
            .await?;
        self.maintainer.commit().await?;
        txn.commit().await
    }

    /// A read-only directory view over one partition, for asserting on
    /// physical state (stored-fields keys, file listings).
    pub async fn raw_directory(
        &self,
        group: &Tuple,
        partition: Option<i32>,
    ) -> Result<Arc<KvDirectory>> {
        let metrics = Arc::new(Metrics::new());
        let txn = self.db.begin().await?;
        let agility = Arc::new(AgilityContext::non_agile(txn, Arc::clone(&metrics)));
        Ok(Arc::new(KvDirectory::new(
            partition_data_subspace(&self.subspace, group, partition),
            u64::MAX,
            agility,
            Arc::new(BlockCache::new(1 << 20)),
            metrics,
            16 * 1024,
            false,
            600_000,
        )))
    }
}

/// Schema of the classic two-field test document.
pub(crate) fn simple_doc_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_i64_field("doc_id", true);
    builder.add_text_field("text", true, true);
    builder.build()
}

pub(crate) fn simple_doc(schema: &Schema, doc_id: i64, text: &str) -> Record {
    let mut document = Document::new();
    document.add_i64(schema.field("doc_id").unwrap(), doc_id);
    document.add_text(schema.field("text").unwrap(), text);
    Record::new(Tuple::new().push_int(doc_id), document)
}

/// Primary keys of a result set, as plain integers.
pub(crate) fn primary_keys(records: &[Record]) -> BTreeSet<i64> {
    records
        .iter()
        .map(|r| r.primary_key.get_int(0).unwrap())
        .collect()
}
