//! Persistent backup store for failed batches, plus the background replayer.
//!
//! When a batch exhausts its retries the affected items land here, keyed by
//! a content digest. The replayer periodically drains the log against the
//! sink; replay is idempotent because items carry stable ids and the sink
//! operation has upsert semantics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

use super::{BatchItem, BatchSink, BatcherStats};

/// One parked item awaiting replay.
#[derive(Debug, Clone)]
pub struct RecoveryEntry {
    pub digest: String,
    pub item: BatchItem,
    pub retry_count: u32,
}

/// Durable store for items that failed batch submission.
///
/// `append` is idempotent per digest: re-appending an already-parked item is
/// a no-op, so a replay racing a spill cannot duplicate entries.
#[async_trait]
pub trait RecoveryLog: Send + Sync {
    async fn append(&self, item: &BatchItem) -> Result<()>;
    /// Oldest parked entries, up to `limit`.
    async fn pending(&self, limit: usize) -> Result<Vec<RecoveryEntry>>;
    async fn remove(&self, digest: &str) -> Result<()>;
    async fn bump_retry(&self, digest: &str) -> Result<()>;
    async fn len(&self) -> Result<usize>;
}

/// In-memory recovery log for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryRecoveryLog {
    entries: RwLock<BTreeMap<String, (BatchItem, u32)>>,
}

impl MemoryRecoveryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryLog for MemoryRecoveryLog {
    async fn append(&self, item: &BatchItem) -> Result<()> {
        self.entries
            .write()
            .await
            .entry(item.digest())
            .or_insert_with(|| (item.clone(), 0));
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<RecoveryEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .take(limit)
            .map(|(digest, (item, retry_count))| RecoveryEntry {
                digest: digest.clone(),
                item: item.clone(),
                retry_count: *retry_count,
            })
            .collect())
    }

    async fn remove(&self, digest: &str) -> Result<()> {
        self.entries.write().await.remove(digest);
        Ok(())
    }

    async fn bump_retry(&self, digest: &str) -> Result<()> {
        if let Some((_, retry_count)) = self.entries.write().await.get_mut(digest) {
            *retry_count += 1;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// SQL-backed recovery log over the `uds3_batch_recovery` table.
#[cfg(feature = "sqlite")]
pub mod sql {
    use chrono::Utc;
    use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
    use sea_query_binder::SqlxBinder;
    use sqlx::{Row, SqlitePool};

    use super::*;

    /// DDL for the recovery table; executed by the `migrate` entry point.
    pub const CREATE_RECOVERY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS uds3_batch_recovery (
    digest TEXT PRIMARY KEY,
    item TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
"#;

    #[derive(sea_query::Iden)]
    enum Recovery {
        #[iden = "uds3_batch_recovery"]
        Table,
        #[iden = "digest"]
        Digest,
        #[iden = "item"]
        Item,
        #[iden = "created_at"]
        CreatedAt,
        #[iden = "retry_count"]
        RetryCount,
    }

    pub struct SqlRecoveryLog {
        pool: SqlitePool,
    }

    impl SqlRecoveryLog {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl RecoveryLog for SqlRecoveryLog {
        async fn append(&self, item: &BatchItem) -> Result<()> {
            let mut stmt = Query::insert();
            stmt.into_table(Recovery::Table)
                .columns([
                    Recovery::Digest,
                    Recovery::Item,
                    Recovery::CreatedAt,
                    Recovery::RetryCount,
                ])
                .values_panic([
                    item.digest().into(),
                    serde_json::to_string(item)
                        .unwrap_or_default()
                        .into(),
                    Utc::now().to_rfc3339().into(),
                    0.into(),
                ])
                .on_conflict(OnConflict::column(Recovery::Digest).do_nothing().to_owned());
            let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&self.pool).await?;
            Ok(())
        }

        async fn pending(&self, limit: usize) -> Result<Vec<RecoveryEntry>> {
            let (sql, values) = Query::select()
                .columns([Recovery::Digest, Recovery::Item, Recovery::RetryCount])
                .from(Recovery::Table)
                .order_by(Recovery::CreatedAt, Order::Asc)
                .order_by(Recovery::Digest, Order::Asc)
                .limit(limit as u64)
                .build_sqlx(SqliteQueryBuilder);

            let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
            let mut entries = Vec::with_capacity(rows.len());
            for row in rows {
                let raw: String = row.get("item");
                let item: BatchItem = serde_json::from_str(&raw).map_err(|e| {
                    crate::error::CoreError::Permanent(format!(
                        "corrupt recovery entry: {}",
                        e
                    ))
                })?;
                let retry_count: i64 = row.get("retry_count");
                entries.push(RecoveryEntry {
                    digest: row.get("digest"),
                    item,
                    retry_count: retry_count as u32,
                });
            }
            Ok(entries)
        }

        async fn remove(&self, digest: &str) -> Result<()> {
            let (sql, values) = Query::delete()
                .from_table(Recovery::Table)
                .and_where(Expr::col(Recovery::Digest).eq(digest))
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&self.pool).await?;
            Ok(())
        }

        async fn bump_retry(&self, digest: &str) -> Result<()> {
            let (sql, values) = Query::update()
                .table(Recovery::Table)
                .value(
                    Recovery::RetryCount,
                    Expr::col(Recovery::RetryCount).add(1),
                )
                .and_where(Expr::col(Recovery::Digest).eq(digest))
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&self.pool).await?;
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            let (sql, values) = Query::select()
                .expr(Expr::col(Recovery::Digest).count())
                .from(Recovery::Table)
                .build_sqlx(SqliteQueryBuilder);
            let row = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
            let count: i64 = row.get(0);
            Ok(count as usize)
        }
    }
}

/// Background replay of the recovery log against the sink.
pub struct RecoveryReplayer;

impl RecoveryReplayer {
    /// How many parked items one replay pass picks up.
    const REPLAY_CHUNK: usize = 256;

    /// One replay pass. Returns the number of items successfully replayed.
    pub async fn run_once(
        log: &dyn RecoveryLog,
        sink: &dyn BatchSink,
        stats: &BatcherStats,
    ) -> Result<u64> {
        let entries = log.pending(Self::REPLAY_CHUNK).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let items: Vec<BatchItem> = entries.iter().map(|e| e.item.clone()).collect();
        match sink.submit_batch(&items).await {
            Ok(()) => {
                for entry in &entries {
                    log.remove(&entry.digest).await?;
                }
                let replayed = entries.len() as u64;
                stats.add_recovered(replayed);
                debug!(replayed, "recovery log replay succeeded");
                Ok(replayed)
            }
            Err(e) => {
                for entry in &entries {
                    log.bump_retry(&entry.digest).await?;
                }
                warn!(error = %e, parked = entries.len(), "recovery log replay failed");
                Ok(0)
            }
        }
    }

    /// Spawn the periodic replayer. Aborting the handle stops it.
    pub fn spawn(
        log: Arc<dyn RecoveryLog>,
        sink: Arc<dyn BatchSink>,
        stats: Arc<BatcherStats>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = Self::run_once(log.as_ref(), sink.as_ref(), &stats).await {
                    warn!(error = %e, "recovery replay pass errored");
                }
            }
        })
    }
}
