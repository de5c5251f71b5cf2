//! SQL-backed saga event store.
//!
//! All inserts go through the relational adapter's schema-sensitive
//! safe-insert, so the same code serves the canonical table shapes and
//! reduced deployments (catch-all `data` column, or blob-only tables).
//! Lock acquisition is a row-level conditional update on `uds3_sagas`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Cond, Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::backends::sql::SqlRelationalStore;
use crate::backends::{Payload, RelationalStore};
use crate::error::{CoreError, Result};

use super::event_store::{SagaEventStore, CREATE_SAGA_TABLES};
use super::types::{AuditRecord, MetricSample, Saga, SagaEvent, SagaStatus, StepStatus};

#[derive(sea_query::Iden)]
enum Sagas {
    #[iden = "uds3_sagas"]
    Table,
    #[iden = "saga_id"]
    SagaId,
    #[iden = "status"]
    Status,
    #[iden = "owner_token"]
    OwnerToken,
    #[iden = "lock_expires_at"]
    LockExpiresAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::Permanent(format!("invalid timestamp '{}': {}", raw, e)))
}

fn req_str(row: &Payload, key: &str) -> Result<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::Permanent(format!("event-store row missing '{}'", key)))
}

fn req_uuid(row: &Payload, key: &str) -> Result<Uuid> {
    Uuid::parse_str(&req_str(row, key)?)
        .map_err(|e| CoreError::Permanent(format!("invalid uuid in '{}': {}", key, e)))
}

/// Run the idempotent event-store migration. The CLI `migrate` subcommand is
/// the only caller.
pub async fn migrate(relational: &SqlRelationalStore) -> Result<()> {
    relational.execute_ddl(CREATE_SAGA_TABLES).await?;
    relational
        .execute_ddl(crate::batcher::recovery::sql::CREATE_RECOVERY_TABLE)
        .await?;
    Ok(())
}

/// Saga event store over a relational adapter.
pub struct SqlSagaEventStore {
    relational: Arc<SqlRelationalStore>,
}

impl SqlSagaEventStore {
    pub fn new(relational: Arc<SqlRelationalStore>) -> Self {
        Self { relational }
    }

    fn saga_row(saga: &Saga) -> Result<Payload> {
        let steps = serde_json::to_string(&saga.steps)
            .map_err(|e| CoreError::Permanent(format!("steps serialize failed: {}", e)))?;
        let mut row = Payload::new();
        row.insert("saga_id".into(), Value::String(saga.saga_id.to_string()));
        row.insert("name".into(), Value::String(saga.name.clone()));
        row.insert("trace_id".into(), Value::String(saga.trace_id.clone()));
        row.insert("status".into(), Value::String(saga.status.to_string()));
        row.insert("steps".into(), Value::String(steps));
        row.insert(
            "owner_token".into(),
            saga.owner_token
                .map(|t| Value::String(t.to_string()))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "lock_expires_at".into(),
            saga.lock_expires_at
                .map(|t| Value::String(fmt_ts(t)))
                .unwrap_or(Value::Null),
        );
        row.insert("created_at".into(), Value::String(fmt_ts(saga.created_at)));
        row.insert("updated_at".into(), Value::String(fmt_ts(saga.updated_at)));
        Ok(row)
    }

    fn parse_saga(row: &Payload) -> Result<Saga> {
        let status: SagaStatus = req_str(row, "status")?
            .parse()
            .map_err(CoreError::Permanent)?;
        let steps = serde_json::from_str(&req_str(row, "steps")?)
            .map_err(|e| CoreError::Permanent(format!("steps deserialize failed: {}", e)))?;
        Ok(Saga {
            saga_id: req_uuid(row, "saga_id")?,
            name: req_str(row, "name")?,
            trace_id: req_str(row, "trace_id")?,
            status,
            steps,
            created_at: parse_ts(&req_str(row, "created_at")?)?,
            updated_at: parse_ts(&req_str(row, "updated_at")?)?,
            owner_token: match row.get("owner_token").and_then(Value::as_str) {
                Some(raw) if !raw.is_empty() => Some(
                    Uuid::parse_str(raw)
                        .map_err(|e| CoreError::Permanent(format!("invalid owner token: {}", e)))?,
                ),
                _ => None,
            },
            lock_expires_at: match row.get("lock_expires_at").and_then(Value::as_str) {
                Some(raw) if !raw.is_empty() => Some(parse_ts(raw)?),
                _ => None,
            },
        })
    }

    fn event_row(event: &SagaEvent) -> Payload {
        let mut row = Payload::new();
        row.insert("event_id".into(), Value::String(event.event_id.to_string()));
        row.insert("saga_id".into(), Value::String(event.saga_id.to_string()));
        row.insert("trace_id".into(), Value::String(event.trace_id.clone()));
        row.insert("step_id".into(), Value::String(event.step_id.clone()));
        row.insert("attempt".into(), Value::from(event.attempt));
        row.insert("status".into(), Value::String(event.status.to_string()));
        row.insert("started_at".into(), Value::String(fmt_ts(event.started_at)));
        row.insert(
            "duration_ms".into(),
            event.duration_ms.map(Value::from).unwrap_or(Value::Null),
        );
        row.insert(
            "error".into(),
            event
                .error
                .as_ref()
                .map(|e| Value::String(e.clone()))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "payload_snapshot".into(),
            event
                .payload_snapshot
                .as_ref()
                .map(|p| Value::String(p.to_string()))
                .unwrap_or(Value::Null),
        );
        row
    }

    fn parse_event(row: &Payload) -> Result<SagaEvent> {
        let status: StepStatus = req_str(row, "status")?
            .parse()
            .map_err(CoreError::Permanent)?;
        let payload_snapshot = match row.get("payload_snapshot").and_then(Value::as_str) {
            Some(raw) if !raw.is_empty() => Some(
                serde_json::from_str(raw)
                    .map_err(|e| CoreError::Permanent(format!("invalid snapshot: {}", e)))?,
            ),
            _ => None,
        };
        Ok(SagaEvent {
            event_id: req_uuid(row, "event_id")?,
            saga_id: req_uuid(row, "saga_id")?,
            trace_id: req_str(row, "trace_id").unwrap_or_default(),
            step_id: req_str(row, "step_id")?,
            status,
            attempt: row
                .get("attempt")
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32,
            started_at: parse_ts(&req_str(row, "started_at")?)?,
            duration_ms: row.get("duration_ms").and_then(Value::as_u64),
            error: row
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload_snapshot,
        })
    }
}

#[async_trait]
impl SagaEventStore for SqlSagaEventStore {
    async fn insert_saga(&self, saga: &Saga) -> Result<()> {
        let row = Self::saga_row(saga)?;
        self.relational.safe_insert("uds3_sagas", &row).await
    }

    async fn load_saga(&self, saga_id: Uuid) -> Result<Saga> {
        let rows = self
            .relational
            .execute_query(
                "SELECT saga_id, name, trace_id, status, steps, owner_token, \
                 lock_expires_at, created_at, updated_at FROM uds3_sagas WHERE saga_id = ?",
                &[Value::String(saga_id.to_string())],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| CoreError::NotFound(format!("saga {} does not exist", saga_id)))?;
        Self::parse_saga(row)
    }

    async fn update_status(&self, saga_id: Uuid, status: SagaStatus) -> Result<()> {
        let (sql, values) = Query::update()
            .table(Sagas::Table)
            .value(Sagas::Status, status.to_string())
            .value(Sagas::UpdatedAt, fmt_ts(Utc::now()))
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
            .build_sqlx(SqliteQueryBuilder);
        let pool = self.relational.pool().await?;
        let result = sqlx::query_with(&sql, values).execute(&pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("saga {} does not exist", saga_id)));
        }
        Ok(())
    }

    async fn try_acquire_lock(&self, saga_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expiry = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let (sql, values) = Query::update()
            .table(Sagas::Table)
            .value(Sagas::OwnerToken, owner.to_string())
            .value(Sagas::LockExpiresAt, fmt_ts(expiry))
            .value(Sagas::UpdatedAt, fmt_ts(now))
            .cond_where(
                Cond::all()
                    .add(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
                    .add(
                        Cond::any()
                            .add(Expr::col(Sagas::OwnerToken).is_null())
                            .add(Expr::col(Sagas::OwnerToken).eq(owner.to_string()))
                            .add(Expr::col(Sagas::LockExpiresAt).lt(fmt_ts(now))),
                    ),
            )
            .build_sqlx(SqliteQueryBuilder);
        let pool = self.relational.pool().await?;
        let result = sqlx::query_with(&sql, values).execute(&pool).await?;
        let acquired = result.rows_affected() == 1;
        debug!(saga_id = %saga_id, owner = %owner, acquired, "lock CAS");
        Ok(acquired)
    }

    async fn renew_lock(&self, saga_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let expiry = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let (sql, values) = Query::update()
            .table(Sagas::Table)
            .value(Sagas::LockExpiresAt, fmt_ts(expiry))
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
            .and_where(Expr::col(Sagas::OwnerToken).eq(owner.to_string()))
            .build_sqlx(SqliteQueryBuilder);
        let pool = self.relational.pool().await?;
        let result = sqlx::query_with(&sql, values).execute(&pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, saga_id: Uuid, owner: Uuid) -> Result<()> {
        let (sql, values) = Query::update()
            .table(Sagas::Table)
            .value(Sagas::OwnerToken, sea_query::Value::String(None))
            .value(Sagas::LockExpiresAt, sea_query::Value::String(None))
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
            .and_where(Expr::col(Sagas::OwnerToken).eq(owner.to_string()))
            .build_sqlx(SqliteQueryBuilder);
        let pool = self.relational.pool().await?;
        sqlx::query_with(&sql, values).execute(&pool).await?;
        Ok(())
    }

    async fn append_event(&self, event: &SagaEvent) -> Result<Uuid> {
        let row = Self::event_row(event);
        self.relational.safe_insert("uds3_saga_events", &row).await?;
        Ok(event.event_id)
    }

    async fn events(&self, saga_id: Uuid) -> Result<Vec<SagaEvent>> {
        let rows = self
            .relational
            .execute_query(
                "SELECT event_id, saga_id, trace_id, step_id, attempt, status, \
                 started_at, duration_ms, error, payload_snapshot \
                 FROM uds3_saga_events WHERE saga_id = ? ORDER BY rowid ASC",
                &[Value::String(saga_id.to_string())],
            )
            .await?;
        rows.iter().map(Self::parse_event).collect()
    }

    async fn open_sagas(&self, older_than: Duration) -> Result<Vec<Uuid>> {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        let rows = self
            .relational
            .execute_query(
                "SELECT saga_id FROM uds3_sagas \
                 WHERE status IN ('Running', 'Compensating', 'Failed') AND updated_at < ? \
                 ORDER BY updated_at ASC",
                &[Value::String(fmt_ts(cutoff))],
            )
            .await?;
        rows.iter().map(|row| req_uuid(row, "saga_id")).collect()
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let mut row = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        };
        row.insert(
            "record_id".into(),
            Value::String(record.record_id.to_string()),
        );
        self.relational.safe_insert("uds3_audit_log", &row).await
    }

    async fn append_metric(&self, sample: &MetricSample) -> Result<()> {
        let mut row = match serde_json::to_value(sample) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        };
        row.insert("metric_id".into(), Value::String(Uuid::new_v4().to_string()));
        self.relational.safe_insert("uds3_saga_metrics", &row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sql::SqlRelationalStore;
    use crate::backends::{BackendKind, Connector};
    use crate::saga::types::StepSpec;
    use serde_json::json;

    async fn sql_store() -> (tempfile::TempDir, Arc<SqlRelationalStore>, SqlSagaEventStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("saga.db");
        let mut options = Payload::new();
        options.insert("path".into(), json!(path.to_str().unwrap()));
        let relational = Arc::new(SqlRelationalStore::from_options(&options));
        relational.connect().await.unwrap();
        migrate(&relational).await.unwrap();
        let store = SqlSagaEventStore::new(relational.clone());
        (dir, relational, store)
    }

    fn saga_with_step() -> Saga {
        let step = StepSpec::new(
            "insert-doc",
            BackendKind::Relational,
            "insert",
            [("table".to_string(), json!("docs"))].into_iter().collect(),
        );
        Saga::new("ingest", vec![step], Some("trace-1".into()))
    }

    #[tokio::test]
    async fn saga_round_trips_through_sql() {
        let (_dir, _rel, store) = sql_store().await;
        let saga = saga_with_step();
        store.insert_saga(&saga).await.unwrap();

        let loaded = store.load_saga(saga.saga_id).await.unwrap();
        assert_eq!(loaded.name, "ingest");
        assert_eq!(loaded.trace_id, "trace-1");
        assert_eq!(loaded.status, SagaStatus::Created);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].step_id, "insert-doc");
        assert_eq!(loaded.steps[0].backend_kind, BackendKind::Relational);
    }

    #[tokio::test]
    async fn status_update_and_missing_saga() {
        let (_dir, _rel, store) = sql_store().await;
        let saga = saga_with_step();
        store.insert_saga(&saga).await.unwrap();

        store
            .update_status(saga.saga_id, SagaStatus::Running)
            .await
            .unwrap();
        assert_eq!(
            store.load_saga(saga.saga_id).await.unwrap().status,
            SagaStatus::Running
        );

        let err = store
            .update_status(Uuid::new_v4(), SagaStatus::Running)
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "NotFound");
    }

    #[tokio::test]
    async fn lock_cas_round_trip() {
        let (_dir, _rel, store) = sql_store().await;
        let saga = saga_with_step();
        store.insert_saga(&saga).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(30);
        assert!(store.try_acquire_lock(saga.saga_id, a, ttl).await.unwrap());
        assert!(!store.try_acquire_lock(saga.saga_id, b, ttl).await.unwrap());
        assert!(store.renew_lock(saga.saga_id, a, ttl).await.unwrap());
        assert!(!store.renew_lock(saga.saga_id, b, ttl).await.unwrap());

        store.release_lock(saga.saga_id, a).await.unwrap();
        assert!(store.try_acquire_lock(saga.saga_id, b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn events_round_trip_in_order() {
        let (_dir, _rel, store) = sql_store().await;
        let saga = saga_with_step();
        store.insert_saga(&saga).await.unwrap();

        let pending = SagaEvent::new(&saga, "insert-doc", StepStatus::Pending, 0)
            .with_snapshot(json!({"table": "docs"}));
        let success = SagaEvent::new(&saga, "insert-doc", StepStatus::Success, 0)
            .with_duration_ms(12);
        store.append_event(&pending).await.unwrap();
        store.append_event(&success).await.unwrap();

        let events = store.events(saga.saga_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, StepStatus::Pending);
        assert_eq!(events[0].payload_snapshot, Some(json!({"table": "docs"})));
        assert_eq!(events[1].status, StepStatus::Success);
        assert_eq!(events[1].duration_ms, Some(12));
    }

    #[tokio::test]
    async fn audit_and_metric_use_blob_fallback_tables() {
        let (_dir, relational, store) = sql_store().await;
        let saga = saga_with_step();
        store.insert_saga(&saga).await.unwrap();

        store
            .append_audit(
                &AuditRecord::new("compensation_failed", "handler x failed")
                    .for_saga(saga.saga_id),
            )
            .await
            .unwrap();
        store
            .append_metric(&MetricSample {
                saga_id: saga.saga_id,
                name: "ingest".into(),
                duration_ms: 42,
                steps_total: 1,
                steps_failed: 0,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();

        let audits = relational
            .execute_query("SELECT record_id, data FROM uds3_audit_log", &[])
            .await
            .unwrap();
        assert_eq!(audits.len(), 1);
        let data: Value =
            serde_json::from_str(audits[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["category"], json!("compensation_failed"));

        let metrics = relational
            .execute_query("SELECT metric_id, data FROM uds3_saga_metrics", &[])
            .await
            .unwrap();
        assert_eq!(metrics.len(), 1);
    }

    #[tokio::test]
    async fn open_sagas_reports_stale_running_sagas() {
        let (_dir, _rel, store) = sql_store().await;
        let saga = saga_with_step();
        store.insert_saga(&saga).await.unwrap();
        store
            .update_status(saga.saga_id, SagaStatus::Running)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let open = store.open_sagas(Duration::from_millis(1)).await.unwrap();
        assert_eq!(open, vec![saga.saga_id]);

        store
            .update_status(saga.saga_id, SagaStatus::Completed)
            .await
            .unwrap();
        let open = store.open_sagas(Duration::from_millis(0)).await.unwrap();
        assert!(open.is_empty());
    }
}
