//! SQL relational adapter (SQLite driver).
//!
//! Queries are built with sea-query so the statements stay dialect-generic;
//! only pool construction and column introspection are SQLite-specific.

use async_trait::async_trait;
use sea_query::{Alias, Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Column, Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{CoreError, Result};

use super::traits::{ColumnInfo, Connector, RelationalStore};
use super::Payload;

/// Relational store over a SQLite pool.
pub struct SqlRelationalStore {
    uri: String,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqlRelationalStore {
    /// Build from adapter options. Recognized fields: `path` (file path,
    /// default `uds3.db`) or `uri` (full sqlx connection string).
    pub fn from_options(options: &Payload) -> Self {
        let uri = match options.get("uri").and_then(Value::as_str) {
            Some(uri) => uri.to_string(),
            None => {
                let path = options
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or("uds3.db");
                if path == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite://{}?mode=rwc", path)
                }
            }
        };
        Self {
            uri,
            pool: RwLock::new(None),
        }
    }

    /// Wrap an already-connected pool (event store and CLI reuse this).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            uri: String::new(),
            pool: RwLock::new(Some(pool)),
        }
    }

    /// Current pool, or `Transient` when not connected.
    pub async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::Transient("relational adapter not connected".into()))
    }

    /// Run a DDL statement batch. Only the `migrate` entry point calls this;
    /// dispatch never issues DDL.
    pub async fn execute_ddl(&self, sql: &str) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::raw_sql(sql).execute(&pool).await?;
        Ok(())
    }
}

/// Table and column names reach SQL as identifiers, not bind values; keep
/// them to a conservative character set.
fn check_ident(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CoreError::Permanent(format!("invalid identifier: '{}'", name)))
    }
}

/// Convert a JSON value into a bindable sea-query value. Arrays and objects
/// are stored as serialized JSON text.
fn to_sea_value(value: &Value) -> sea_query::Value {
    match value {
        Value::Null => sea_query::Value::String(None),
        Value::Bool(b) => sea_query::Value::Bool(Some(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                sea_query::Value::BigInt(Some(i))
            } else {
                sea_query::Value::Double(n.as_f64())
            }
        }
        Value::String(s) => sea_query::Value::String(Some(Box::new(s.clone()))),
        other => sea_query::Value::String(Some(Box::new(other.to_string()))),
    }
}

fn row_to_payload(row: &sqlx::sqlite::SqliteRow) -> Payload {
    let mut map = Payload::new();
    for column in row.columns() {
        let name = column.name();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(name) {
            v.and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(name) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(name) {
            v.map(|bytes| Value::String(hex::encode(bytes)))
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        map.insert(name.to_string(), value);
    }
    map
}

#[async_trait]
impl Connector for SqlRelationalStore {
    fn type_tag(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&self.uri)
            .await
            .map_err(|e| CoreError::Transient(format!("sqlite connect failed: {}", e)))?;
        info!(uri = %self.uri, "relational adapter connected");
        *guard = Some(pool);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for SqlRelationalStore {
    async fn insert(&self, table: &str, row: &Payload) -> Result<u64> {
        check_ident(table)?;
        if row.is_empty() {
            return Err(CoreError::Permanent("insert with empty row".into()));
        }
        let pool = self.pool().await?;

        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(table));
        stmt.columns(row.keys().map(|k| Alias::new(k.as_str())));
        stmt.values_panic(row.values().map(|v| to_sea_value(v).into()));
        let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&pool).await?;
        Ok(result.rows_affected())
    }

    async fn update(&self, table: &str, set: &Payload, filter: &Payload) -> Result<u64> {
        check_ident(table)?;
        if set.is_empty() {
            return Err(CoreError::Permanent("update with empty set clause".into()));
        }
        let pool = self.pool().await?;

        let mut stmt = Query::update();
        stmt.table(Alias::new(table));
        stmt.values(
            set.iter()
                .map(|(k, v)| (Alias::new(k.as_str()), to_sea_value(v).into())),
        );
        for (k, v) in filter {
            stmt.and_where(Expr::col(Alias::new(k.as_str())).eq(to_sea_value(v)));
        }
        let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "no rows matched filter in table '{}'",
                table
            )));
        }
        Ok(result.rows_affected())
    }

    async fn delete(&self, table: &str, filter: &Payload) -> Result<u64> {
        check_ident(table)?;
        let pool = self.pool().await?;

        let mut stmt = Query::delete();
        stmt.from_table(Alias::new(table));
        for (k, v) in filter {
            stmt.and_where(Expr::col(Alias::new(k.as_str())).eq(to_sea_value(v)));
        }
        let (sql, values) = stmt.build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "no rows matched filter in table '{}'",
                table
            )));
        }
        Ok(result.rows_affected())
    }

    async fn execute_query(&self, query: &str, params: &[Value]) -> Result<Vec<Payload>> {
        let pool = self.pool().await?;

        let mut q = sqlx::query(query);
        for param in params {
            q = match param {
                Value::Null => q.bind(None::<String>),
                Value::Bool(b) => q.bind(*b),
                Value::Number(n) if n.is_i64() => q.bind(n.as_i64()),
                Value::Number(n) => q.bind(n.as_f64()),
                Value::String(s) => q.bind(s.clone()),
                other => q.bind(other.to_string()),
            };
        }

        let rows = q.fetch_all(&pool).await?;
        Ok(rows.iter().map(row_to_payload).collect())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        check_ident(table)?;
        let pool = self.pool().await?;

        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&pool)
            .await?;
        if rows.is_empty() {
            return Err(CoreError::NotFound(format!("table '{}' does not exist", table)));
        }

        let columns = rows
            .iter()
            .map(|row| {
                let notnull: i64 = row.get("notnull");
                ColumnInfo {
                    name: row.get("name"),
                    data_type: row.get("type"),
                    nullable: notnull == 0,
                }
            })
            .collect();
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, SqlRelationalStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.db");
        let mut options = Payload::new();
        options.insert("path".into(), json!(path.to_str().unwrap()));
        let store = SqlRelationalStore::from_options(&options);
        store.connect().await.unwrap();
        (dir, store)
    }

    fn row(pairs: &[(&str, Value)]) -> Payload {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn insert_and_query_round_trip() {
        let (_dir, store) = store().await;
        store
            .execute_ddl("CREATE TABLE docs (id TEXT PRIMARY KEY, title TEXT, size INTEGER)")
            .await
            .unwrap();

        store
            .insert("docs", &row(&[("id", json!("d1")), ("title", json!("one")), ("size", json!(3))]))
            .await
            .unwrap();

        let rows = store
            .execute_query("SELECT id, title, size FROM docs WHERE id = ?", &[json!("d1")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("one"));
        assert_eq!(rows[0]["size"], json!(3));
    }

    #[tokio::test]
    async fn duplicate_primary_key_is_conflict() {
        let (_dir, store) = store().await;
        store
            .execute_ddl("CREATE TABLE docs (id TEXT PRIMARY KEY)")
            .await
            .unwrap();
        let r = row(&[("id", json!("d1"))]);
        store.insert("docs", &r).await.unwrap();
        let err = store.insert("docs", &r).await.unwrap_err();
        assert_eq!(err.kind_name(), "Conflict");
    }

    #[tokio::test]
    async fn update_and_delete_missing_rows_are_not_found() {
        let (_dir, store) = store().await;
        store
            .execute_ddl("CREATE TABLE docs (id TEXT PRIMARY KEY, title TEXT)")
            .await
            .unwrap();
        store
            .insert("docs", &row(&[("id", json!("d1")), ("title", json!("one"))]))
            .await
            .unwrap();

        let err = store
            .update(
                "docs",
                &row(&[("title", json!("two"))]),
                &row(&[("id", json!("missing"))]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "NotFound");

        store.delete("docs", &row(&[("id", json!("d1"))])).await.unwrap();
        let err = store
            .delete("docs", &row(&[("id", json!("d1"))]))
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "NotFound");
    }

    #[tokio::test]
    async fn schema_introspection_reports_columns() {
        let (_dir, store) = store().await;
        store
            .execute_ddl("CREATE TABLE events (event_id TEXT PRIMARY KEY, data TEXT NOT NULL)")
            .await
            .unwrap();
        let schema = store.get_table_schema("events").await.unwrap();
        let names: Vec<&str> = schema.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["event_id", "data"]);
        assert!(!schema[1].nullable);

        let err = store.get_table_schema("absent").await.unwrap_err();
        assert_eq!(err.kind_name(), "NotFound");
    }

    #[tokio::test]
    async fn safe_insert_folds_extras_into_data_column() {
        let (_dir, store) = store().await;
        store
            .execute_ddl("CREATE TABLE events (event_id TEXT PRIMARY KEY, data TEXT)")
            .await
            .unwrap();

        store
            .safe_insert(
                "events",
                &row(&[
                    ("event_id", json!("e1")),
                    ("status", json!("Pending")),
                    ("attempt", json!(1)),
                ]),
            )
            .await
            .unwrap();

        let rows = store
            .execute_query("SELECT event_id, data FROM events", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let data: Value = serde_json::from_str(rows[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["status"], json!("Pending"));
        assert_eq!(data["attempt"], json!(1));
    }

    #[tokio::test]
    async fn safe_insert_single_data_column_stores_whole_row() {
        let (_dir, store) = store().await;
        store.execute_ddl("CREATE TABLE opaque (data TEXT)").await.unwrap();

        store
            .safe_insert(
                "opaque",
                &row(&[("event_id", json!("e1")), ("status", json!("Success"))]),
            )
            .await
            .unwrap();

        let rows = store.execute_query("SELECT data FROM opaque", &[]).await.unwrap();
        let data: Value = serde_json::from_str(rows[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["event_id"], json!("e1"));
        assert_eq!(data["status"], json!("Success"));
    }

    #[tokio::test]
    async fn identifier_validation_rejects_injection() {
        let (_dir, store) = store().await;
        let err = store
            .insert("docs; DROP TABLE docs", &row(&[("id", json!("x"))]))
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "Permanent");
    }
}
