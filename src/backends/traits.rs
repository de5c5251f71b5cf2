//! Capability interfaces, one per backend kind.
//!
//! Adapters implement the trait for their kind plus [`Connector`] for
//! lifecycle. Construction never touches the driver; unavailability is
//! reported from `connect`, so a missing driver library shows up as an
//! `Offline` backend instead of a startup panic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

use super::Payload;

/// Adapter lifecycle surface.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Adapter implementation tag (e.g. `memory`, `sqlite`).
    fn type_tag(&self) -> &str;

    /// Establish the driver connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Close the driver connection. Idempotent; never fails on a
    /// never-connected adapter.
    async fn close(&self) -> Result<()>;

    /// Cheap liveness probe against the connected driver.
    async fn probe(&self) -> Result<()>;
}

/// A document stored in a vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Payload,
}

/// Similarity query against a vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorQuery {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for VectorQuery {
    fn default() -> Self {
        Self {
            text: None,
            embedding: None,
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}

/// One similarity hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
}

/// Vector backend capability set.
///
/// `add_documents` carries upsert semantics: re-adding an existing id
/// replaces the stored document. The adaptive batcher's replay path
/// relies on this.
#[async_trait]
pub trait VectorStore: Connector {
    async fn add_documents(&self, documents: Vec<VectorDocument>) -> Result<u64>;
    async fn query_similar(&self, query: VectorQuery) -> Result<Vec<VectorMatch>>;
    async fn delete(&self, ids: Vec<String>) -> Result<u64>;
}

/// A node in a graph backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub properties: Payload,
}

/// A directed edge in a graph backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub label: String,
    #[serde(default)]
    pub properties: Payload,
}

/// Match pattern for node lookups. Empty pattern matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePattern {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub properties: Payload,
}

/// Graph backend capability set.
#[async_trait]
pub trait GraphStore: Connector {
    async fn create_node(&self, node: GraphNode) -> Result<()>;
    async fn create_edge(&self, edge: GraphEdge) -> Result<()>;
    /// Removes the node and its incident edges. `NotFound` when absent.
    async fn delete_node(&self, id: &str) -> Result<()>;
    async fn match_nodes(&self, pattern: NodePattern) -> Result<Vec<GraphNode>>;
}

/// Column metadata from relational introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Relational backend capability set.
///
/// Beyond plain CRUD this carries the schema-sensitive insert the saga
/// event store writes through: event tables vary across deployments, so
/// rows are projected onto the columns actually present.
#[async_trait]
pub trait RelationalStore: Connector {
    async fn insert(&self, table: &str, row: &Payload) -> Result<u64>;
    async fn update(&self, table: &str, set: &Payload, filter: &Payload) -> Result<u64>;
    async fn delete(&self, table: &str, filter: &Payload) -> Result<u64>;
    async fn execute_query(&self, query: &str, params: &[Value]) -> Result<Vec<Payload>>;
    async fn get_table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Insert `row` projecting onto the target table's actual columns.
    ///
    /// Fields without a matching column are folded into a `data` JSON
    /// catch-all column when one exists, and dropped otherwise. A table
    /// exposing only an opaque `data` column receives the whole row as a
    /// single JSON blob.
    async fn safe_insert(&self, table: &str, row: &Payload) -> Result<()> {
        let columns = self.get_table_schema(table).await?;
        let projected = project_row(row, &columns);
        self.insert(table, &projected).await?;
        Ok(())
    }
}

/// Project a row onto the available columns (see [`RelationalStore::safe_insert`]).
pub fn project_row(row: &Payload, columns: &[ColumnInfo]) -> Payload {
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let has_data = names.contains(&"data");

    let mut matched = Payload::new();
    let mut leftover = Payload::new();
    for (key, value) in row {
        if key != "data" && names.contains(&key.as_str()) {
            matched.insert(key.clone(), value.clone());
        } else {
            leftover.insert(key.clone(), value.clone());
        }
    }

    if matched.is_empty() && has_data {
        // Opaque table: the whole row becomes one JSON blob.
        let mut blob = Payload::new();
        blob.insert("data".into(), Value::Object(row.clone()));
        return blob;
    }

    if !leftover.is_empty() && has_data {
        matched.insert("data".into(), Value::Object(leftover));
    }
    matched
}

/// Key-value backend capability set.
#[async_trait]
pub trait KeyValueStore: Connector {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    /// `NotFound` when the key is absent.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Document backend capability set.
#[async_trait]
pub trait DocumentStore: Connector {
    /// Returns the document id (generated when `id` is `None`).
    async fn create(&self, collection: &str, id: Option<&str>, document: Value) -> Result<String>;
    async fn get(&self, collection: &str, id: &str) -> Result<Value>;
    async fn update(&self, collection: &str, id: &str, document: Value) -> Result<()>;
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

/// File backend capability set.
#[async_trait]
pub trait FileStore: Connector {
    async fn put(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    async fn delete(&self, path: &str) -> Result<()>;
}
