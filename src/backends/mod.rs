//! Backend kinds, capability traits, and adapters.
//!
//! This module contains:
//! - `BackendKind`: closed sum type over the supported storage families
//! - Capability traits (`VectorStore`, `GraphStore`, ...) in `traits`
//! - `Backend`: kind-tagged adapter handle with exhaustive operation dispatch
//! - In-memory adapters for every kind (tests and standalone mode)
//! - SQL relational adapter (feature `sqlite`)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sql;
pub mod traits;

pub use traits::{
    ColumnInfo, Connector, DocumentStore, FileStore, GraphEdge, GraphNode, GraphStore,
    KeyValueStore, NodePattern, RelationalStore, VectorDocument, VectorMatch, VectorQuery,
    VectorStore,
};

/// Operation payloads are JSON object maps.
pub type Payload = serde_json::Map<String, Value>;

// ============================================================================
// Kinds
// ============================================================================

/// The closed set of storage backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vector,
    Graph,
    Relational,
    KeyValue,
    Document,
    File,
}

impl BackendKind {
    /// All kinds, in capability-matrix order.
    pub const ALL: [BackendKind; 6] = [
        BackendKind::Vector,
        BackendKind::Graph,
        BackendKind::Relational,
        BackendKind::KeyValue,
        BackendKind::Document,
        BackendKind::File,
    ];

    /// Minimum operation set for this kind.
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Vector => &["add_documents", "query_similar", "delete"],
            BackendKind::Graph => &["create_node", "create_edge", "delete_node", "match"],
            BackendKind::Relational => {
                &["insert", "update", "delete", "execute_query", "get_table_schema"]
            }
            BackendKind::KeyValue => &["get", "put", "delete"],
            BackendKind::Document => &["create", "get", "update", "delete"],
            BackendKind::File => &["put", "get", "delete"],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Vector => "vector",
            BackendKind::Graph => "graph",
            BackendKind::Relational => "relational",
            BackendKind::KeyValue => "key_value",
            BackendKind::Document => "document",
            BackendKind::File => "file",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vector" => Ok(BackendKind::Vector),
            "graph" => Ok(BackendKind::Graph),
            "relational" => Ok(BackendKind::Relational),
            "key_value" | "kv" => Ok(BackendKind::KeyValue),
            "document" => Ok(BackendKind::Document),
            "file" => Ok(BackendKind::File),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// Lifecycle status of a managed backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    Uninitialized,
    Initializing,
    Healthy,
    Degraded,
    Error,
    Offline,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Uninitialized => "uninitialized",
            BackendStatus::Initializing => "initializing",
            BackendStatus::Healthy => "healthy",
            BackendStatus::Degraded => "degraded",
            BackendStatus::Error => "error",
            BackendStatus::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a single backend slot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendEntry {
    /// Whether this backend participates at all.
    pub enabled: bool,
    /// Adapter implementation tag (e.g. `memory`, `sqlite`).
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Connect during manager construction instead of on `start_all`.
    pub autostart: bool,
    /// Adapter-specific fields, preserved but not interpreted by the core.
    #[serde(flatten)]
    pub options: Payload,
}

impl Default for BackendEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            type_tag: "memory".to_string(),
            autostart: false,
            options: Payload::new(),
        }
    }
}

/// One entry per backend kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub vector: BackendEntry,
    pub graph: BackendEntry,
    pub relational: BackendEntry,
    pub key_value: BackendEntry,
    pub document: BackendEntry,
    pub file: BackendEntry,
}

impl BackendsConfig {
    /// Entries in kind order.
    pub fn entries(&self) -> impl Iterator<Item = (BackendKind, &BackendEntry)> {
        [
            (BackendKind::Vector, &self.vector),
            (BackendKind::Graph, &self.graph),
            (BackendKind::Relational, &self.relational),
            (BackendKind::KeyValue, &self.key_value),
            (BackendKind::Document, &self.document),
            (BackendKind::File, &self.file),
        ]
        .into_iter()
    }

    pub fn entry(&self, kind: BackendKind) -> &BackendEntry {
        match kind {
            BackendKind::Vector => &self.vector,
            BackendKind::Graph => &self.graph,
            BackendKind::Relational => &self.relational,
            BackendKind::KeyValue => &self.key_value,
            BackendKind::Document => &self.document,
            BackendKind::File => &self.file,
        }
    }
}

// ============================================================================
// Backend handle with exhaustive dispatch
// ============================================================================

/// A kind-tagged adapter handle.
///
/// Dispatch is exhaustive over the variants; payload maps are converted into
/// typed capability calls here, so adapters never see raw operation names.
#[derive(Clone)]
pub enum Backend {
    Vector(Arc<dyn VectorStore>),
    Graph(Arc<dyn GraphStore>),
    Relational(Arc<dyn RelationalStore>),
    KeyValue(Arc<dyn KeyValueStore>),
    Document(Arc<dyn DocumentStore>),
    File(Arc<dyn FileStore>),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(match self {
            Backend::Vector(_) => "Vector",
            Backend::Graph(_) => "Graph",
            Backend::Relational(_) => "Relational",
            Backend::KeyValue(_) => "KeyValue",
            Backend::Document(_) => "Document",
            Backend::File(_) => "File",
        })
        .finish()
    }
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Vector(_) => BackendKind::Vector,
            Backend::Graph(_) => BackendKind::Graph,
            Backend::Relational(_) => BackendKind::Relational,
            Backend::KeyValue(_) => BackendKind::KeyValue,
            Backend::Document(_) => BackendKind::Document,
            Backend::File(_) => BackendKind::File,
        }
    }

    pub fn type_tag(&self) -> String {
        let tag = match self {
            Backend::Vector(s) => s.type_tag(),
            Backend::Graph(s) => s.type_tag(),
            Backend::Relational(s) => s.type_tag(),
            Backend::KeyValue(s) => s.type_tag(),
            Backend::Document(s) => s.type_tag(),
            Backend::File(s) => s.type_tag(),
        };
        tag.to_string()
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            Backend::Vector(s) => s.connect().await,
            Backend::Graph(s) => s.connect().await,
            Backend::Relational(s) => s.connect().await,
            Backend::KeyValue(s) => s.connect().await,
            Backend::Document(s) => s.connect().await,
            Backend::File(s) => s.connect().await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            Backend::Vector(s) => s.close().await,
            Backend::Graph(s) => s.close().await,
            Backend::Relational(s) => s.close().await,
            Backend::KeyValue(s) => s.close().await,
            Backend::Document(s) => s.close().await,
            Backend::File(s) => s.close().await,
        }
    }

    pub async fn probe(&self) -> Result<()> {
        match self {
            Backend::Vector(s) => s.probe().await,
            Backend::Graph(s) => s.probe().await,
            Backend::Relational(s) => s.probe().await,
            Backend::KeyValue(s) => s.probe().await,
            Backend::Document(s) => s.probe().await,
            Backend::File(s) => s.probe().await,
        }
    }

    /// Execute a named operation against this backend.
    pub async fn execute(&self, operation: &str, payload: &Payload) -> Result<Value> {
        match self {
            Backend::Vector(s) => execute_vector(s.as_ref(), operation, payload).await,
            Backend::Graph(s) => execute_graph(s.as_ref(), operation, payload).await,
            Backend::Relational(s) => execute_relational(s.as_ref(), operation, payload).await,
            Backend::KeyValue(s) => execute_key_value(s.as_ref(), operation, payload).await,
            Backend::Document(s) => execute_document(s.as_ref(), operation, payload).await,
            Backend::File(s) => execute_file(s.as_ref(), operation, payload).await,
        }
    }
}

// ============================================================================
// Per-kind dispatchers
// ============================================================================

fn unsupported(kind: BackendKind, operation: &str) -> CoreError {
    CoreError::Permanent(format!(
        "operation '{}' is not in the {} capability set",
        operation, kind
    ))
}

fn malformed(detail: impl fmt::Display) -> CoreError {
    CoreError::Permanent(format!("malformed payload: {}", detail))
}

fn str_field<'a>(payload: &'a Payload, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(format!("missing string field '{}'", key)))
}

fn object_field<'a>(payload: &'a Payload, key: &str) -> Result<&'a Payload> {
    payload
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| malformed(format!("missing object field '{}'", key)))
}

fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(malformed)
}

/// The payload minus the given routing keys, as a row/document map.
fn residual(payload: &Payload, routing: &[&str]) -> Payload {
    payload
        .iter()
        .filter(|(k, _)| !routing.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn id_list(payload: &Payload) -> Result<Vec<String>> {
    if let Some(ids) = payload.get("ids") {
        return parse(ids.clone());
    }
    if let Some(id) = payload.get("id").and_then(Value::as_str) {
        return Ok(vec![id.to_string()]);
    }
    Err(malformed("expected 'ids' array or 'id' string"))
}

async fn execute_vector(
    store: &dyn VectorStore,
    operation: &str,
    payload: &Payload,
) -> Result<Value> {
    match operation {
        "add_documents" => {
            let documents: Vec<VectorDocument> = match payload.get("documents") {
                Some(docs) => parse(docs.clone())?,
                // A single document inline in the payload.
                None => vec![parse(Value::Object(payload.clone()))?],
            };
            let inserted = store.add_documents(documents).await?;
            Ok(serde_json::json!({ "inserted": inserted }))
        }
        "query_similar" => {
            let query: VectorQuery = parse(Value::Object(payload.clone()))?;
            let matches = store.query_similar(query).await?;
            Ok(serde_json::to_value(matches).map_err(malformed)?)
        }
        "delete" => {
            let deleted = store.delete(id_list(payload)?).await?;
            Ok(serde_json::json!({ "deleted": deleted }))
        }
        other => Err(unsupported(BackendKind::Vector, other)),
    }
}

async fn execute_graph(
    store: &dyn GraphStore,
    operation: &str,
    payload: &Payload,
) -> Result<Value> {
    match operation {
        "create_node" => {
            let node: GraphNode = parse(Value::Object(payload.clone()))?;
            store.create_node(node).await?;
            Ok(serde_json::json!({ "created": true }))
        }
        "create_edge" => {
            let edge: GraphEdge = parse(Value::Object(payload.clone()))?;
            store.create_edge(edge).await?;
            Ok(serde_json::json!({ "created": true }))
        }
        "delete_node" => {
            store.delete_node(str_field(payload, "id")?).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        "match" => {
            let pattern: NodePattern = parse(Value::Object(payload.clone()))?;
            let nodes = store.match_nodes(pattern).await?;
            Ok(serde_json::to_value(nodes).map_err(malformed)?)
        }
        other => Err(unsupported(BackendKind::Graph, other)),
    }
}

async fn execute_relational(
    store: &dyn RelationalStore,
    operation: &str,
    payload: &Payload,
) -> Result<Value> {
    match operation {
        "insert" => {
            let table = str_field(payload, "table")?;
            let row = match payload.get("row").and_then(Value::as_object) {
                Some(row) => row.clone(),
                // Row fields inline next to the table name.
                None => residual(payload, &["table"]),
            };
            let rows = store.insert(table, &row).await?;
            Ok(serde_json::json!({ "rows_affected": rows }))
        }
        "update" => {
            let table = str_field(payload, "table")?;
            let set = object_field(payload, "set")?;
            let filter = object_field(payload, "filter")?;
            let rows = store.update(table, set, filter).await?;
            Ok(serde_json::json!({ "rows_affected": rows }))
        }
        "delete" => {
            let table = str_field(payload, "table")?;
            let filter = match payload.get("filter").and_then(Value::as_object) {
                Some(filter) => filter.clone(),
                None => residual(payload, &["table"]),
            };
            let rows = store.delete(table, &filter).await?;
            Ok(serde_json::json!({ "rows_affected": rows }))
        }
        "execute_query" => {
            let query = str_field(payload, "query")?;
            let params: Vec<Value> = match payload.get("params") {
                Some(params) => parse(params.clone())?,
                None => Vec::new(),
            };
            let rows = store.execute_query(query, &params).await?;
            Ok(serde_json::to_value(rows).map_err(malformed)?)
        }
        "get_table_schema" => {
            let columns = store.get_table_schema(str_field(payload, "table")?).await?;
            Ok(serde_json::to_value(columns).map_err(malformed)?)
        }
        other => Err(unsupported(BackendKind::Relational, other)),
    }
}

async fn execute_key_value(
    store: &dyn KeyValueStore,
    operation: &str,
    payload: &Payload,
) -> Result<Value> {
    match operation {
        "get" => {
            let value = store.get(str_field(payload, "key")?).await?;
            Ok(value.unwrap_or(Value::Null))
        }
        "put" => {
            let value = payload
                .get("value")
                .cloned()
                .ok_or_else(|| malformed("missing field 'value'"))?;
            store.put(str_field(payload, "key")?, value).await?;
            Ok(serde_json::json!({ "stored": true }))
        }
        "delete" => {
            store.delete(str_field(payload, "key")?).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        other => Err(unsupported(BackendKind::KeyValue, other)),
    }
}

async fn execute_document(
    store: &dyn DocumentStore,
    operation: &str,
    payload: &Payload,
) -> Result<Value> {
    match operation {
        "create" => {
            let collection = str_field(payload, "collection")?;
            let id = payload.get("id").and_then(Value::as_str);
            let document = match payload.get("document") {
                Some(doc) => doc.clone(),
                None => Value::Object(residual(payload, &["collection", "id"])),
            };
            let id = store.create(collection, id, document).await?;
            Ok(serde_json::json!({ "id": id }))
        }
        "get" => {
            let document = store
                .get(str_field(payload, "collection")?, str_field(payload, "id")?)
                .await?;
            Ok(document)
        }
        "update" => {
            let document = payload
                .get("document")
                .cloned()
                .ok_or_else(|| malformed("missing field 'document'"))?;
            store
                .update(
                    str_field(payload, "collection")?,
                    str_field(payload, "id")?,
                    document,
                )
                .await?;
            Ok(serde_json::json!({ "updated": true }))
        }
        "delete" => {
            store
                .delete(str_field(payload, "collection")?, str_field(payload, "id")?)
                .await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        other => Err(unsupported(BackendKind::Document, other)),
    }
}

async fn execute_file(
    store: &dyn FileStore,
    operation: &str,
    payload: &Payload,
) -> Result<Value> {
    match operation {
        "put" => {
            let content = str_field(payload, "content")?;
            store.put(str_field(payload, "path")?, content.as_bytes()).await?;
            Ok(serde_json::json!({ "stored": true }))
        }
        "get" => {
            let bytes = store.get(str_field(payload, "path")?).await?;
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
        "delete" => {
            store.delete(str_field(payload, "path")?).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        other => Err(unsupported(BackendKind::File, other)),
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build the adapter for a backend slot from its configuration entry.
///
/// Unknown adapter tags are configuration errors; a known adapter whose
/// driver feature is compiled out still constructs and reports
/// unavailability on `connect`.
pub fn build_backend(kind: BackendKind, entry: &BackendEntry) -> Result<Backend> {
    match (kind, entry.type_tag.as_str()) {
        (BackendKind::Vector, "memory") => {
            Ok(Backend::Vector(Arc::new(memory::MemoryVectorStore::new())))
        }
        (BackendKind::Graph, "memory") => {
            Ok(Backend::Graph(Arc::new(memory::MemoryGraphStore::new())))
        }
        (BackendKind::Relational, "memory") => Ok(Backend::Relational(Arc::new(
            memory::MemoryRelationalStore::new(),
        ))),
        (BackendKind::KeyValue, "memory") => Ok(Backend::KeyValue(Arc::new(
            memory::MemoryKeyValueStore::new(),
        ))),
        (BackendKind::Document, "memory") => Ok(Backend::Document(Arc::new(
            memory::MemoryDocumentStore::new(),
        ))),
        (BackendKind::File, "memory") => {
            Ok(Backend::File(Arc::new(memory::MemoryFileStore::new())))
        }
        #[cfg(feature = "sqlite")]
        (BackendKind::Relational, "sqlite") => Ok(Backend::Relational(Arc::new(
            sql::SqlRelationalStore::from_options(&entry.options),
        ))),
        #[cfg(not(feature = "sqlite"))]
        (BackendKind::Relational, "sqlite") => Ok(Backend::Relational(Arc::new(
            memory::UnavailableRelationalStore::new("sqlite"),
        ))),
        (kind, other) => Err(CoreError::Permanent(format!(
            "unknown adapter type '{}' for backend kind {}",
            other, kind
        ))),
    }
}
