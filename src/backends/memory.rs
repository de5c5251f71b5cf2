//! In-memory adapters for every backend kind.
//!
//! Used by tests and by the standalone profile. Each adapter honors the
//! connect/close lifecycle and supports scripted fault injection so failure
//! paths (retry, compensation, recovery-log spill) can be exercised
//! deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, Result};

use super::traits::{
    ColumnInfo, Connector, DocumentStore, FileStore, GraphEdge, GraphNode, GraphStore,
    KeyValueStore, NodePattern, RelationalStore, VectorDocument, VectorMatch, VectorQuery,
    VectorStore,
};
use super::Payload;

// ============================================================================
// Shared lifecycle / fault machinery
// ============================================================================

/// Connection state shared by all memory adapters.
#[derive(Default)]
struct ConnGate {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_probes: AtomicU32,
}

impl ConnGate {
    fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(CoreError::Transient("injected connect failure".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn ensure(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::Transient("adapter not connected".into()))
        }
    }

    fn probe(&self) -> Result<()> {
        self.ensure()?;
        let remaining = self.fail_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_probes.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::Transient("injected probe failure".into()));
        }
        Ok(())
    }
}

/// One-shot fault queue: each injected error fails exactly one operation,
/// in injection order.
#[derive(Default)]
pub struct FaultPlan {
    queue: Mutex<VecDeque<CoreError>>,
}

impl FaultPlan {
    pub fn inject(&self, error: CoreError) {
        self.queue.lock().expect("fault queue poisoned").push_back(error);
    }

    pub fn inject_n(&self, error: CoreError, n: usize) {
        let mut queue = self.queue.lock().expect("fault queue poisoned");
        for _ in 0..n {
            queue.push_back(error.clone());
        }
    }

    fn check(&self) -> Result<()> {
        match self.queue.lock().expect("fault queue poisoned").pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

macro_rules! memory_connector {
    ($ty:ty, $tag:literal) => {
        #[async_trait]
        impl Connector for $ty {
            fn type_tag(&self) -> &str {
                $tag
            }

            async fn connect(&self) -> Result<()> {
                self.gate.connect()
            }

            async fn close(&self) -> Result<()> {
                self.gate.close();
                Ok(())
            }

            async fn probe(&self) -> Result<()> {
                self.gate.probe()
            }
        }

        impl $ty {
            /// Fail exactly the next operation with the given error.
            pub fn inject_fault(&self, error: CoreError) {
                self.faults.inject(error);
            }

            /// Fail the next `n` operations with clones of the given error.
            pub fn inject_faults(&self, error: CoreError, n: usize) {
                self.faults.inject_n(error, n);
            }

            /// Make `connect` fail until cleared.
            pub fn set_connect_failure(&self, fail: bool) {
                self.gate.fail_connect.store(fail, Ordering::SeqCst);
            }

            /// Fail the next `n` probes.
            pub fn fail_next_probes(&self, n: u32) {
                self.gate.fail_probes.store(n, Ordering::SeqCst);
            }
        }
    };
}

// ============================================================================
// Vector
// ============================================================================

/// In-memory vector store with naive token-overlap similarity.
#[derive(Default)]
pub struct MemoryVectorStore {
    gate: ConnGate,
    faults: FaultPlan,
    documents: RwLock<HashMap<String, VectorDocument>>,
}

memory_connector!(MemoryVectorStore, "memory");

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids currently stored, for test assertions.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn token_overlap(query: &str, text: &str) -> f32 {
    let text_lower = text.to_lowercase();
    let tokens: Vec<&str> = text_lower.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let query_lower = query.to_lowercase();
    let hits = query_lower
        .split_whitespace()
        .filter(|t| tokens.contains(t))
        .count();
    hits as f32 / tokens.len() as f32
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn add_documents(&self, documents: Vec<VectorDocument>) -> Result<u64> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut stored = self.documents.write().await;
        let count = documents.len() as u64;
        for doc in documents {
            stored.insert(doc.id.clone(), doc);
        }
        Ok(count)
    }

    async fn query_similar(&self, query: VectorQuery) -> Result<Vec<VectorMatch>> {
        self.gate.ensure()?;
        self.faults.check()?;
        let stored = self.documents.read().await;
        let mut matches: Vec<VectorMatch> = stored
            .values()
            .map(|doc| {
                let score = match (&query.embedding, &doc.embedding) {
                    (Some(q), Some(d)) => cosine(q, d),
                    _ => match (&query.text, &doc.text) {
                        (Some(q), Some(t)) => token_overlap(q, t),
                        _ => 0.0,
                    },
                };
                VectorMatch {
                    id: doc.id.clone(),
                    score,
                }
            })
            .filter(|m| m.score > 0.0)
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(query.top_k);
        Ok(matches)
    }

    async fn delete(&self, ids: Vec<String>) -> Result<u64> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut stored = self.documents.write().await;
        let mut deleted = 0;
        for id in ids {
            if stored.remove(&id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

// ============================================================================
// Graph
// ============================================================================

/// In-memory property graph.
#[derive(Default)]
pub struct MemoryGraphStore {
    gate: ConnGate,
    faults: FaultPlan,
    nodes: RwLock<HashMap<String, GraphNode>>,
    edges: RwLock<Vec<GraphEdge>>,
}

memory_connector!(MemoryGraphStore, "memory");

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_node(&self, id: &str) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn create_node(&self, node: GraphNode) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(CoreError::Conflict(format!("node '{}' already exists", node.id)));
        }
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn create_edge(&self, edge: GraphEdge) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        let nodes = self.nodes.read().await;
        for endpoint in [&edge.from, &edge.to] {
            if !nodes.contains_key(endpoint) {
                return Err(CoreError::NotFound(format!("node '{}' does not exist", endpoint)));
            }
        }
        drop(nodes);
        self.edges.write().await.push(edge);
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut nodes = self.nodes.write().await;
        if nodes.remove(id).is_none() {
            return Err(CoreError::NotFound(format!("node '{}' does not exist", id)));
        }
        self.edges
            .write()
            .await
            .retain(|e| e.from != id && e.to != id);
        Ok(())
    }

    async fn match_nodes(&self, pattern: NodePattern) -> Result<Vec<GraphNode>> {
        self.gate.ensure()?;
        self.faults.check()?;
        let nodes = self.nodes.read().await;
        let mut found: Vec<GraphNode> = nodes
            .values()
            .filter(|node| {
                if let Some(label) = &pattern.label {
                    if &node.label != label {
                        return false;
                    }
                }
                pattern
                    .properties
                    .iter()
                    .all(|(k, v)| node.properties.get(k) == Some(v))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

// ============================================================================
// Relational
// ============================================================================

#[derive(Default)]
struct MemTable {
    columns: Option<Vec<ColumnInfo>>,
    rows: Vec<Payload>,
}

/// In-memory relational store.
///
/// Tables are schemaless unless declared via [`MemoryRelationalStore::define_table`];
/// declared schemas feed `get_table_schema` so safe-insert projection can be
/// tested against varying table shapes. Raw SQL is not supported.
#[derive(Default)]
pub struct MemoryRelationalStore {
    gate: ConnGate,
    faults: FaultPlan,
    tables: RwLock<HashMap<String, MemTable>>,
}

memory_connector!(MemoryRelationalStore, "memory");

fn row_matches(row: &Payload, filter: &Payload) -> bool {
    filter.iter().all(|(k, v)| row.get(k) == Some(v))
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table with an explicit column set.
    pub async fn define_table(&self, name: &str, columns: Vec<ColumnInfo>) {
        let mut tables = self.tables.write().await;
        tables.entry(name.to_string()).or_default().columns = Some(columns);
    }

    /// Rows currently stored in a table, for test assertions.
    pub async fn rows(&self, table: &str) -> Vec<Payload> {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn insert(&self, table: &str, row: &Payload) -> Result<u64> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut tables = self.tables.write().await;
        let entry = tables.entry(table.to_string()).or_default();
        if let Some(id) = row.get("id") {
            if entry.rows.iter().any(|r| r.get("id") == Some(id)) {
                return Err(CoreError::Conflict(format!(
                    "duplicate id {} in table '{}'",
                    id, table
                )));
            }
        }
        entry.rows.push(row.clone());
        Ok(1)
    }

    async fn update(&self, table: &str, set: &Payload, filter: &Payload) -> Result<u64> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| CoreError::NotFound(format!("table '{}' does not exist", table)))?;
        let mut updated = 0;
        for row in entry.rows.iter_mut().filter(|r| row_matches(r, filter)) {
            for (k, v) in set {
                row.insert(k.clone(), v.clone());
            }
            updated += 1;
        }
        if updated == 0 {
            return Err(CoreError::NotFound(format!(
                "no rows matched filter in table '{}'",
                table
            )));
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Payload) -> Result<u64> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| CoreError::NotFound(format!("table '{}' does not exist", table)))?;
        let before = entry.rows.len();
        entry.rows.retain(|r| !row_matches(r, filter));
        let deleted = (before - entry.rows.len()) as u64;
        if deleted == 0 {
            return Err(CoreError::NotFound(format!(
                "no rows matched filter in table '{}'",
                table
            )));
        }
        Ok(deleted)
    }

    async fn execute_query(&self, _query: &str, _params: &[Value]) -> Result<Vec<Payload>> {
        self.gate.ensure()?;
        self.faults.check()?;
        Err(CoreError::Permanent(
            "raw SQL is not supported by the memory adapter".into(),
        ))
    }

    async fn get_table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.gate.ensure()?;
        self.faults.check()?;
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| CoreError::NotFound(format!("table '{}' does not exist", table)))?;
        if let Some(columns) = &entry.columns {
            return Ok(columns.clone());
        }
        // Schemaless: infer from the first row.
        let inferred = entry
            .rows
            .first()
            .map(|row| {
                row.keys()
                    .map(|name| ColumnInfo {
                        name: name.clone(),
                        data_type: "TEXT".into(),
                        nullable: true,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(inferred)
    }
}

// ============================================================================
// Key-value
// ============================================================================

/// In-memory key-value store.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    gate: ConnGate,
    faults: FaultPlan,
    entries: RwLock<HashMap<String, Value>>,
}

memory_connector!(MemoryKeyValueStore, "memory");

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.gate.ensure()?;
        self.faults.check()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        if self.entries.write().await.remove(key).is_none() {
            return Err(CoreError::NotFound(format!("key '{}' does not exist", key)));
        }
        Ok(())
    }
}

// ============================================================================
// Document
// ============================================================================

/// In-memory document store with per-collection id maps.
#[derive(Default)]
pub struct MemoryDocumentStore {
    gate: ConnGate,
    faults: FaultPlan,
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

memory_connector!(MemoryDocumentStore, "memory");

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, collection: &str, id: Option<&str>, document: Value) -> Result<String> {
        self.gate.ensure()?;
        self.faults.check()?;
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.to_string()).or_default();
        if entries.contains_key(&id) {
            return Err(CoreError::Conflict(format!(
                "document '{}' already exists in '{}'",
                id, collection
            )));
        }
        entries.insert(id.clone(), document);
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value> {
        self.gate.ensure()?;
        self.faults.check()?;
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound(format!("document '{}' not in '{}'", id, collection))
            })
    }

    async fn update(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut collections = self.collections.write().await;
        let entries = collections
            .get_mut(collection)
            .ok_or_else(|| CoreError::NotFound(format!("collection '{}' does not exist", collection)))?;
        match entries.get_mut(id) {
            Some(existing) => {
                *existing = document;
                Ok(())
            }
            None => Err(CoreError::NotFound(format!(
                "document '{}' not in '{}'",
                id, collection
            ))),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        let mut collections = self.collections.write().await;
        let removed = collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some();
        if !removed {
            return Err(CoreError::NotFound(format!(
                "document '{}' not in '{}'",
                id, collection
            )));
        }
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// In-memory blob store keyed by path.
#[derive(Default)]
pub struct MemoryFileStore {
    gate: ConnGate,
    faults: FaultPlan,
    files: RwLock<HashMap<String, Vec<u8>>>,
}

memory_connector!(MemoryFileStore, "memory");

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(&self, path: &str, content: &[u8]) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        self.files
            .write()
            .await
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.gate.ensure()?;
        self.faults.check()?;
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("file '{}' does not exist", path)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.gate.ensure()?;
        self.faults.check()?;
        if self.files.write().await.remove(path).is_none() {
            return Err(CoreError::NotFound(format!("file '{}' does not exist", path)));
        }
        Ok(())
    }
}

// ============================================================================
// Driver-absent placeholder
// ============================================================================

/// Relational placeholder used when the configured driver is compiled out.
///
/// Constructs successfully and reports unavailability on `connect`, so the
/// manager marks the backend `Offline` and continues.
#[cfg(not(feature = "sqlite"))]
pub struct UnavailableRelationalStore {
    tag: String,
}

#[cfg(not(feature = "sqlite"))]
impl UnavailableRelationalStore {
    pub fn new(tag: &str) -> Self {
        Self { tag: tag.to_string() }
    }

    fn unavailable(&self) -> CoreError {
        CoreError::Unavailable {
            kind: super::BackendKind::Relational,
            status: super::BackendStatus::Offline,
        }
    }
}

#[cfg(not(feature = "sqlite"))]
#[async_trait]
impl Connector for UnavailableRelationalStore {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self) -> Result<()> {
        Err(self.unavailable())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        Err(self.unavailable())
    }
}

#[cfg(not(feature = "sqlite"))]
#[async_trait]
impl RelationalStore for UnavailableRelationalStore {
    async fn insert(&self, _table: &str, _row: &Payload) -> Result<u64> {
        Err(self.unavailable())
    }

    async fn update(&self, _table: &str, _set: &Payload, _filter: &Payload) -> Result<u64> {
        Err(self.unavailable())
    }

    async fn delete(&self, _table: &str, _filter: &Payload) -> Result<u64> {
        Err(self.unavailable())
    }

    async fn execute_query(&self, _query: &str, _params: &[Value]) -> Result<Vec<Payload>> {
        Err(self.unavailable())
    }

    async fn get_table_schema(&self, _table: &str) -> Result<Vec<ColumnInfo>> {
        Err(self.unavailable())
    }
}
