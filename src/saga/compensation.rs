//! Compensation handler registry and the default handlers.
//!
//! Handlers are registered at process startup; the registry is read-only at
//! runtime and passed into the orchestrator as an explicit dependency.
//! Every handler MUST be idempotent: a second invocation against an
//! already-undone target reports success.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::backends::{BackendKind, Payload};
use crate::error::{CoreError, Result};
use crate::manager::BackendManager;

/// Context handed to a compensation handler.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    pub saga_id: Uuid,
    pub step_id: String,
    pub trace_id: String,
}

/// An idempotent undo operation for a previously successful step.
///
/// The handler receives the ORIGINAL step payload; it derives the undo
/// target from it.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(
        &self,
        manager: &BackendManager,
        payload: &Payload,
        ctx: &CompensationContext,
    ) -> Result<()>;
}

/// Named handler registry.
pub struct CompensationRegistry {
    handlers: HashMap<String, Arc<dyn CompensationHandler>>,
}

impl Default for CompensationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the stock handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("relational_delete", Arc::new(RelationalDelete));
        registry.register("graph_delete_node", Arc::new(GraphDeleteNode));
        registry.register("vector_delete_chunks", Arc::new(VectorDeleteChunks));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CompensationHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CompensationHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Already-gone targets count as undone.
fn absorb_not_found(result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(CoreError::NotFound(reason)) => {
            debug!(reason = %reason, "compensation target already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Default handlers
// ============================================================================

/// Deletes the row a `relational.insert` step created.
///
/// Derives the delete filter from the original payload: an explicit
/// `filter` object wins, then a top-level `id`, then `row.id`.
pub struct RelationalDelete;

#[async_trait]
impl CompensationHandler for RelationalDelete {
    async fn compensate(
        &self,
        manager: &BackendManager,
        payload: &Payload,
        _ctx: &CompensationContext,
    ) -> Result<()> {
        let table = payload
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Permanent("relational_delete: payload has no table".into()))?;

        let filter: Value = if let Some(filter) = payload.get("filter") {
            filter.clone()
        } else if let Some(id) = payload.get("id") {
            serde_json::json!({ "id": id })
        } else if let Some(id) = payload.get("row").and_then(|r| r.get("id")) {
            serde_json::json!({ "id": id })
        } else {
            return Err(CoreError::Permanent(
                "relational_delete: cannot derive a delete filter from the payload".into(),
            ));
        };

        let mut delete = Payload::new();
        delete.insert("table".into(), Value::String(table.to_string()));
        delete.insert("filter".into(), filter);
        absorb_not_found(
            manager
                .execute(BackendKind::Relational, "delete", &delete)
                .await,
        )
    }
}

/// Deletes the node a `graph.create_node` step created.
pub struct GraphDeleteNode;

#[async_trait]
impl CompensationHandler for GraphDeleteNode {
    async fn compensate(
        &self,
        manager: &BackendManager,
        payload: &Payload,
        _ctx: &CompensationContext,
    ) -> Result<()> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Permanent("graph_delete_node: payload has no id".into()))?;

        let mut delete = Payload::new();
        delete.insert("id".into(), Value::String(id.to_string()));
        absorb_not_found(
            manager
                .execute(BackendKind::Graph, "delete_node", &delete)
                .await,
        )
    }
}

/// Deletes the chunks a `vector.add_documents` step ingested.
pub struct VectorDeleteChunks;

#[async_trait]
impl CompensationHandler for VectorDeleteChunks {
    async fn compensate(
        &self,
        manager: &BackendManager,
        payload: &Payload,
        _ctx: &CompensationContext,
    ) -> Result<()> {
        let ids: Vec<Value> = if let Some(ids) = payload.get("ids").and_then(Value::as_array) {
            ids.clone()
        } else if let Some(id) = payload.get("id") {
            vec![id.clone()]
        } else if let Some(documents) = payload.get("documents").and_then(Value::as_array) {
            documents
                .iter()
                .filter_map(|d| d.get("id").cloned())
                .collect()
        } else {
            return Err(CoreError::Permanent(
                "vector_delete_chunks: cannot derive chunk ids from the payload".into(),
            ));
        };

        let mut delete = Payload::new();
        delete.insert("ids".into(), Value::Array(ids));
        absorb_not_found(manager.execute(BackendKind::Vector, "delete", &delete).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{
        MemoryGraphStore, MemoryRelationalStore, MemoryVectorStore,
    };
    use crate::backends::{Backend, GraphNode, GraphStore, RelationalStore, VectorDocument, VectorStore};
    use crate::governance::{GovernanceConfig, GovernanceGate};
    use serde_json::json;
    use std::time::Duration;

    fn ctx() -> CompensationContext {
        CompensationContext {
            saga_id: Uuid::new_v4(),
            step_id: "step".into(),
            trace_id: "trace".into(),
        }
    }

    async fn manager_with(backend: Backend) -> Arc<BackendManager> {
        let manager = BackendManager::from_parts(
            vec![backend],
            GovernanceGate::new(GovernanceConfig::permissive()),
        );
        manager.start_all(None, Duration::from_secs(1)).await;
        manager
    }

    #[test]
    fn defaults_are_registered() {
        let registry = CompensationRegistry::with_defaults();
        for name in ["relational_delete", "graph_delete_node", "vector_delete_chunks"] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
        assert!(registry.get("unknown").is_none());
    }

    #[tokio::test]
    async fn relational_delete_is_idempotent() {
        let store = Arc::new(MemoryRelationalStore::new());
        let manager = manager_with(Backend::Relational(store.clone())).await;
        store
            .insert(
                "docs",
                &[("id".to_string(), json!("d1"))].into_iter().collect(),
            )
            .await
            .unwrap();

        let payload: Payload = [
            ("table".to_string(), json!("docs")),
            ("id".to_string(), json!("d1")),
        ]
        .into_iter()
        .collect();

        let handler = RelationalDelete;
        handler.compensate(&manager, &payload, &ctx()).await.unwrap();
        assert!(store.rows("docs").await.is_empty());
        // Second invocation on the already-undone target reports success.
        handler.compensate(&manager, &payload, &ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn graph_delete_node_is_idempotent() {
        let store = Arc::new(MemoryGraphStore::new());
        let manager = manager_with(Backend::Graph(store.clone())).await;
        store
            .create_node(GraphNode {
                id: "n1".into(),
                label: "Doc".into(),
                properties: Payload::new(),
            })
            .await
            .unwrap();

        let payload: Payload = [
            ("label".to_string(), json!("Doc")),
            ("id".to_string(), json!("n1")),
        ]
        .into_iter()
        .collect();

        let handler = GraphDeleteNode;
        handler.compensate(&manager, &payload, &ctx()).await.unwrap();
        assert!(!store.has_node("n1").await);
        handler.compensate(&manager, &payload, &ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn vector_delete_chunks_handles_single_and_bulk_payloads() {
        let store = Arc::new(MemoryVectorStore::new());
        let manager = manager_with(Backend::Vector(store.clone())).await;
        store
            .add_documents(vec![VectorDocument {
                id: "d1".into(),
                text: Some("hello".into()),
                embedding: None,
                metadata: Payload::new(),
            }])
            .await
            .unwrap();

        let payload: Payload = [
            ("id".to_string(), json!("d1")),
            ("text".to_string(), json!("hello")),
        ]
        .into_iter()
        .collect();

        let handler = VectorDeleteChunks;
        handler.compensate(&manager, &payload, &ctx()).await.unwrap();
        assert!(store.is_empty().await);
        handler.compensate(&manager, &payload, &ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn underivable_target_is_a_permanent_error() {
        let manager = manager_with(Backend::Graph(Arc::new(MemoryGraphStore::new()))).await;
        let err = GraphDeleteNode
            .compensate(&manager, &Payload::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "Permanent");
    }
}
