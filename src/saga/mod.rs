//! Saga engine: durable, resumable, compensating multi-step transactions
//! across heterogeneous backends.
//!
//! This module contains:
//! - `types`: step specs, saga headers, write-ahead events
//! - `event_store`: the WAL persistence contract + in-memory implementation
//! - `sql_event_store`: relational WAL over the safe-insert helper
//! - `compensation`: handler registry and stock handlers
//! - `orchestrator`: the execution engine

use serde::Deserialize;

pub mod compensation;
pub mod event_store;
pub mod orchestrator;
#[cfg(feature = "sqlite")]
pub mod sql_event_store;
pub mod types;

pub use compensation::{CompensationContext, CompensationHandler, CompensationRegistry};
pub use event_store::{MemorySagaEventStore, SagaEventStore, CREATE_SAGA_TABLES};
pub use orchestrator::{ExecutionReport, SagaOrchestrator};
#[cfg(feature = "sqlite")]
pub use sql_event_store::SqlSagaEventStore;
pub use types::{
    AuditRecord, MetricSample, RetryPolicy, Saga, SagaEvent, SagaStatus, StepSpec, StepStatus,
};

/// Saga engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Which backend kind hosts the event store. Only `relational` (and the
    /// in-process `memory` store) are supported.
    pub event_store_kind: String,
    /// Lock lease time-to-live, in milliseconds.
    pub lease_ttl_ms: u64,
    /// Lease renewal cadence while executing, in milliseconds.
    pub lease_renew_interval_ms: u64,
    /// Whether `abort` drives compensation for already-successful steps.
    pub abort_compensates: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            event_store_kind: "relational".to_string(),
            lease_ttl_ms: 30_000,
            lease_renew_interval_ms: 10_000,
            abort_compensates: true,
        }
    }
}
