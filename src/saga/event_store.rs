//! Saga event store interface, schema, and the in-memory implementation.
//!
//! The store is an injected dependency: the orchestrator only needs the
//! minimal insert/select/update contract below. Events are returned in
//! insertion order, which within one saga coincides with `(step order,
//! attempt)` because steps never execute concurrently.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, Result};

use super::types::{AuditRecord, MetricSample, Saga, SagaEvent, SagaStatus};

/// DDL for the saga event-store schema. Executed only by the `migrate`
/// entry point; the core never issues DDL at runtime.
///
/// `uds3_saga_metrics` and `uds3_audit_log` are opaque single-blob tables,
/// written through the safe-insert fallback path.
pub const CREATE_SAGA_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS uds3_sagas (
    saga_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    status TEXT NOT NULL,
    steps TEXT NOT NULL,
    owner_token TEXT,
    lock_expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS uds3_saga_events (
    event_id TEXT PRIMARY KEY,
    saga_id TEXT NOT NULL,
    trace_id TEXT,
    step_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    duration_ms INTEGER,
    error TEXT,
    payload_snapshot TEXT
);

CREATE INDEX IF NOT EXISTS idx_uds3_saga_events_saga ON uds3_saga_events(saga_id);

CREATE TABLE IF NOT EXISTS uds3_saga_metrics (
    metric_id TEXT PRIMARY KEY,
    data TEXT
);

CREATE TABLE IF NOT EXISTS uds3_audit_log (
    record_id TEXT PRIMARY KEY,
    data TEXT
);
"#;

/// Minimal persistence contract the orchestrator drives.
#[async_trait]
pub trait SagaEventStore: Send + Sync {
    async fn insert_saga(&self, saga: &Saga) -> Result<()>;

    /// `NotFound` when the saga does not exist.
    async fn load_saga(&self, saga_id: Uuid) -> Result<Saga>;

    async fn update_status(&self, saga_id: Uuid, status: SagaStatus) -> Result<()>;

    /// Row-level CAS: claims the lock when it is free, already ours, or
    /// expired. Returns `false` when a live foreign owner holds it.
    async fn try_acquire_lock(&self, saga_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool>;

    /// Extends the lease; `false` when the lock is no longer ours.
    async fn renew_lock(&self, saga_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool>;

    /// Clears the lock if we hold it. Never fails on a lost lock.
    async fn release_lock(&self, saga_id: Uuid, owner: Uuid) -> Result<()>;

    /// Append one write-ahead event; durable before return. Returns the
    /// generated event id.
    async fn append_event(&self, event: &SagaEvent) -> Result<Uuid>;

    /// All events for a saga, in insertion order.
    async fn events(&self, saga_id: Uuid) -> Result<Vec<SagaEvent>>;

    /// Non-terminal sagas whose last update is older than the duration.
    async fn open_sagas(&self, older_than: Duration) -> Result<Vec<Uuid>>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;

    async fn append_metric(&self, sample: &MetricSample) -> Result<()>;
}

/// Saga statuses the recovery worker considers open.
pub(crate) fn is_open(status: SagaStatus) -> bool {
    matches!(
        status,
        SagaStatus::Running | SagaStatus::Compensating | SagaStatus::Failed
    )
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySagaEventStore {
    sagas: RwLock<HashMap<Uuid, Saga>>,
    events: RwLock<Vec<SagaEvent>>,
    audits: RwLock<Vec<AuditRecord>>,
    metrics: RwLock<Vec<MetricSample>>,
}

impl MemorySagaEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit records written so far, for test assertions.
    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.audits.read().await.clone()
    }

    pub async fn metric_samples(&self) -> Vec<MetricSample> {
        self.metrics.read().await.clone()
    }
}

#[async_trait]
impl SagaEventStore for MemorySagaEventStore {
    async fn insert_saga(&self, saga: &Saga) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(&saga.saga_id) {
            return Err(CoreError::Conflict(format!(
                "saga {} already exists",
                saga.saga_id
            )));
        }
        sagas.insert(saga.saga_id, saga.clone());
        Ok(())
    }

    async fn load_saga(&self, saga_id: Uuid) -> Result<Saga> {
        self.sagas
            .read()
            .await
            .get(&saga_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("saga {} does not exist", saga_id)))
    }

    async fn update_status(&self, saga_id: Uuid, status: SagaStatus) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&saga_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {} does not exist", saga_id)))?;
        saga.status = status;
        saga.updated_at = Utc::now();
        Ok(())
    }

    async fn try_acquire_lock(&self, saga_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&saga_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {} does not exist", saga_id)))?;
        let now = Utc::now();
        let free = match (saga.owner_token, saga.lock_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (_, Some(expires)) => expires < now,
            (Some(_), None) => false,
        };
        if free {
            saga.owner_token = Some(owner);
            saga.lock_expires_at =
                Some(now + chrono::Duration::milliseconds(ttl.as_millis() as i64));
            saga.updated_at = now;
        }
        Ok(free)
    }

    async fn renew_lock(&self, saga_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&saga_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {} does not exist", saga_id)))?;
        if saga.owner_token != Some(owner) {
            return Ok(false);
        }
        saga.lock_expires_at =
            Some(Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64));
        Ok(true)
    }

    async fn release_lock(&self, saga_id: Uuid, owner: Uuid) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        if let Some(saga) = sagas.get_mut(&saga_id) {
            if saga.owner_token == Some(owner) {
                saga.owner_token = None;
                saga.lock_expires_at = None;
            }
        }
        Ok(())
    }

    async fn append_event(&self, event: &SagaEvent) -> Result<Uuid> {
        self.events.write().await.push(event.clone());
        Ok(event.event_id)
    }

    async fn events(&self, saga_id: Uuid) -> Result<Vec<SagaEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect())
    }

    async fn open_sagas(&self, older_than: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        let mut open: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .sagas
            .read()
            .await
            .values()
            .filter(|s| is_open(s.status) && s.updated_at < cutoff)
            .map(|s| (s.updated_at, s.saga_id))
            .collect();
        open.sort();
        Ok(open.into_iter().map(|(_, id)| id).collect())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.audits.write().await.push(record.clone());
        Ok(())
    }

    async fn append_metric(&self, sample: &MetricSample) -> Result<()> {
        self.metrics.write().await.push(sample.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::types::StepStatus;

    fn saga() -> Saga {
        Saga::new("test", vec![], None)
    }

    #[tokio::test]
    async fn insert_is_unique_per_saga_id() {
        let store = MemorySagaEventStore::new();
        let s = saga();
        store.insert_saga(&s).await.unwrap();
        assert_eq!(
            store.insert_saga(&s).await.unwrap_err().kind_name(),
            "Conflict"
        );
    }

    #[tokio::test]
    async fn lock_cas_excludes_foreign_owner() {
        let store = MemorySagaEventStore::new();
        let s = saga();
        store.insert_saga(&s).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire_lock(s.saga_id, a, ttl).await.unwrap());
        assert!(!store.try_acquire_lock(s.saga_id, b, ttl).await.unwrap());
        // Re-acquisition by the same owner succeeds.
        assert!(store.try_acquire_lock(s.saga_id, a, ttl).await.unwrap());

        assert!(store.renew_lock(s.saga_id, a, ttl).await.unwrap());
        assert!(!store.renew_lock(s.saga_id, b, ttl).await.unwrap());

        store.release_lock(s.saga_id, a).await.unwrap();
        assert!(store.try_acquire_lock(s.saga_id, b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemorySagaEventStore::new();
        let s = saga();
        store.insert_saga(&s).await.unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store
            .try_acquire_lock(s.saga_id, a, Duration::from_millis(0))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store
            .try_acquire_lock(s.saga_id, b, Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn events_preserve_insertion_order() {
        let store = MemorySagaEventStore::new();
        let s = saga();
        store.insert_saga(&s).await.unwrap();

        for (i, status) in [StepStatus::Pending, StepStatus::Success].iter().enumerate() {
            let event = SagaEvent::new(&s, format!("step-{}", i), *status, 0);
            store.append_event(&event).await.unwrap();
        }
        let events = store.events(s.saga_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step_id, "step-0");
        assert_eq!(events[1].step_id, "step-1");
    }

    #[tokio::test]
    async fn open_sagas_filters_by_status_and_age() {
        let store = MemorySagaEventStore::new();
        let mut running = saga();
        running.status = SagaStatus::Running;
        let mut done = saga();
        done.status = SagaStatus::Completed;
        store.insert_saga(&running).await.unwrap();
        store.insert_saga(&done).await.unwrap();

        let open = store.open_sagas(Duration::from_millis(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let open_after = store.open_sagas(Duration::from_millis(1)).await.unwrap();
        assert!(open.contains(&running.saga_id) || open_after.contains(&running.saga_id));
        assert!(!open_after.contains(&done.saga_id));
    }
}
