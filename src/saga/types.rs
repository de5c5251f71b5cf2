//! Saga data model: step specs, saga headers, write-ahead events, and the
//! observability side records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backends::{BackendKind, Payload};
use crate::utils::retry::RetryConfig;

/// Lifecycle status of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Created,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
    Aborted,
}

impl SagaStatus {
    /// Terminal statuses admit no further execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::CompensationFailed
                | SagaStatus::Aborted
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaStatus::Created => "Created",
            SagaStatus::Running => "Running",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::CompensationFailed => "CompensationFailed",
            SagaStatus::Aborted => "Aborted",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Created" => Ok(SagaStatus::Created),
            "Running" => Ok(SagaStatus::Running),
            "Completed" => Ok(SagaStatus::Completed),
            "Failed" => Ok(SagaStatus::Failed),
            "Compensating" => Ok(SagaStatus::Compensating),
            "Compensated" => Ok(SagaStatus::Compensated),
            "CompensationFailed" => Ok(SagaStatus::CompensationFailed),
            "Aborted" => Ok(SagaStatus::Aborted),
            other => Err(format!("unknown saga status: {}", other)),
        }
    }
}

/// Status carried by one write-ahead event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Success,
    Fail,
    Compensated,
    Skipped,
}

impl StepStatus {
    /// Terminal event statuses (everything but `Pending`).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "Pending",
            StepStatus::Success => "Success",
            StepStatus::Fail => "Fail",
            StepStatus::Compensated => "Compensated",
            StepStatus::Skipped => "Skipped",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(StepStatus::Pending),
            "Success" => Ok(StepStatus::Success),
            "Fail" => Ok(StepStatus::Fail),
            "Compensated" => Ok(StepStatus::Compensated),
            "Skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status: {}", other)),
        }
    }
}

/// Per-step retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_initial_ms: 50,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries: a single transient error is terminal.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            base_delay: std::time::Duration::from_millis(self.backoff_initial_ms),
            max_delay: std::time::Duration::from_millis(self.max_backoff_ms),
            max_retries: self.max_retries,
            multiplier: self.backoff_multiplier,
            jitter: 0.25,
        }
    }
}

/// One unit of a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the saga and stable across replays.
    pub step_id: String,
    pub backend_kind: BackendKind,
    pub operation: String,
    #[serde(default)]
    pub payload: Payload,
    /// Names a handler in the compensation registry.
    #[serde(default)]
    pub compensation_name: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Per-step timeout; expiry classifies as `Transient` until retries run out.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StepSpec {
    pub fn new(
        step_id: impl Into<String>,
        backend_kind: BackendKind,
        operation: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            backend_kind,
            operation: operation.into(),
            payload,
            compensation_name: None,
            idempotency_key: None,
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn with_compensation(mut self, name: impl Into<String>) -> Self {
        self.compensation_name = Some(name.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Delete-class operations treat `NotFound` as already-done.
    pub fn is_delete_class(&self) -> bool {
        matches!(self.operation.as_str(), "delete" | "delete_node")
    }

    /// Whether re-execution after an unknown outcome is safe: either the
    /// caller supplied an idempotency key, or the operation itself has
    /// upsert semantics.
    pub fn has_idempotency_cover(&self) -> bool {
        self.idempotency_key.is_some()
            || matches!(self.operation.as_str(), "add_documents" | "put" | "upsert")
            || self.is_delete_class()
    }
}

/// Saga header plus its ordered step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    pub saga_id: Uuid,
    pub name: String,
    pub trace_id: String,
    pub status: SagaStatus,
    pub steps: Vec<StepSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl Saga {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>, trace_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            name: name.into(),
            trace_id: trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            status: SagaStatus::Created,
            steps,
            created_at: now,
            updated_at: now,
            owner_token: None,
            lock_expires_at: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Marker distinguishing compensation events from forward execution events
/// with the same step id.
pub const COMPENSATION_PHASE: &str = "compensation";

/// One write-ahead log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEvent {
    pub event_id: Uuid,
    pub saga_id: Uuid,
    pub trace_id: String,
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub payload_snapshot: Option<Value>,
}

impl SagaEvent {
    pub fn new(saga: &Saga, step_id: impl Into<String>, status: StepStatus, attempt: u32) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            saga_id: saga.saga_id,
            trace_id: saga.trace_id.clone(),
            step_id: step_id.into(),
            status,
            attempt,
            started_at: Utc::now(),
            duration_ms: None,
            error: None,
            payload_snapshot: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: Value) -> Self {
        self.payload_snapshot = Some(snapshot);
        self
    }

    /// Mark (or test for) membership in a compensation pass.
    pub fn into_compensation(mut self) -> Self {
        let mut snapshot = match self.payload_snapshot.take() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        snapshot.insert("phase".into(), Value::String(COMPENSATION_PHASE.into()));
        self.payload_snapshot = Some(Value::Object(snapshot));
        self
    }

    pub fn is_compensation(&self) -> bool {
        if matches!(self.status, StepStatus::Compensated) {
            return true;
        }
        self.payload_snapshot
            .as_ref()
            .and_then(|s| s.get("phase"))
            .and_then(Value::as_str)
            == Some(COMPENSATION_PHASE)
    }
}

/// Append-only audit record for alert-worthy outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub saga_id: Option<Uuid>,
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            saga_id: None,
            category: category.into(),
            message: message.into(),
            details: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn for_saga(mut self, saga_id: Uuid) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only metric sample for terminal saga transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub saga_id: Uuid,
    pub name: String,
    pub duration_ms: u64,
    pub steps_total: usize,
    pub steps_failed: usize,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_status_round_trips() {
        for status in [
            SagaStatus::Created,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::CompensationFailed,
            SagaStatus::Aborted,
        ] {
            assert_eq!(status.to_string().parse::<SagaStatus>().unwrap(), status);
        }
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
    }

    #[test]
    fn pending_is_the_only_non_terminal_event_status() {
        assert!(!StepStatus::Pending.is_terminal());
        for status in [
            StepStatus::Success,
            StepStatus::Fail,
            StepStatus::Compensated,
            StepStatus::Skipped,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn idempotency_cover_detection() {
        let upsert = StepSpec::new("s1", BackendKind::Vector, "add_documents", Payload::new());
        assert!(upsert.has_idempotency_cover());

        let keyed = StepSpec::new("s2", BackendKind::Graph, "create_node", Payload::new())
            .with_idempotency_key("k");
        assert!(keyed.has_idempotency_cover());

        let bare = StepSpec::new("s3", BackendKind::Graph, "create_node", Payload::new());
        assert!(!bare.has_idempotency_cover());
    }

    #[test]
    fn compensation_marker_round_trips() {
        let saga = Saga::new("test", vec![], None);
        let event = SagaEvent::new(&saga, "s1", StepStatus::Pending, 0).into_compensation();
        assert!(event.is_compensation());

        let forward = SagaEvent::new(&saga, "s1", StepStatus::Pending, 0);
        assert!(!forward.is_compensation());
    }
}
