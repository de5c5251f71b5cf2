//! Error taxonomy surfaced by the core.
//!
//! Adapters translate driver errors into this taxonomy at the boundary; the
//! manager passes them through unchanged; the orchestrator consumes them to
//! decide retry vs. compensate vs. abort. Errors the taxonomy does not know
//! are classified `Permanent`.

use serde::Serialize;
use uuid::Uuid;

use crate::backends::{BackendKind, BackendStatus};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("{operation} on {kind} denied by governance: {reason}")]
    PolicyDenied {
        kind: BackendKind,
        operation: String,
        reason: String,
    },

    #[error("no backend configured for kind {0}")]
    NoBackend(BackendKind),

    #[error("backend {kind} unavailable (status: {status})")]
    Unavailable {
        kind: BackendKind,
        status: BackendStatus,
    },

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("permanent backend failure: {0}")]
    Permanent(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("batch queue full")]
    QueueFull,

    #[error("saga {saga_id} lock lost: {reason}")]
    LockLost { saga_id: Uuid, reason: String },

    #[error("saga {saga_id}: {failed} compensation handler(s) failed")]
    CompensationFailed { saga_id: Uuid, failed: usize },

    #[error("corrupt event log for saga {saga_id}: {detail}")]
    CorruptEventLog { saga_id: Uuid, detail: String },
}

impl CoreError {
    /// Stable taxonomy name for logging and structured error reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CoreError::PolicyDenied { .. } => "PolicyDenied",
            CoreError::NoBackend(_) => "NoBackend",
            CoreError::Unavailable { .. } => "Unavailable",
            CoreError::Transient(_) => "Transient",
            CoreError::Permanent(_) => "Permanent",
            CoreError::Conflict(_) => "Conflict",
            CoreError::NotFound(_) => "NotFound",
            CoreError::QueueFull => "QueueFull",
            CoreError::LockLost { .. } => "LockLost",
            CoreError::CompensationFailed { .. } => "CompensationFailed",
            CoreError::CorruptEventLog { .. } => "CorruptEventLog",
        }
    }

    /// Whether a caller may retry the failed operation as-is.
    pub fn retriable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::QueueFull)
    }

    /// Structured error object for user-visible API surfaces.
    pub fn report(&self) -> ErrorReport {
        let (saga_id, step_id) = match self {
            CoreError::LockLost { saga_id, .. }
            | CoreError::CompensationFailed { saga_id, .. }
            | CoreError::CorruptEventLog { saga_id, .. } => (Some(*saga_id), None),
            _ => (None, None),
        };
        ErrorReport {
            kind: self.kind_name().to_string(),
            message: self.to_string(),
            saga_id,
            step_id,
            retriable: self.retriable(),
        }
    }
}

/// Structured error object carried on user-visible surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    pub saga_id: Option<Uuid>,
    pub step_id: Option<String>,
    pub retriable: bool,
}

impl ErrorReport {
    /// Attach saga/step context known only to the caller.
    pub fn with_context(mut self, saga_id: Uuid, step_id: impl Into<String>) -> Self {
        self.saga_id = Some(saga_id);
        self.step_id = Some(step_id.into());
        self
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => CoreError::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::Conflict(e.to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => CoreError::Transient(e.to_string()),
            _ => CoreError::Permanent(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retriable() {
        assert!(CoreError::Transient("timeout".into()).retriable());
        assert!(CoreError::QueueFull.retriable());
        assert!(!CoreError::Permanent("schema".into()).retriable());
        assert!(!CoreError::Conflict("dup".into()).retriable());
    }

    #[test]
    fn report_carries_saga_context() {
        let saga_id = Uuid::new_v4();
        let report = CoreError::LockLost {
            saga_id,
            reason: "lease expired".into(),
        }
        .report();
        assert_eq!(report.kind, "LockLost");
        assert_eq!(report.saga_id, Some(saga_id));
        assert!(!report.retriable);
    }

    #[test]
    fn report_context_attachment() {
        let saga_id = Uuid::new_v4();
        let report = CoreError::Transient("503".into())
            .report()
            .with_context(saga_id, "step-1");
        assert_eq!(report.step_id.as_deref(), Some("step-1"));
        assert!(report.retriable);
    }
}
