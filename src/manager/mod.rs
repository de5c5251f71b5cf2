//! Backend lifecycle, health-bounded dispatch, and the uniform operation
//! surface.
//!
//! The manager exclusively owns backend instances. Construction instantiates
//! adapters without connecting them (unless `autostart`); `start_all`
//! connects in parallel under a per-backend timeout; dispatch verifies
//! health, delegates to governance, and invokes the adapter. Per-backend
//! status mutations are serialized behind a per-handle lock; dispatch itself
//! holds no global lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::backends::{
    build_backend, Backend, BackendKind, BackendStatus, BackendsConfig, Payload,
};
use crate::error::{CoreError, Result};
use crate::governance::{GovernanceGate, OpContext};

pub mod health;

pub use health::HealthTicker;

/// Manager tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Per-backend connect timeout for `start_all`, in milliseconds.
    pub per_backend_timeout_ms: u64,
    /// Health probe cadence, in milliseconds.
    pub health_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            per_backend_timeout_ms: 10_000,
            health_interval_ms: 30_000,
        }
    }
}

/// Consecutive probe failures before a backend transitions to `Error`.
const PROBE_FAILURES_TO_ERROR: u32 = 3;

/// Outcome of `start_all`.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<BackendKind>,
    pub failed: Vec<(BackendKind, String)>,
}

/// Point-in-time view of one managed instance.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub kind: BackendKind,
    pub type_tag: String,
    pub status: BackendStatus,
    pub last_error: Option<String>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

struct InstanceState {
    status: BackendStatus,
    last_error: Option<String>,
    last_health_check_at: Option<DateTime<Utc>>,
    consecutive_probe_failures: u32,
}

struct BackendHandle {
    backend: Backend,
    state: RwLock<InstanceState>,
}

impl BackendHandle {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: RwLock::new(InstanceState {
                status: BackendStatus::Uninitialized,
                last_error: None,
                last_health_check_at: None,
                consecutive_probe_failures: 0,
            }),
        }
    }

    async fn set_status(&self, status: BackendStatus, error: Option<String>) {
        let mut state = self.state.write().await;
        state.status = status;
        if error.is_some() {
            state.last_error = error;
        }
    }
}

/// Owner of all backend instances; every operation dispatches through here.
pub struct BackendManager {
    backends: HashMap<BackendKind, BackendHandle>,
    governance: GovernanceGate,
    config: ManagerConfig,
}

impl BackendManager {
    /// Instantiate adapters from configuration. Backends with
    /// `autostart: true` are connected immediately (bounded by the
    /// per-backend timeout); everything else waits for `start_all`.
    pub async fn from_config(
        backends: &BackendsConfig,
        governance: GovernanceGate,
        config: ManagerConfig,
    ) -> Result<Arc<Self>> {
        let mut handles = HashMap::new();
        let mut autostart = Vec::new();
        for (kind, entry) in backends.entries() {
            if !entry.enabled {
                continue;
            }
            let backend = build_backend(kind, entry)?;
            handles.insert(kind, BackendHandle::new(backend));
            if entry.autostart {
                autostart.push(kind);
            }
        }

        let manager = Arc::new(Self {
            backends: handles,
            governance,
            config,
        });
        if !autostart.is_empty() {
            let timeout = manager.per_backend_timeout();
            manager.start_all(Some(&autostart), timeout).await;
        }
        Ok(manager)
    }

    /// Assemble a manager from pre-built backends. Used by tests and by
    /// embedders that construct adapters themselves.
    pub fn from_parts(backends: Vec<Backend>, governance: GovernanceGate) -> Arc<Self> {
        let handles = backends
            .into_iter()
            .map(|b| (b.kind(), BackendHandle::new(b)))
            .collect();
        Arc::new(Self {
            backends: handles,
            governance,
            config: ManagerConfig::default(),
        })
    }

    pub fn per_backend_timeout(&self) -> Duration {
        Duration::from_millis(self.config.per_backend_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.config.health_interval_ms)
    }

    pub fn governance(&self) -> &GovernanceGate {
        &self.governance
    }

    /// The configured adapter handle for a kind, if present.
    pub fn backend(&self, kind: BackendKind) -> Option<Backend> {
        self.backends.get(&kind).map(|h| h.backend.clone())
    }

    /// Connect the selected (default: all) backends in parallel.
    ///
    /// Each connection is bounded by `timeout`. Failures mark the instance
    /// `Error` (or `Offline` when the adapter reports its driver as
    /// unavailable) and are collected in the report; they never abort the
    /// overall call.
    pub async fn start_all(
        &self,
        names: Option<&[BackendKind]>,
        timeout: Duration,
    ) -> StartReport {
        let selected: Vec<BackendKind> = match names {
            Some(kinds) => kinds.to_vec(),
            None => self.backends.keys().copied().collect(),
        };

        let attempts = selected.into_iter().filter_map(|kind| {
            self.backends.get(&kind).map(|handle| async move {
                handle.set_status(BackendStatus::Initializing, None).await;
                let outcome = tokio::time::timeout(timeout, handle.backend.connect()).await;
                (kind, handle, outcome)
            })
        });

        let mut report = StartReport::default();
        for (kind, handle, outcome) in futures::future::join_all(attempts).await {
            match outcome {
                Ok(Ok(())) => {
                    handle.set_status(BackendStatus::Healthy, None).await;
                    info!(kind = %kind, "backend started");
                    report.started.push(kind);
                }
                Ok(Err(e @ CoreError::Unavailable { .. })) => {
                    handle
                        .set_status(BackendStatus::Offline, Some(e.to_string()))
                        .await;
                    warn!(kind = %kind, error = %e, "backend driver unavailable, continuing");
                    report.failed.push((kind, e.to_string()));
                }
                Ok(Err(e)) => {
                    handle
                        .set_status(BackendStatus::Error, Some(e.to_string()))
                        .await;
                    warn!(kind = %kind, error = %e, "backend failed to start");
                    report.failed.push((kind, e.to_string()));
                }
                Err(_) => {
                    let msg = format!("connect timed out after {:?}", timeout);
                    handle.set_status(BackendStatus::Error, Some(msg.clone())).await;
                    warn!(kind = %kind, "backend connect timed out");
                    report.failed.push((kind, msg));
                }
            }
        }
        report
    }

    /// Close every connected backend. Idempotent.
    pub async fn stop_all(&self) {
        for (kind, handle) in &self.backends {
            let status = handle.state.read().await.status;
            if matches!(status, BackendStatus::Uninitialized | BackendStatus::Offline) {
                continue;
            }
            if let Err(e) = handle.backend.close().await {
                warn!(kind = %kind, error = %e, "backend close failed");
            }
            handle.set_status(BackendStatus::Offline, None).await;
        }
    }

    /// Snapshot of every managed instance.
    pub async fn statuses(&self) -> Vec<InstanceSnapshot> {
        let mut snapshots = Vec::with_capacity(self.backends.len());
        for (kind, handle) in &self.backends {
            let state = handle.state.read().await;
            snapshots.push(InstanceSnapshot {
                kind: *kind,
                type_tag: handle.backend.type_tag(),
                status: state.status,
                last_error: state.last_error.clone(),
                last_health_check_at: state.last_health_check_at,
            });
        }
        snapshots.sort_by_key(|s| s.kind.to_string());
        snapshots
    }

    pub async fn status(&self, kind: BackendKind) -> Option<BackendStatus> {
        match self.backends.get(&kind) {
            Some(handle) => Some(handle.state.read().await.status),
            None => None,
        }
    }

    /// Governance pre-check without dispatching. The orchestrator calls this
    /// before writing a step's `Pending` event so denials never enter the
    /// write-ahead log as attempts.
    pub fn authorize(
        &self,
        kind: BackendKind,
        operation: &str,
        payload: &Payload,
        ctx: Option<&OpContext>,
    ) -> Result<()> {
        self.governance.authorize(kind, operation, payload, ctx)
    }

    /// Uniform operation dispatch.
    pub async fn execute(
        &self,
        kind: BackendKind,
        operation: &str,
        payload: &Payload,
    ) -> Result<Value> {
        self.execute_with_context(kind, operation, payload, None).await
    }

    /// Dispatch with caller-provided saga/step context for governance logs.
    pub async fn execute_with_context(
        &self,
        kind: BackendKind,
        operation: &str,
        payload: &Payload,
        ctx: Option<&OpContext>,
    ) -> Result<Value> {
        let handle = self
            .backends
            .get(&kind)
            .ok_or(CoreError::NoBackend(kind))?;

        let status = handle.state.read().await.status;
        if !matches!(status, BackendStatus::Healthy | BackendStatus::Degraded) {
            return Err(CoreError::Unavailable { kind, status });
        }

        self.governance.authorize(kind, operation, payload, ctx)?;

        handle.backend.execute(operation, payload).await
    }

    /// One probe pass over all connected backends.
    ///
    /// Probes are advisory: a failure marks the backend `Degraded` and three
    /// consecutive failures mark it `Error`; in-flight work is never torn
    /// down.
    pub async fn run_probe_cycle(&self) {
        for (kind, handle) in &self.backends {
            let status = handle.state.read().await.status;
            if !matches!(
                status,
                BackendStatus::Healthy | BackendStatus::Degraded | BackendStatus::Error
            ) {
                continue;
            }

            let probed = handle.backend.probe().await;
            let mut state = handle.state.write().await;
            state.last_health_check_at = Some(Utc::now());
            match probed {
                Ok(()) => {
                    state.consecutive_probe_failures = 0;
                    state.status = BackendStatus::Healthy;
                }
                Err(e) => {
                    state.consecutive_probe_failures += 1;
                    state.last_error = Some(e.to_string());
                    state.status = if state.consecutive_probe_failures >= PROBE_FAILURES_TO_ERROR {
                        BackendStatus::Error
                    } else {
                        BackendStatus::Degraded
                    };
                    warn!(
                        kind = %kind,
                        failures = state.consecutive_probe_failures,
                        status = %state.status,
                        error = %e,
                        "backend probe failed"
                    );
                }
            }
        }
    }
}
