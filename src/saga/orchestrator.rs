//! The saga execution engine.
//!
//! Runs an ordered list of steps across heterogeneous backends with
//! write-ahead durability, idempotency, lease-based concurrency control,
//! best-effort reverse compensation, and crash recovery.
//!
//! Step protocol, per attempt: verify the lease, probe idempotency, check
//! governance, append a durable `Pending` event, dispatch through the
//! manager, then append the terminal event. Transient errors sleep per the
//! step's retry policy and re-enter the protocol with `attempt + 1`; the
//! retried attempt's `Pending` is left without a terminal, which is exactly
//! what recovery later reads as an in-flight attempt.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::governance::OpContext;
use crate::manager::BackendManager;

use super::compensation::{CompensationContext, CompensationRegistry};
use super::event_store::SagaEventStore;
use super::types::{
    AuditRecord, MetricSample, Saga, SagaEvent, SagaStatus, StepSpec, StepStatus,
};
use super::SagaConfig;

/// Outcome of `execute`/`resume`/`compensate`/`abort`.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub saga_id: Uuid,
    pub status: SagaStatus,
    pub events: Vec<SagaEvent>,
}

/// Step-level outcome inside the execution loop.
enum StepRun {
    Completed,
    Skipped,
    Failed(CoreError),
}

/// Recovered per-step state, derived from the forward event trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    NotStarted,
    InFlight { attempt: u32 },
    Success,
    Fail,
    Skipped,
}

/// Lease renewal running alongside step execution. Losing the lease flips
/// the flag; the execution loop checks it before every write.
struct LeaseGuard {
    lost: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LeaseGuard {
    fn spawn(
        store: Arc<dyn SagaEventStore>,
        saga_id: Uuid,
        owner: Uuid,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.renew_lock(saga_id, owner, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(saga_id = %saga_id, "lease renewal rejected, lock lost");
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    // Store hiccups are not a lost lease; the next tick retries.
                    Err(e) => warn!(saga_id = %saga_id, error = %e, "lease renewal errored"),
                }
            }
        });
        Self { lost, handle }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Durable, resumable, compensating saga executor.
pub struct SagaOrchestrator {
    manager: Arc<BackendManager>,
    store: Arc<dyn SagaEventStore>,
    registry: Arc<CompensationRegistry>,
    config: SagaConfig,
    owner: Uuid,
}

impl SagaOrchestrator {
    pub fn new(
        manager: Arc<BackendManager>,
        store: Arc<dyn SagaEventStore>,
        registry: Arc<CompensationRegistry>,
        config: SagaConfig,
    ) -> Self {
        Self {
            manager,
            store,
            registry,
            config,
            owner: Uuid::new_v4(),
        }
    }

    /// This orchestrator's lock identity.
    pub fn owner_token(&self) -> Uuid {
        self.owner
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.config.lease_ttl_ms)
    }

    // ========================================================================
    // Public contract
    // ========================================================================

    /// Persist a new saga. Steps are validated against the capability
    /// matrix; status starts at `Created` and no write-ahead events exist
    /// until execution.
    pub async fn create(
        &self,
        name: &str,
        steps: Vec<StepSpec>,
        trace_id: Option<String>,
    ) -> Result<Uuid> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(CoreError::Permanent(format!(
                    "duplicate step_id '{}'",
                    step.step_id
                )));
            }
            if !step.backend_kind.operations().contains(&step.operation.as_str()) {
                return Err(CoreError::Permanent(format!(
                    "operation '{}' is not in the {} capability set",
                    step.operation, step.backend_kind
                )));
            }
        }

        let saga = Saga::new(name, steps, trace_id);
        let saga_id = saga.saga_id;
        self.store.insert_saga(&saga).await?;
        info!(saga_id = %saga_id, name = %name, steps = saga.steps.len(), "saga created");
        Ok(saga_id)
    }

    /// Run the saga to completion, failure, or compensation. Idempotent: a
    /// second call on a terminal saga returns the recorded outcome without
    /// touching any backend.
    pub async fn execute(&self, saga_id: Uuid) -> Result<ExecutionReport> {
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status.is_terminal() {
            return self.report(saga_id).await;
        }

        let lease = self.acquire(saga_id).await?;
        // Re-load under the lock: a concurrent executor may have finished
        // between the optimistic check and acquisition.
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status.is_terminal() {
            drop(lease);
            self.store.release_lock(saga_id, self.owner).await.ok();
            return self.report(saga_id).await;
        }
        let outcome = self.drive(saga, &lease).await;
        drop(lease);
        self.store.release_lock(saga_id, self.owner).await.ok();
        outcome
    }

    /// Reconstruct state from the event log and continue or compensate.
    /// Safe to call repeatedly; a freshly created saga with no activity is
    /// left untouched.
    pub async fn resume(&self, saga_id: Uuid) -> Result<ExecutionReport> {
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status.is_terminal() {
            return self.report(saga_id).await;
        }
        if saga.status == SagaStatus::Created {
            let events = self.store.events(saga_id).await?;
            if events.is_empty() {
                return Ok(ExecutionReport {
                    saga_id,
                    status: SagaStatus::Created,
                    events,
                });
            }
        }

        let lease = self.acquire(saga_id).await?;
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status.is_terminal() {
            drop(lease);
            self.store.release_lock(saga_id, self.owner).await.ok();
            return self.report(saga_id).await;
        }
        let outcome = self.drive(saga, &lease).await;
        drop(lease);
        self.store.release_lock(saga_id, self.owner).await.ok();
        outcome
    }

    /// Invoke compensation handlers in reverse order for the given (or
    /// inferred) successful steps. Re-running after success is a no-op;
    /// re-running after `CompensationFailed` retries only the failed
    /// handlers.
    pub async fn compensate(
        &self,
        saga_id: Uuid,
        executed_steps: Option<&[String]>,
    ) -> Result<ExecutionReport> {
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status == SagaStatus::Compensated {
            return self.report(saga_id).await;
        }

        let lease = self.acquire(saga_id).await?;
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status == SagaStatus::Compensated {
            drop(lease);
            self.store.release_lock(saga_id, self.owner).await.ok();
            return self.report(saga_id).await;
        }
        let outcome = self.finish_compensation(&saga, executed_steps).await;
        drop(lease);
        self.store.release_lock(saga_id, self.owner).await.ok();
        outcome
    }

    /// Mark the saga `Aborted`; per policy, compensate the successful prefix
    /// first. The audit trail records the reason.
    pub async fn abort(&self, saga_id: Uuid, reason: &str) -> Result<ExecutionReport> {
        let saga = self.store.load_saga(saga_id).await?;
        if saga.status.is_terminal() {
            return self.report(saga_id).await;
        }

        let lease = self.acquire(saga_id).await?;
        self.audit(
            AuditRecord::new("saga_aborted", reason).for_saga(saga_id),
        )
        .await;

        if self.config.abort_compensates {
            self.store
                .update_status(saga_id, SagaStatus::Compensating)
                .await?;
            let failed = self.compensation_pass(&saga, None).await?;
            if failed > 0 {
                self.audit(
                    AuditRecord::new(
                        "compensation_failed",
                        format!("{} compensation handler(s) failed during abort", failed),
                    )
                    .for_saga(saga_id),
                )
                .await;
            }
        }

        self.store.update_status(saga_id, SagaStatus::Aborted).await?;
        drop(lease);
        self.store.release_lock(saga_id, self.owner).await.ok();
        warn!(saga_id = %saga_id, reason = %reason, "saga aborted");
        self.report(saga_id).await
    }

    /// Current status plus the full event trail.
    pub async fn report(&self, saga_id: Uuid) -> Result<ExecutionReport> {
        let saga = self.store.load_saga(saga_id).await?;
        let events = self.store.events(saga_id).await?;
        Ok(ExecutionReport {
            saga_id,
            status: saga.status,
            events,
        })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn acquire(&self, saga_id: Uuid) -> Result<LeaseGuard> {
        let acquired = self
            .store
            .try_acquire_lock(saga_id, self.owner, self.lease_ttl())
            .await?;
        if !acquired {
            return Err(CoreError::LockLost {
                saga_id,
                reason: "held by another orchestrator".into(),
            });
        }
        Ok(LeaseGuard::spawn(
            self.store.clone(),
            saga_id,
            self.owner,
            self.lease_ttl(),
            Duration::from_millis(self.config.lease_renew_interval_ms),
        ))
    }

    async fn drive(&self, saga: Saga, lease: &LeaseGuard) -> Result<ExecutionReport> {
        let saga_id = saga.saga_id;
        let events = self.store.events(saga_id).await?;
        let states = classify_steps(&saga, &events)?;

        // A failed step on record, or an interrupted compensation pass,
        // sends us straight back into compensation.
        let needs_compensation = states.values().any(|s| matches!(s, StepState::Fail))
            || matches!(saga.status, SagaStatus::Failed | SagaStatus::Compensating);
        if needs_compensation {
            return self.finish_compensation(&saga, None).await;
        }

        if saga.status != SagaStatus::Running {
            self.store.update_status(saga_id, SagaStatus::Running).await?;
        }

        for step in &saga.steps {
            let state = states
                .get(step.step_id.as_str())
                .copied()
                .unwrap_or(StepState::NotStarted);

            let start_attempt = match state {
                StepState::Success | StepState::Skipped => continue,
                StepState::Fail => unreachable!("failed steps drain into compensation"),
                StepState::InFlight { attempt } => {
                    if !step.has_idempotency_cover() {
                        // Unknown outcome and no safe way to re-execute:
                        // at-most-once, move on.
                        let event = SagaEvent::new(&saga, &step.step_id, StepStatus::Skipped, attempt)
                            .with_error(
                                "outcome unknown after interruption; \
                                 no idempotency cover, treated as at-most-once",
                            );
                        self.store.append_event(&event).await?;
                        warn!(
                            saga_id = %saga_id,
                            step_id = %step.step_id,
                            "in-flight step without idempotency cover skipped during recovery"
                        );
                        continue;
                    }
                    attempt + 1
                }
                StepState::NotStarted => 0,
            };

            match self.run_step(&saga, step, start_attempt, lease).await? {
                StepRun::Completed | StepRun::Skipped => {}
                StepRun::Failed(cause) => {
                    warn!(
                        saga_id = %saga_id,
                        step_id = %step.step_id,
                        error = %cause,
                        "step failed, compensating"
                    );
                    self.store.update_status(saga_id, SagaStatus::Failed).await?;
                    return self.finish_compensation(&saga, None).await;
                }
            }
        }

        self.store.update_status(saga_id, SagaStatus::Completed).await?;
        self.record_metric(&saga, 0).await;
        info!(saga_id = %saga_id, "saga completed");
        self.report(saga_id).await
    }

    /// One step, from `start_attempt` onward.
    async fn run_step(
        &self,
        saga: &Saga,
        step: &StepSpec,
        start_attempt: u32,
        lease: &LeaseGuard,
    ) -> Result<StepRun> {
        let saga_id = saga.saga_id;

        // Idempotency probe: a prior Success under the same key means the
        // work is already done.
        if let Some(key) = &step.idempotency_key {
            if self.idempotency_satisfied(saga, key).await? {
                let event = SagaEvent::new(saga, &step.step_id, StepStatus::Skipped, start_attempt)
                    .with_snapshot(json!({ "idempotency_key": key }));
                self.store.append_event(&event).await?;
                info!(saga_id = %saga_id, step_id = %step.step_id, "step skipped by idempotency key");
                return Ok(StepRun::Skipped);
            }
        }

        // Governance gates before anything enters the write-ahead log.
        let ctx = OpContext::for_step(saga_id, step.step_id.clone());
        if let Err(denial) =
            self.manager
                .authorize(step.backend_kind, &step.operation, &step.payload, Some(&ctx))
        {
            let event = SagaEvent::new(saga, &step.step_id, StepStatus::Fail, start_attempt)
                .with_error(denial.to_string());
            self.store.append_event(&event).await?;
            self.audit(
                AuditRecord::new("policy_denied", denial.to_string()).for_saga(saga_id),
            )
            .await;
            return Ok(StepRun::Failed(denial));
        }

        let retry = step.retry_policy.to_retry_config();
        let mut attempt = start_attempt;
        let mut transient_retries = 0u32;
        let mut conflict_retried = false;

        loop {
            if lease.is_lost() {
                return Err(CoreError::LockLost {
                    saga_id,
                    reason: "lease expired during execution".into(),
                });
            }

            // Write-ahead: the Pending event is durable before dispatch.
            let pending = SagaEvent::new(saga, &step.step_id, StepStatus::Pending, attempt)
                .with_snapshot(Value::Object(step.payload.clone()));
            self.store.append_event(&pending).await?;

            let started = Instant::now();
            let dispatched = self
                .manager
                .execute_with_context(step.backend_kind, &step.operation, &step.payload, Some(&ctx));
            let outcome = match step.timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), dispatched).await
                {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::Transient(format!("step timed out after {}ms", ms))),
                },
                None => dispatched.await,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(_) => {
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Success, attempt)
                        .with_duration_ms(duration_ms);
                    self.store.append_event(&event).await?;
                    return Ok(StepRun::Completed);
                }
                Err(cause) if cause.retriable() => {
                    if retry.should_retry(transient_retries) {
                        warn!(
                            saga_id = %saga_id,
                            step_id = %step.step_id,
                            attempt,
                            error = %cause,
                            "transient step failure, retrying"
                        );
                        #[cfg(feature = "otel")]
                        crate::utils::metrics::SAGA_RETRY_TOTAL.add(1, &[]);
                        tokio::time::sleep(retry.delay_for_attempt(transient_retries)).await;
                        transient_retries += 1;
                        attempt += 1;
                        continue;
                    }
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Fail, attempt)
                        .with_duration_ms(duration_ms)
                        .with_error(format!("retries exhausted: {}", cause));
                    self.store.append_event(&event).await?;
                    return Ok(StepRun::Failed(cause));
                }
                Err(CoreError::Conflict(reason)) => {
                    if !conflict_retried {
                        // One more pass through the protocol; the probe on
                        // re-entry decides, and a repeat conflict resolves
                        // as success-by-idempotency.
                        conflict_retried = true;
                        warn!(
                            saga_id = %saga_id,
                            step_id = %step.step_id,
                            reason = %reason,
                            "conflict, retrying once with idempotency probe"
                        );
                        attempt += 1;
                        continue;
                    }
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Success, attempt)
                        .with_duration_ms(duration_ms)
                        .with_snapshot(json!({ "resolved_by_idempotency": true }));
                    self.store.append_event(&event).await?;
                    return Ok(StepRun::Completed);
                }
                Err(CoreError::NotFound(reason)) if step.is_delete_class() => {
                    // The target is already gone; deleting it again is done.
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Success, attempt)
                        .with_duration_ms(duration_ms)
                        .with_snapshot(json!({ "not_found": reason }));
                    self.store.append_event(&event).await?;
                    return Ok(StepRun::Completed);
                }
                Err(cause) => {
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Fail, attempt)
                        .with_duration_ms(duration_ms)
                        .with_error(cause.to_string());
                    self.store.append_event(&event).await?;
                    return Ok(StepRun::Failed(cause));
                }
            }
        }
    }

    async fn idempotency_satisfied(&self, saga: &Saga, key: &str) -> Result<bool> {
        let events = self.store.events(saga.saga_id).await?;
        Ok(saga.steps.iter().any(|other| {
            other.idempotency_key.as_deref() == Some(key)
                && events.iter().any(|e| {
                    e.step_id == other.step_id
                        && !e.is_compensation()
                        && e.status == StepStatus::Success
                })
        }))
    }

    // ========================================================================
    // Compensation
    // ========================================================================

    /// Drive compensation for the successful prefix, then settle the saga's
    /// terminal status.
    async fn finish_compensation(
        &self,
        saga: &Saga,
        restrict: Option<&[String]>,
    ) -> Result<ExecutionReport> {
        let saga_id = saga.saga_id;
        self.store
            .update_status(saga_id, SagaStatus::Compensating)
            .await?;
        #[cfg(feature = "otel")]
        crate::utils::metrics::SAGA_COMPENSATION_TOTAL.add(1, &[]);

        let failed = self.compensation_pass(saga, restrict).await?;

        let terminal = if failed > 0 {
            SagaStatus::CompensationFailed
        } else {
            SagaStatus::Compensated
        };
        self.store.update_status(saga_id, terminal).await?;
        if failed > 0 {
            self.audit(
                AuditRecord::new(
                    "compensation_failed",
                    format!("{} compensation handler(s) failed", failed),
                )
                .for_saga(saga_id)
                .with_details(json!({ "failed_handlers": failed })),
            )
            .await;
            error!(saga_id = %saga_id, failed, "compensation pass left failures");
        } else {
            info!(saga_id = %saga_id, "saga compensated");
        }
        self.record_metric(saga, failed).await;
        self.report(saga_id).await
    }

    /// Reverse-order, best-effort compensation. Handler failures are
    /// recorded and the pass continues; the count of failures is returned.
    async fn compensation_pass(
        &self,
        saga: &Saga,
        restrict: Option<&[String]>,
    ) -> Result<usize> {
        let saga_id = saga.saga_id;
        let events = self.store.events(saga_id).await?;

        let already_compensated: HashSet<&str> = events
            .iter()
            .filter(|e| e.status == StepStatus::Compensated)
            .map(|e| e.step_id.as_str())
            .collect();

        let successful: Vec<&StepSpec> = saga
            .steps
            .iter()
            .filter(|step| {
                events.iter().any(|e| {
                    e.step_id == step.step_id
                        && !e.is_compensation()
                        && e.status == StepStatus::Success
                })
            })
            .filter(|step| match restrict {
                Some(ids) => ids.iter().any(|id| id == &step.step_id),
                None => true,
            })
            .collect();

        let mut failed = 0usize;
        for step in successful.iter().rev() {
            if already_compensated.contains(step.step_id.as_str()) {
                continue;
            }

            let handler = step
                .compensation_name
                .as_deref()
                .and_then(|name| self.registry.get(name));

            let Some(handler) = handler else {
                if let Some(name) = &step.compensation_name {
                    warn!(
                        saga_id = %saga_id,
                        step_id = %step.step_id,
                        handler = %name,
                        "compensation handler not registered, recording noop"
                    );
                }
                let event = SagaEvent::new(saga, &step.step_id, StepStatus::Compensated, 0)
                    .with_snapshot(json!({ "noop": true }));
                self.store.append_event(&event).await?;
                continue;
            };

            let attempt = events
                .iter()
                .filter(|e| {
                    e.step_id == step.step_id
                        && e.is_compensation()
                        && e.status == StepStatus::Pending
                })
                .count() as u32;

            let pending = SagaEvent::new(saga, &step.step_id, StepStatus::Pending, attempt)
                .into_compensation();
            self.store.append_event(&pending).await?;

            let ctx = CompensationContext {
                saga_id,
                step_id: step.step_id.clone(),
                trace_id: saga.trace_id.clone(),
            };
            let started = Instant::now();
            match handler.compensate(&self.manager, &step.payload, &ctx).await {
                Ok(()) => {
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Compensated, attempt)
                        .with_duration_ms(started.elapsed().as_millis() as u64);
                    self.store.append_event(&event).await?;
                }
                Err(cause) => {
                    failed += 1;
                    let event = SagaEvent::new(saga, &step.step_id, StepStatus::Fail, attempt)
                        .with_duration_ms(started.elapsed().as_millis() as u64)
                        .with_error(format!("compensation: {}", cause))
                        .into_compensation();
                    self.store.append_event(&event).await?;
                    error!(
                        saga_id = %saga_id,
                        step_id = %step.step_id,
                        error = %cause,
                        "compensation handler failed, continuing pass"
                    );
                }
            }
        }
        Ok(failed)
    }

    // ========================================================================
    // Side records
    // ========================================================================

    async fn audit(&self, record: AuditRecord) {
        if let Err(e) = self.store.append_audit(&record).await {
            warn!(error = %e, category = %record.category, "audit append failed");
        }
    }

    async fn record_metric(&self, saga: &Saga, steps_failed: usize) {
        let sample = MetricSample {
            saga_id: saga.saga_id,
            name: saga.name.clone(),
            duration_ms: (Utc::now() - saga.created_at).num_milliseconds().max(0) as u64,
            steps_total: saga.steps.len(),
            steps_failed,
            recorded_at: Utc::now(),
        };
        #[cfg(feature = "otel")]
        crate::utils::metrics::SAGA_DURATION.record(sample.duration_ms as f64 / 1000.0, &[]);
        if let Err(e) = self.store.append_metric(&sample).await {
            warn!(error = %e, "metric append failed");
        }
    }
}

// ============================================================================
// Recovery classification
// ============================================================================

/// Derive per-step state from the forward event trail, validating the
/// write-ahead invariants on the way.
fn classify_steps<'a>(saga: &'a Saga, events: &[SagaEvent]) -> Result<HashMap<&'a str, StepState>> {
    let known: HashSet<&str> = saga.steps.iter().map(|s| s.step_id.as_str()).collect();
    for event in events {
        if !known.contains(event.step_id.as_str()) {
            return Err(CoreError::CorruptEventLog {
                saga_id: saga.saga_id,
                detail: format!("event for unknown step '{}'", event.step_id),
            });
        }
    }

    let mut states = HashMap::new();
    for step in &saga.steps {
        let mut attempts: BTreeMap<u32, (bool, Vec<StepStatus>)> = BTreeMap::new();
        for event in events
            .iter()
            .filter(|e| e.step_id == step.step_id && !e.is_compensation())
        {
            let entry = attempts.entry(event.attempt).or_default();
            if event.status == StepStatus::Pending {
                entry.0 = true;
            } else {
                entry.1.push(event.status);
            }
        }

        let mut state = StepState::NotStarted;
        for (attempt, (has_pending, terminals)) in &attempts {
            if terminals.len() > 1 {
                return Err(CoreError::CorruptEventLog {
                    saga_id: saga.saga_id,
                    detail: format!(
                        "step '{}' attempt {} has {} terminal events",
                        step.step_id,
                        attempt,
                        terminals.len()
                    ),
                });
            }
            match terminals.first() {
                Some(StepStatus::Success) if !has_pending => {
                    return Err(CoreError::CorruptEventLog {
                        saga_id: saga.saga_id,
                        detail: format!(
                            "step '{}' attempt {} has Success without a preceding Pending",
                            step.step_id, attempt
                        ),
                    });
                }
                Some(StepStatus::Success) => state = StepState::Success,
                Some(StepStatus::Skipped) => state = StepState::Skipped,
                Some(StepStatus::Fail) => state = StepState::Fail,
                Some(StepStatus::Pending) | Some(StepStatus::Compensated) | None => {}
            }
        }

        // The newest attempt decides only when nothing terminal settled the
        // step: a bare trailing Pending is an in-flight attempt.
        if state == StepState::NotStarted {
            if let Some((attempt, (has_pending, terminals))) = attempts.iter().next_back() {
                if terminals.is_empty() && *has_pending {
                    state = StepState::InFlight { attempt: *attempt };
                }
            }
        }
        states.insert(step.step_id.as_str(), state);
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendKind, Payload};

    fn saga_with(steps: Vec<StepSpec>) -> Saga {
        Saga::new("test", steps, None)
    }

    fn step(id: &str) -> StepSpec {
        StepSpec::new(id, BackendKind::Graph, "create_node", Payload::new())
    }

    #[test]
    fn classify_empty_log_is_not_started() {
        let saga = saga_with(vec![step("a"), step("b")]);
        let states = classify_steps(&saga, &[]).unwrap();
        assert_eq!(states["a"], StepState::NotStarted);
        assert_eq!(states["b"], StepState::NotStarted);
    }

    #[test]
    fn classify_success_and_in_flight() {
        let saga = saga_with(vec![step("a"), step("b")]);
        let events = vec![
            SagaEvent::new(&saga, "a", StepStatus::Pending, 0),
            SagaEvent::new(&saga, "a", StepStatus::Success, 0),
            SagaEvent::new(&saga, "b", StepStatus::Pending, 0),
        ];
        let states = classify_steps(&saga, &events).unwrap();
        assert_eq!(states["a"], StepState::Success);
        assert_eq!(states["b"], StepState::InFlight { attempt: 0 });
    }

    #[test]
    fn classify_retried_attempt_is_in_flight_at_latest() {
        let saga = saga_with(vec![step("a")]);
        let events = vec![
            SagaEvent::new(&saga, "a", StepStatus::Pending, 0),
            SagaEvent::new(&saga, "a", StepStatus::Pending, 1),
        ];
        let states = classify_steps(&saga, &events).unwrap();
        assert_eq!(states["a"], StepState::InFlight { attempt: 1 });
    }

    #[test]
    fn classify_rejects_success_without_pending() {
        let saga = saga_with(vec![step("a")]);
        let events = vec![SagaEvent::new(&saga, "a", StepStatus::Success, 0)];
        let err = classify_steps(&saga, &events).unwrap_err();
        assert_eq!(err.kind_name(), "CorruptEventLog");
    }

    #[test]
    fn classify_rejects_duplicate_terminals() {
        let saga = saga_with(vec![step("a")]);
        let events = vec![
            SagaEvent::new(&saga, "a", StepStatus::Pending, 0),
            SagaEvent::new(&saga, "a", StepStatus::Success, 0),
            SagaEvent::new(&saga, "a", StepStatus::Fail, 0),
        ];
        let err = classify_steps(&saga, &events).unwrap_err();
        assert_eq!(err.kind_name(), "CorruptEventLog");
    }

    #[test]
    fn classify_rejects_unknown_step_ids() {
        let saga = saga_with(vec![step("a")]);
        let events = vec![SagaEvent::new(&saga, "ghost", StepStatus::Pending, 0)];
        let err = classify_steps(&saga, &events).unwrap_err();
        assert_eq!(err.kind_name(), "CorruptEventLog");
    }

    #[test]
    fn classify_ignores_compensation_events() {
        let saga = saga_with(vec![step("a")]);
        let events = vec![
            SagaEvent::new(&saga, "a", StepStatus::Pending, 0),
            SagaEvent::new(&saga, "a", StepStatus::Success, 0),
            SagaEvent::new(&saga, "a", StepStatus::Pending, 0).into_compensation(),
            SagaEvent::new(&saga, "a", StepStatus::Compensated, 0),
        ];
        let states = classify_steps(&saga, &events).unwrap();
        assert_eq!(states["a"], StepState::Success);
    }
}
