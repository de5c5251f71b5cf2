//! End-to-end saga scenarios over in-memory backends and the in-memory
//! event store: happy path, mid-saga failure with compensation, crash
//! recovery, concurrent executors, and partial compensation failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use uds3::backends::memory::{MemoryGraphStore, MemoryRelationalStore, MemoryVectorStore};
use uds3::backends::{Backend, BackendKind, Payload};
use uds3::error::{CoreError, Result};
use uds3::governance::{GovernanceConfig, GovernanceGate, GovernanceMode};
use uds3::manager::BackendManager;
use uds3::saga::compensation::{CompensationContext, CompensationHandler, VectorDeleteChunks};
use uds3::saga::{
    CompensationRegistry, MemorySagaEventStore, RetryPolicy, SagaConfig, SagaEvent,
    SagaEventStore, SagaOrchestrator, SagaStatus, StepSpec, StepStatus,
};

struct Env {
    vector: Arc<MemoryVectorStore>,
    graph: Arc<MemoryGraphStore>,
    relational: Arc<MemoryRelationalStore>,
    manager: Arc<BackendManager>,
    store: Arc<MemorySagaEventStore>,
}

impl Env {
    async fn new() -> Self {
        let vector = Arc::new(MemoryVectorStore::new());
        let graph = Arc::new(MemoryGraphStore::new());
        let relational = Arc::new(MemoryRelationalStore::new());
        let manager = BackendManager::from_parts(
            vec![
                Backend::Vector(vector.clone()),
                Backend::Graph(graph.clone()),
                Backend::Relational(relational.clone()),
            ],
            GovernanceGate::new(GovernanceConfig::permissive()),
        );
        manager.start_all(None, Duration::from_secs(1)).await;
        Self {
            vector,
            graph,
            relational,
            manager,
            store: Arc::new(MemorySagaEventStore::new()),
        }
    }

    fn orchestrator(&self) -> SagaOrchestrator {
        self.orchestrator_with_registry(CompensationRegistry::with_defaults())
    }

    fn orchestrator_with_registry(&self, registry: CompensationRegistry) -> SagaOrchestrator {
        SagaOrchestrator::new(
            self.manager.clone(),
            self.store.clone(),
            Arc::new(registry),
            SagaConfig::default(),
        )
    }
}

fn payload(pairs: &[(&str, Value)]) -> Payload {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// The three-backend document ingest used by most scenarios.
fn doc_steps() -> Vec<StepSpec> {
    vec![
        StepSpec::new(
            "relational-insert",
            BackendKind::Relational,
            "insert",
            payload(&[("table", json!("docs")), ("id", json!("d1"))]),
        )
        .with_compensation("relational_delete"),
        StepSpec::new(
            "vector-add",
            BackendKind::Vector,
            "add_documents",
            payload(&[("id", json!("d1")), ("text", json!("hello"))]),
        )
        .with_compensation("vector_delete_chunks"),
        StepSpec::new(
            "graph-node",
            BackendKind::Graph,
            "create_node",
            payload(&[("label", json!("Doc")), ("id", json!("d1"))]),
        )
        .with_compensation("graph_delete_node"),
    ]
}

fn forward_events(events: &[SagaEvent]) -> Vec<&SagaEvent> {
    events.iter().filter(|e| !e.is_compensation()).collect()
}

// ============================================================================
// Scenario 1: happy path across three backends
// ============================================================================

#[tokio::test]
async fn happy_path_three_backends() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();

    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Completed);
    let forward = forward_events(&report.events);
    assert_eq!(forward.len(), 6, "3 Pending + 3 Success");
    assert_eq!(
        forward.iter().filter(|e| e.status == StepStatus::Pending).count(),
        3
    );
    assert_eq!(
        forward.iter().filter(|e| e.status == StepStatus::Success).count(),
        3
    );

    // All three backends contain the record.
    assert_eq!(env.relational.rows("docs").await.len(), 1);
    assert_eq!(env.vector.ids().await, vec!["d1".to_string()]);
    assert!(env.graph.has_node("d1").await);

    // A terminal metric sample was recorded.
    assert_eq!(env.store.metric_samples().await.len(), 1);
}

/// Every Success has a preceding Pending for the same attempt, and
/// step i's terminal precedes any event of step i+1.
#[tokio::test]
async fn write_ahead_and_step_ordering_invariants() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();
    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    let events = forward_events(&report.events);
    for (i, event) in events.iter().enumerate() {
        if event.status == StepStatus::Success {
            let preceding_pending = events[..i].iter().any(|p| {
                p.step_id == event.step_id
                    && p.attempt == event.attempt
                    && p.status == StepStatus::Pending
                    && p.started_at <= event.started_at
            });
            assert!(preceding_pending, "Success without prior Pending");
        }
    }

    let order = ["relational-insert", "vector-add", "graph-node"];
    for pair in order.windows(2) {
        let terminal_i = events
            .iter()
            .position(|e| e.step_id == pair[0] && e.status.is_terminal())
            .unwrap();
        let first_j = events.iter().position(|e| e.step_id == pair[1]).unwrap();
        assert!(terminal_i < first_j, "step ordering violated");
    }
}

// ============================================================================
// Scenario 2: failure in the middle, full compensation
// ============================================================================

#[tokio::test]
async fn middle_failure_compensates_in_reverse_order() {
    let env = Env::new().await;
    env.graph
        .inject_fault(CoreError::Permanent("schema violation".into()));
    let orchestrator = env.orchestrator();

    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Compensated);

    let fail_at = report
        .events
        .iter()
        .position(|e| e.step_id == "graph-node" && e.status == StepStatus::Fail)
        .expect("terminal Fail on the graph step");
    let compensated: Vec<(usize, &str)> = report
        .events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.status == StepStatus::Compensated)
        .map(|(i, e)| (i, e.step_id.as_str()))
        .collect();
    assert_eq!(
        compensated.iter().map(|(_, id)| *id).collect::<Vec<_>>(),
        vec!["vector-add", "relational-insert"],
        "compensation runs in reverse order"
    );
    assert!(fail_at < compensated[0].0);

    // Every successful step has a Compensated event.
    for step in ["relational-insert", "vector-add"] {
        assert!(report
            .events
            .iter()
            .any(|e| e.step_id == step && e.status == StepStatus::Compensated));
    }

    // All three backends contain no record.
    assert!(env.relational.rows("docs").await.is_empty());
    assert!(env.vector.is_empty().await);
    assert!(!env.graph.has_node("d1").await);
}

// ============================================================================
// Scenario 3: crash after Pending, before the terminal event
// ============================================================================

#[tokio::test]
async fn resume_reexecutes_in_flight_step_with_idempotency_cover() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();
    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();

    // Simulate the crashed run: step 1 completed (backend effect applied,
    // Pending + Success logged); step 2's Pending was written and then the
    // process died before the backend call resolved.
    let saga = env.store.load_saga(saga_id).await.unwrap();
    env.manager
        .execute(
            BackendKind::Relational,
            "insert",
            &payload(&[("table", json!("docs")), ("id", json!("d1"))]),
        )
        .await
        .unwrap();
    env.store
        .append_event(&SagaEvent::new(&saga, "relational-insert", StepStatus::Pending, 0))
        .await
        .unwrap();
    env.store
        .append_event(&SagaEvent::new(&saga, "relational-insert", StepStatus::Success, 0))
        .await
        .unwrap();
    env.store
        .append_event(&SagaEvent::new(&saga, "vector-add", StepStatus::Pending, 0))
        .await
        .unwrap();
    env.store
        .update_status(saga_id, SagaStatus::Running)
        .await
        .unwrap();

    let report = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(report.status, SagaStatus::Completed);

    // The in-flight step re-executed as a fresh attempt.
    let vector_events: Vec<&SagaEvent> = report
        .events
        .iter()
        .filter(|e| e.step_id == "vector-add")
        .collect();
    assert!(vector_events
        .iter()
        .any(|e| e.attempt == 1 && e.status == StepStatus::Success));

    // Final state identical to the happy path.
    assert_eq!(env.relational.rows("docs").await.len(), 1);
    assert_eq!(env.vector.ids().await, vec!["d1".to_string()]);
    assert!(env.graph.has_node("d1").await);
}

#[tokio::test]
async fn resume_skips_in_flight_step_without_idempotency_cover() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();

    // create_node has neither a key nor upsert semantics.
    let steps = vec![StepSpec::new(
        "graph-node",
        BackendKind::Graph,
        "create_node",
        payload(&[("label", json!("Doc")), ("id", json!("d1"))]),
    )];
    let saga_id = orchestrator.create("risky", steps, None).await.unwrap();
    let saga = env.store.load_saga(saga_id).await.unwrap();
    env.store
        .append_event(&SagaEvent::new(&saga, "graph-node", StepStatus::Pending, 0))
        .await
        .unwrap();
    env.store
        .update_status(saga_id, SagaStatus::Running)
        .await
        .unwrap();

    let report = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(report.status, SagaStatus::Completed);
    assert!(report
        .events
        .iter()
        .any(|e| e.step_id == "graph-node" && e.status == StepStatus::Skipped));
    // The step was NOT re-executed.
    assert!(!env.graph.has_node("d1").await);
}

// ============================================================================
// Scenario 4: concurrent executors
// ============================================================================

#[tokio::test]
async fn lock_holder_excludes_second_executor() {
    let env = Env::new().await;
    let first = env.orchestrator();
    let second = env.orchestrator();

    let saga_id = first.create("ingest", doc_steps(), None).await.unwrap();

    // First orchestrator claims the lease; the second must observe LockLost.
    assert!(env
        .store
        .try_acquire_lock(saga_id, first.owner_token(), Duration::from_secs(30))
        .await
        .unwrap());
    let err = second.execute(saga_id).await.unwrap_err();
    assert!(matches!(err, CoreError::LockLost { .. }));

    // The holder itself proceeds normally.
    let report = first.execute(saga_id).await.unwrap();
    assert_eq!(report.status, SagaStatus::Completed);
}

#[tokio::test]
async fn concurrent_executors_write_no_duplicate_terminals() {
    let env = Env::new().await;
    let first = env.orchestrator();
    let second = env.orchestrator();
    let saga_id = first.create("ingest", doc_steps(), None).await.unwrap();

    let (a, b) = tokio::join!(first.execute(saga_id), second.execute(saga_id));

    // Whoever lost either got LockLost or observed the recorded outcome.
    let ok_count = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert!(ok_count >= 1);
    for outcome in [&a, &b] {
        if let Err(e) = outcome {
            assert!(matches!(e, CoreError::LockLost { .. }), "unexpected: {}", e);
        }
    }

    // At most one terminal event per (step_id, attempt).
    let events = env.store.events(saga_id).await.unwrap();
    let mut terminals = std::collections::HashMap::new();
    for event in events.iter().filter(|e| !e.is_compensation()) {
        if event.status.is_terminal() {
            let count = terminals
                .entry((event.step_id.clone(), event.attempt))
                .or_insert(0u32);
            *count += 1;
            assert_eq!(*count, 1, "duplicate terminal for {:?}", event.step_id);
        }
    }
    assert_eq!(
        env.store.load_saga(saga_id).await.unwrap().status,
        SagaStatus::Completed
    );
}

// ============================================================================
// Scenario 6: compensation partially fails, then succeeds on retry
// ============================================================================

/// Fails its first invocation, then behaves like the stock vector handler.
struct FlakyVectorCompensation {
    calls: AtomicU32,
}

#[async_trait]
impl CompensationHandler for FlakyVectorCompensation {
    async fn compensate(
        &self,
        manager: &BackendManager,
        payload: &Payload,
        ctx: &CompensationContext,
    ) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CoreError::Transient("compensation hiccup".into()));
        }
        VectorDeleteChunks.compensate(manager, payload, ctx).await
    }
}

#[tokio::test]
async fn partial_compensation_failure_then_retry() {
    let env = Env::new().await;
    env.graph
        .inject_fault(CoreError::Permanent("schema violation".into()));

    let mut registry = CompensationRegistry::with_defaults();
    registry.register(
        "vector_delete_chunks",
        Arc::new(FlakyVectorCompensation {
            calls: AtomicU32::new(0),
        }),
    );
    let orchestrator = env.orchestrator_with_registry(registry);

    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::CompensationFailed);
    let audits = env.store.audit_records().await;
    assert!(audits.iter().any(|a| a.category == "compensation_failed"));

    // The relational step compensated despite the vector handler failing.
    assert!(env.relational.rows("docs").await.is_empty());
    assert!(!env.vector.is_empty().await);

    // Handler is idempotent now; a second pass retries only the failed step.
    let report = orchestrator.compensate(saga_id, None).await.unwrap();
    assert_eq!(report.status, SagaStatus::Compensated);
    assert!(env.vector.is_empty().await);

    // Every successful step ends up compensated after the retry.
    for step in ["relational-insert", "vector-add"] {
        assert!(report
            .events
            .iter()
            .any(|e| e.step_id == step && e.status == StepStatus::Compensated));
    }
}

// ============================================================================
// Round-trip / idempotence laws
// ============================================================================

#[tokio::test]
async fn create_then_resume_is_still_created() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();
    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();

    let report = orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(report.status, SagaStatus::Created);
    assert!(report.events.is_empty());
}

#[tokio::test]
async fn execute_twice_is_a_no_op() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();
    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();

    let first = orchestrator.execute(saga_id).await.unwrap();
    let second = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.events.len(), second.events.len());
    // Backends saw the effect exactly once.
    assert_eq!(env.relational.rows("docs").await.len(), 1);
}

#[tokio::test]
async fn compensate_twice_is_a_no_op() {
    let env = Env::new().await;
    env.graph
        .inject_fault(CoreError::Permanent("schema violation".into()));
    let orchestrator = env.orchestrator();
    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();
    orchestrator.execute(saga_id).await.unwrap();

    let first = orchestrator.compensate(saga_id, None).await.unwrap();
    let second = orchestrator.compensate(saga_id, None).await.unwrap();
    assert_eq!(first.status, SagaStatus::Compensated);
    assert_eq!(second.status, SagaStatus::Compensated);
    assert_eq!(first.events.len(), second.events.len());
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn zero_retries_fails_on_first_transient_error() {
    let env = Env::new().await;
    env.graph
        .inject_fault(CoreError::Transient("connection reset".into()));
    let orchestrator = env.orchestrator();

    let steps = vec![StepSpec::new(
        "graph-node",
        BackendKind::Graph,
        "create_node",
        payload(&[("label", json!("Doc")), ("id", json!("d1"))]),
    )
    .with_retry_policy(RetryPolicy::none())];
    let saga_id = orchestrator.create("no-retries", steps, None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Compensated);
    let fails: Vec<&SagaEvent> = report
        .events
        .iter()
        .filter(|e| e.status == StepStatus::Fail)
        .collect();
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].attempt, 0);
    assert!(fails[0].error.as_deref().unwrap().contains("retries exhausted"));
}

#[tokio::test]
async fn transient_errors_retry_to_success() {
    let env = Env::new().await;
    env.graph
        .inject_faults(CoreError::Transient("connection reset".into()), 2);
    let orchestrator = env.orchestrator();

    let steps = vec![StepSpec::new(
        "graph-node",
        BackendKind::Graph,
        "create_node",
        payload(&[("label", json!("Doc")), ("id", json!("d1"))]),
    )
    .with_retry_policy(RetryPolicy {
        max_retries: 3,
        backoff_initial_ms: 1,
        backoff_multiplier: 1.0,
        max_backoff_ms: 5,
    })];
    let saga_id = orchestrator.create("retrying", steps, None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Completed);
    let pendings = report
        .events
        .iter()
        .filter(|e| e.status == StepStatus::Pending)
        .count();
    assert_eq!(pendings, 3, "one Pending per attempt");
    assert!(report
        .events
        .iter()
        .any(|e| e.attempt == 2 && e.status == StepStatus::Success));
    assert!(env.graph.has_node("d1").await);
}

#[tokio::test]
async fn empty_saga_completes_without_events() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();
    let saga_id = orchestrator.create("empty", vec![], None).await.unwrap();

    let report = orchestrator.execute(saga_id).await.unwrap();
    assert_eq!(report.status, SagaStatus::Completed);
    assert!(report.events.is_empty());
}

#[tokio::test]
async fn idempotency_key_collision_skips_second_step() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();

    let steps = vec![
        StepSpec::new(
            "insert-a",
            BackendKind::Relational,
            "insert",
            payload(&[("table", json!("docs")), ("id", json!("a"))]),
        )
        .with_idempotency_key("doc-batch-7"),
        StepSpec::new(
            "insert-b",
            BackendKind::Relational,
            "insert",
            payload(&[("table", json!("docs")), ("id", json!("b"))]),
        )
        .with_idempotency_key("doc-batch-7"),
    ];
    let saga_id = orchestrator.create("collide", steps, None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Completed);
    assert!(report
        .events
        .iter()
        .any(|e| e.step_id == "insert-b" && e.status == StepStatus::Skipped));
    assert_eq!(env.relational.rows("docs").await.len(), 1);
}

#[tokio::test]
async fn conflict_resolves_as_success_by_idempotency() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();

    // The row already exists; both insert attempts conflict.
    env.manager
        .execute(
            BackendKind::Relational,
            "insert",
            &payload(&[("table", json!("docs")), ("id", json!("d1"))]),
        )
        .await
        .unwrap();

    let steps = vec![StepSpec::new(
        "relational-insert",
        BackendKind::Relational,
        "insert",
        payload(&[("table", json!("docs")), ("id", json!("d1"))]),
    )];
    let saga_id = orchestrator.create("dup", steps, None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Completed);
    assert!(report
        .events
        .iter()
        .any(|e| e.status == StepStatus::Success && e.attempt == 1));
    assert_eq!(env.relational.rows("docs").await.len(), 1);
}

// ============================================================================
// Governance inside the saga
// ============================================================================

#[tokio::test]
async fn policy_denial_fails_step_without_pending_event() {
    let vector = Arc::new(MemoryVectorStore::new());
    let manager = BackendManager::from_parts(
        vec![Backend::Vector(vector)],
        GovernanceGate::new(GovernanceConfig {
            mode: GovernanceMode::Strict,
            policies: Default::default(),
        }),
    );
    manager.start_all(None, Duration::from_secs(1)).await;
    let store = Arc::new(MemorySagaEventStore::new());
    let orchestrator = SagaOrchestrator::new(
        manager,
        store.clone(),
        Arc::new(CompensationRegistry::with_defaults()),
        SagaConfig::default(),
    );

    let steps = vec![StepSpec::new(
        "vector-add",
        BackendKind::Vector,
        "add_documents",
        payload(&[("id", json!("d1")), ("text", json!("hello"))]),
    )];
    let saga_id = orchestrator.create("denied", steps, None).await.unwrap();
    let report = orchestrator.execute(saga_id).await.unwrap();

    assert_eq!(report.status, SagaStatus::Compensated);
    let step_events: Vec<&SagaEvent> = report
        .events
        .iter()
        .filter(|e| e.step_id == "vector-add")
        .collect();
    assert_eq!(step_events.len(), 1, "denial writes only the Fail event");
    assert_eq!(step_events[0].status, StepStatus::Fail);
    assert!(store
        .audit_records()
        .await
        .iter()
        .any(|a| a.category == "policy_denied"));
}

// ============================================================================
// Abort
// ============================================================================

#[tokio::test]
async fn abort_compensates_successful_prefix() {
    let env = Env::new().await;
    let orchestrator = env.orchestrator();

    // Run only the first step via a one-step saga sharing the doc id, then
    // abort a partially-created ingest by hand: create, execute step 1
    // manually through the store, abort.
    let saga_id = orchestrator.create("ingest", doc_steps(), None).await.unwrap();
    let saga = env.store.load_saga(saga_id).await.unwrap();
    env.manager
        .execute(
            BackendKind::Relational,
            "insert",
            &payload(&[("table", json!("docs")), ("id", json!("d1"))]),
        )
        .await
        .unwrap();
    env.store
        .append_event(&SagaEvent::new(&saga, "relational-insert", StepStatus::Pending, 0))
        .await
        .unwrap();
    env.store
        .append_event(&SagaEvent::new(&saga, "relational-insert", StepStatus::Success, 0))
        .await
        .unwrap();
    env.store
        .update_status(saga_id, SagaStatus::Running)
        .await
        .unwrap();

    let report = orchestrator.abort(saga_id, "operator request").await.unwrap();
    assert_eq!(report.status, SagaStatus::Aborted);
    assert!(env.relational.rows("docs").await.is_empty());
    assert!(env
        .store
        .audit_records()
        .await
        .iter()
        .any(|a| a.category == "saga_aborted"));

    // Terminal: execute after abort changes nothing.
    let after = orchestrator.execute(saga_id).await.unwrap();
    assert_eq!(after.status, SagaStatus::Aborted);
}
