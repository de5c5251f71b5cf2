//! OTel-native metric instruments.
//!
//! Centralized instrument definitions using OpenTelemetry meters, lazily
//! initialized and feature-gated behind `otel`. The in-process atomic
//! counters on the batcher and orchestrator stay available either way;
//! these instruments exist for export pipelines.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::global;

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("uds3"));

// ============================================================================
// Saga
// ============================================================================

/// Duration of saga execution, from first step to terminal status.
pub static SAGA_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("uds3.saga.duration")
        .with_description("Saga execution duration")
        .with_unit("s")
        .build()
});

/// Total saga step retry attempts.
pub static SAGA_RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("uds3.saga.retry.total")
        .with_description("Total saga step retry attempts")
        .build()
});

/// Total saga compensations triggered.
pub static SAGA_COMPENSATION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("uds3.saga.compensation.total")
        .with_description("Total saga compensations triggered")
        .build()
});

// ============================================================================
// Batcher
// ============================================================================

/// Batch submission latency.
pub static BATCH_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("uds3.batcher.batch.latency")
        .with_description("Batch submission latency")
        .with_unit("ms")
        .build()
});

/// Total items spilled to the recovery log.
pub static BATCH_SPILL_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("uds3.batcher.spill.total")
        .with_description("Total items parked in the recovery log")
        .build()
});

// ============================================================================
// Governance
// ============================================================================

/// Total governance denials.
pub static GOVERNANCE_DENIED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("uds3.governance.denied.total")
        .with_description("Total operations denied by governance")
        .build()
});
