//! Adaptive batch processor.
//!
//! Converts a high-rate stream of small insert operations (primarily vector
//! writes) into bounded batches with adaptive sizing and backpressure,
//! preserving at-least-once semantics: every accepted item is committed,
//! parked in the recovery log, or reported through the failure counter.
//!
//! One background worker per batcher instance consumes a bounded queue fed
//! by any number of producers. `submit` never blocks; over the high
//! watermark it rejects with `QueueFull` and retry responsibility shifts to
//! the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendKind, Payload};
use crate::error::{CoreError, Result};
use crate::manager::BackendManager;

pub mod recovery;

pub use recovery::{MemoryRecoveryLog, RecoveryLog, RecoveryReplayer};
#[cfg(feature = "sqlite")]
pub use recovery::sql::SqlRecoveryLog;

// ============================================================================
// Configuration
// ============================================================================

/// Batcher tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Lower bound for the adaptive batch size.
    pub b_min: usize,
    /// Upper bound for the adaptive batch size.
    pub b_max: usize,
    /// Oldest-item age that forces a flush, in milliseconds.
    pub max_linger_ms: u64,
    /// Queue capacity; `submit` rejects once this many items are queued.
    pub high_watermark: usize,
    /// Batch latency the controller steers toward, in milliseconds.
    pub latency_target_ms: f64,
    /// Multiplicative growth step (`B *= 1 + growth`).
    pub growth: f64,
    /// Multiplicative shrink step (`B *= 1 - shrink`).
    pub shrink: f64,
    /// Controller cadence, in milliseconds.
    pub control_tick_ms: u64,
    /// In-worker retries per batch before spilling to the recovery log.
    pub max_retries: u32,
    /// Minimum backoff between in-worker retries, in milliseconds.
    pub retry_min_delay_ms: u64,
    /// Recovery replay cadence, in milliseconds. 0 disables the replayer.
    pub recovery_interval_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            b_min: 16,
            b_max: 512,
            max_linger_ms: 50,
            high_watermark: 10_000,
            latency_target_ms: 200.0,
            growth: 0.08,
            shrink: 0.2,
            control_tick_ms: 500,
            max_retries: 3,
            retry_min_delay_ms: 25,
            recovery_interval_ms: 5_000,
        }
    }
}

// ============================================================================
// Items and sinks
// ============================================================================

/// One unit of batched work. The id must be stable across retries; replay
/// correctness depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub payload: Value,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Content digest keying the recovery log.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// The insert path a batcher instance feeds.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Submit one batch. Item order within the batch is preserved. Must be
    /// upsert-idempotent with respect to item ids.
    async fn submit_batch(&self, items: &[BatchItem]) -> Result<()>;
}

/// Sink that routes batches through the manager's uniform dispatch,
/// wrapping items into one bulk operation payload.
pub struct ManagerSink {
    manager: Arc<BackendManager>,
    kind: BackendKind,
    operation: String,
}

impl ManagerSink {
    pub fn new(manager: Arc<BackendManager>, kind: BackendKind, operation: &str) -> Self {
        Self {
            manager,
            kind,
            operation: operation.to_string(),
        }
    }

    /// The primary use: vector document ingest.
    pub fn vector_ingest(manager: Arc<BackendManager>) -> Self {
        Self::new(manager, BackendKind::Vector, "add_documents")
    }

    fn to_document(item: &BatchItem) -> Value {
        match &item.payload {
            Value::Object(fields) => {
                let mut doc = fields.clone();
                doc.insert("id".into(), Value::String(item.id.clone()));
                Value::Object(doc)
            }
            other => serde_json::json!({ "id": item.id, "value": other }),
        }
    }
}

#[async_trait]
impl BatchSink for ManagerSink {
    async fn submit_batch(&self, items: &[BatchItem]) -> Result<()> {
        let documents: Vec<Value> = items.iter().map(Self::to_document).collect();
        let mut payload = Payload::new();
        payload.insert("documents".into(), Value::Array(documents));
        self.manager
            .execute(self.kind, &self.operation, &payload)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Stats
// ============================================================================

/// In-process counters and gauges, observable without a metrics exporter.
#[derive(Default)]
pub struct BatcherStats {
    items_submitted: AtomicU64,
    items_committed: AtomicU64,
    items_failed: AtomicU64,
    items_recovered: AtomicU64,
    batches_submitted: AtomicU64,
    queue_size: AtomicU64,
    current_batch_size: AtomicU64,
    last_batch_latency_ms: AtomicU64,
}

/// Point-in-time stats view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub items_submitted: u64,
    pub items_committed: u64,
    pub items_failed: u64,
    pub items_recovered: u64,
    pub batches_submitted: u64,
    pub queue_size: u64,
    pub current_batch_size: u64,
    pub last_batch_latency_ms: u64,
}

impl BatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_committed: self.items_committed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_recovered: self.items_recovered.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            current_batch_size: self.current_batch_size.load(Ordering::Relaxed),
            last_batch_latency_ms: self.last_batch_latency_ms.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_recovered(&self, n: u64) {
        self.items_recovered.fetch_add(n, Ordering::Relaxed);
    }
}

/// Result of a `flush`/`shutdown` drain; counter totals at drain completion.
#[derive(Debug, Clone)]
pub struct DrainReport {
    pub committed: u64,
    pub recovered: u64,
    pub failed: u64,
}

impl DrainReport {
    fn from_stats(stats: &BatcherStats) -> Self {
        let snapshot = stats.snapshot();
        Self {
            committed: snapshot.items_committed,
            recovered: snapshot.items_recovered,
            failed: snapshot.items_failed,
        }
    }
}

// ============================================================================
// Batcher
// ============================================================================

enum Control {
    Flush(oneshot::Sender<DrainReport>),
    Shutdown(oneshot::Sender<DrainReport>),
}

/// Bounded-latency, backpressure-aware batch submitter for one backend.
pub struct AdaptiveBatcher {
    items_tx: mpsc::Sender<BatchItem>,
    control_tx: mpsc::UnboundedSender<Control>,
    stats: Arc<BatcherStats>,
    high_watermark: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
    replayer: Option<JoinHandle<()>>,
}

impl AdaptiveBatcher {
    /// Spawn the worker (and, when configured, the recovery replayer).
    pub fn spawn(
        sink: Arc<dyn BatchSink>,
        log: Arc<dyn RecoveryLog>,
        config: BatcherConfig,
    ) -> Self {
        let stats = Arc::new(BatcherStats::default());
        stats
            .current_batch_size
            .store(config.b_min as u64, Ordering::Relaxed);

        let (items_tx, items_rx) = mpsc::channel(config.high_watermark.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let replayer = (config.recovery_interval_ms > 0).then(|| {
            RecoveryReplayer::spawn(
                log.clone(),
                sink.clone(),
                stats.clone(),
                Duration::from_millis(config.recovery_interval_ms),
            )
        });

        let high_watermark = config.high_watermark;
        let worker = Worker {
            items_rx,
            control_rx,
            sink,
            log,
            stats: stats.clone(),
            target: config.b_min,
            ewma: Ewma::default(),
            pending: Vec::new(),
            oldest_at: None,
            config,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            items_tx,
            control_tx,
            stats,
            high_watermark,
            worker: Mutex::new(Some(handle)),
            replayer,
        }
    }

    /// Enqueue one item. Non-blocking; rejects with `QueueFull` above the
    /// high watermark.
    pub fn submit(&self, item: BatchItem) -> Result<()> {
        match self.items_tx.try_send(item) {
            Ok(()) => {
                self.stats.items_submitted.fetch_add(1, Ordering::Relaxed);
                let queued =
                    (self.high_watermark as u64).saturating_sub(self.items_tx.capacity() as u64);
                self.stats.queue_size.store(queued, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(CoreError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(CoreError::Permanent("batcher is shut down".into()))
            }
        }
    }

    /// Force a drain of everything accepted so far.
    pub async fn flush(&self, timeout: Duration) -> Result<DrainReport> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Flush(ack_tx))
            .map_err(|_| CoreError::Permanent("batcher is shut down".into()))?;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(CoreError::Permanent("batcher worker stopped".into())),
            Err(_) => Err(CoreError::Transient("flush timed out".into())),
        }
    }

    /// Graceful shutdown. On return every accepted item has been committed,
    /// parked in the recovery log, or counted as failed.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<DrainReport> {
        if let Some(replayer) = &self.replayer {
            replayer.abort();
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(Control::Shutdown(ack_tx)).is_err() {
            // Already shut down.
            return Ok(DrainReport::from_stats(&self.stats));
        }

        let report = match tokio::time::timeout(drain_timeout, ack_rx).await {
            Ok(Ok(report)) => report,
            Ok(Err(_)) => DrainReport::from_stats(&self.stats),
            Err(_) => return Err(CoreError::Transient("shutdown drain timed out".into())),
        };

        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        info!(
            committed = report.committed,
            recovered = report.recovered,
            failed = report.failed,
            "batcher shut down"
        );
        Ok(report)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for AdaptiveBatcher {
    fn drop(&mut self) {
        if let Some(replayer) = &self.replayer {
            replayer.abort();
        }
        // The worker drains naturally once the item channel closes.
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Exponentially smoothed batch metrics.
#[derive(Debug, Default, Clone, Copy)]
struct Ewma {
    throughput_ips: f64,
    avg_batch_latency_ms: f64,
    error_rate: f64,
    samples: u64,
}

const EWMA_ALPHA: f64 = 0.2;

impl Ewma {
    fn blend(current: f64, sample: f64, first: bool) -> f64 {
        if first {
            sample
        } else {
            current * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
        }
    }

    fn record(&mut self, batch_len: usize, latency_ms: f64, ok: bool) {
        let first = self.samples == 0;
        if ok && latency_ms > 0.0 {
            let ips = batch_len as f64 / (latency_ms / 1000.0);
            self.throughput_ips = Self::blend(self.throughput_ips, ips, first);
        }
        self.avg_batch_latency_ms = Self::blend(self.avg_batch_latency_ms, latency_ms, first);
        let err_sample = if ok { 0.0 } else { 1.0 };
        self.error_rate = Self::blend(self.error_rate, err_sample, first);
        self.samples += 1;
    }
}

/// Controller step: grow toward `b_max` while healthy, shrink toward
/// `b_min` under errors or latency pressure, otherwise hold.
fn next_target(config: &BatcherConfig, ewma: &Ewma, current: usize) -> usize {
    if ewma.samples == 0 {
        return current;
    }
    if ewma.error_rate < 0.01 && ewma.avg_batch_latency_ms < config.latency_target_ms {
        let grown = (current as f64 * (1.0 + config.growth)).ceil() as usize;
        return grown.min(config.b_max);
    }
    if ewma.error_rate > 0.05 || ewma.avg_batch_latency_ms > 2.0 * config.latency_target_ms {
        let shrunk = (current as f64 * (1.0 - config.shrink)).floor() as usize;
        return shrunk.max(config.b_min);
    }
    current
}

struct Worker {
    items_rx: mpsc::Receiver<BatchItem>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    sink: Arc<dyn BatchSink>,
    log: Arc<dyn RecoveryLog>,
    stats: Arc<BatcherStats>,
    target: usize,
    ewma: Ewma,
    pending: Vec<BatchItem>,
    oldest_at: Option<Instant>,
    config: BatcherConfig,
}

impl Worker {
    async fn run(mut self) {
        let mut control_tick =
            tokio::time::interval(Duration::from_millis(self.config.control_tick_ms.max(1)));
        control_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let linger = Duration::from_millis(self.config.max_linger_ms);

        loop {
            let linger_deadline = self.oldest_at.map(|t| t + linger);
            tokio::select! {
                biased;

                control = self.control_rx.recv() => match control {
                    Some(Control::Flush(ack)) => {
                        self.drain_channel();
                        self.submit_all().await;
                        let _ = ack.send(DrainReport::from_stats(&self.stats));
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.items_rx.close();
                        self.drain_channel();
                        self.submit_all().await;
                        let _ = ack.send(DrainReport::from_stats(&self.stats));
                        return;
                    }
                    None => {
                        self.drain_channel();
                        self.submit_all().await;
                        return;
                    }
                },

                item = self.items_rx.recv() => match item {
                    Some(item) => {
                        self.push(item);
                        if self.pending.len() >= self.target {
                            self.submit_pending().await;
                        }
                    }
                    None => {
                        // All producers gone; final drain.
                        self.submit_all().await;
                        return;
                    }
                },

                _ = tokio::time::sleep_until(
                    linger_deadline.unwrap_or_else(Instant::now)
                ), if linger_deadline.is_some() => {
                    self.submit_pending().await;
                }

                _ = control_tick.tick() => {
                    self.target = next_target(&self.config, &self.ewma, self.target);
                    self.stats
                        .current_batch_size
                        .store(self.target as u64, Ordering::Relaxed);
                }
            }
            self.stats
                .queue_size
                .store(self.pending.len() as u64, Ordering::Relaxed);
        }
    }

    fn push(&mut self, item: BatchItem) {
        if self.pending.is_empty() {
            self.oldest_at = Some(Instant::now());
        }
        self.pending.push(item);
    }

    fn drain_channel(&mut self) {
        while let Ok(item) = self.items_rx.try_recv() {
            self.push(item);
        }
    }

    async fn submit_all(&mut self) {
        while !self.pending.is_empty() {
            self.submit_pending().await;
        }
    }

    /// Submit one batch of up to `b_max` items from the head of the queue.
    /// Order within the batch follows submission order.
    async fn submit_pending(&mut self) {
        if self.pending.is_empty() {
            self.oldest_at = None;
            return;
        }
        let take = self.pending.len().min(self.config.b_max);
        let batch: Vec<BatchItem> = self.pending.drain(..take).collect();
        self.oldest_at = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };

        let started = Instant::now();
        let sink = self.sink.clone();
        let outcome = (|| async { sink.submit_batch(&batch).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(self.config.retry_min_delay_ms))
                    .with_max_times(self.config.max_retries as usize),
            )
            .when(|e: &CoreError| e.retriable())
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.stats
            .last_batch_latency_ms
            .store(latency_ms as u64, Ordering::Relaxed);
        self.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        record_batch_latency(latency_ms);

        match outcome {
            Ok(()) => {
                self.stats
                    .items_committed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.ewma.record(batch.len(), latency_ms, true);
                debug!(items = batch.len(), latency_ms, "batch committed");
            }
            Err(e) => {
                self.ewma.record(batch.len(), latency_ms, false);
                warn!(error = %e, items = batch.len(), "batch failed, parking in recovery log");
                for item in &batch {
                    match self.log.append(item).await {
                        Ok(()) => {
                            #[cfg(feature = "otel")]
                            crate::utils::metrics::BATCH_SPILL_TOTAL.add(1, &[]);
                        }
                        Err(log_err) => {
                            self.stats.items_failed.fetch_add(1, Ordering::Relaxed);
                            error!(
                                error = %log_err,
                                item = %item.id,
                                "recovery log append failed, item lost to failure counter"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(feature = "otel")]
fn record_batch_latency(latency_ms: f64) {
    crate::utils::metrics::BATCH_LATENCY.record(latency_ms, &[]);
}
