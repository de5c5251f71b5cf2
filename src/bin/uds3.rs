//! uds3: operational entry point.
//!
//! Subcommands:
//! - `migrate` - idempotent creation of the saga event-store schema
//! - `saga resume-open --older-than <duration>` - recovery worker that
//!   resumes sagas whose last update is older than the given duration
//! - `batch replay-recovery` - drains the batch recovery log against the
//!   configured vector backend
//!
//! Exit codes: 0 success, 2 configuration error, 3 no relational backend,
//! 4 partial recovery.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use uds3::config::Config;
use uds3::utils::bootstrap::init_tracing;

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_NO_RELATIONAL: u8 = 3;
const EXIT_PARTIAL_RECOVERY: u8 = 4;

#[derive(Parser)]
#[command(name = "uds3", about = "Polyglot-persistence orchestrator core", version)]
struct Cli {
    /// Path to a configuration file (YAML).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Idempotently create the saga event-store schema.
    Migrate,
    /// Saga maintenance.
    Saga {
        #[command(subcommand)]
        command: SagaCommand,
    },
    /// Batcher maintenance.
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },
}

#[derive(Subcommand)]
enum SagaCommand {
    /// Resume sagas left open longer than the given duration (e.g. "10m").
    ResumeOpen {
        #[arg(long, value_parser = parse_duration)]
        older_than: Duration,
    },
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Replay items parked in the batch recovery log against the backend.
    ReplayRecovery,
}

/// Parse durations like `500ms`, `30s`, `10m`, `2h`; bare numbers are seconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (value, unit): (&str, &str) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => (&raw[..split], &raw[split..]),
        None => (raw, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: '{}'", raw))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit: '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match cli.command {
        Command::Migrate => migrate(&config).await,
        Command::Saga {
            command: SagaCommand::ResumeOpen { older_than },
        } => resume_open(&config, older_than).await,
        Command::Batch {
            command: BatchCommand::ReplayRecovery,
        } => replay_recovery(&config).await,
    }
}

#[cfg(feature = "sqlite")]
async fn relational_store(
    config: &Config,
) -> Result<std::sync::Arc<uds3::backends::sql::SqlRelationalStore>, ExitCode> {
    use uds3::backends::sql::SqlRelationalStore;
    use uds3::backends::Connector;

    let entry = &config.backends.relational;
    if !entry.enabled || entry.type_tag != "sqlite" {
        error!(
            "a relational backend of type 'sqlite' is required (configured: '{}', enabled: {})",
            entry.type_tag, entry.enabled
        );
        return Err(ExitCode::from(EXIT_NO_RELATIONAL));
    }

    let store = std::sync::Arc::new(SqlRelationalStore::from_options(&entry.options));
    if let Err(e) = store.connect().await {
        error!("relational backend unreachable: {}", e);
        return Err(ExitCode::from(EXIT_NO_RELATIONAL));
    }
    Ok(store)
}

#[cfg(feature = "sqlite")]
async fn migrate(config: &Config) -> ExitCode {
    let relational = match relational_store(config).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    match uds3::saga::sql_event_store::migrate(&relational).await {
        Ok(()) => {
            info!("event-store schema is up to date");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("migration failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(feature = "sqlite"))]
async fn migrate(_config: &Config) -> ExitCode {
    error!("migrate requires the 'sqlite' feature");
    ExitCode::from(EXIT_NO_RELATIONAL)
}

#[cfg(feature = "sqlite")]
async fn resume_open(config: &Config, older_than: Duration) -> ExitCode {
    use std::sync::Arc;

    use uds3::governance::GovernanceGate;
    use uds3::manager::BackendManager;
    use uds3::saga::{
        CompensationRegistry, SagaEventStore, SagaOrchestrator, SqlSagaEventStore,
    };

    if config.saga.event_store_kind != "relational" {
        error!(
            "saga.event_store_kind is '{}'; the recovery worker needs a relational event store",
            config.saga.event_store_kind
        );
        return ExitCode::from(EXIT_NO_RELATIONAL);
    }

    let relational = match relational_store(config).await {
        Ok(store) => store,
        Err(code) => return code,
    };
    let event_store: Arc<dyn SagaEventStore> =
        Arc::new(SqlSagaEventStore::new(relational.clone()));

    let manager = match BackendManager::from_config(
        &config.backends,
        GovernanceGate::new(config.governance.clone()),
        config.manager.clone(),
    )
    .await
    {
        Ok(manager) => manager,
        Err(e) => {
            error!("backend construction failed: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let report = manager.start_all(None, manager.per_backend_timeout()).await;
    if !report.failed.is_empty() {
        warn!(failed = report.failed.len(), "some backends failed to start");
    }

    let orchestrator = SagaOrchestrator::new(
        manager.clone(),
        event_store.clone(),
        Arc::new(CompensationRegistry::with_defaults()),
        config.saga.clone(),
    );

    let open = match event_store.open_sagas(older_than).await {
        Ok(open) => open,
        Err(e) => {
            error!("listing open sagas failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(count = open.len(), "resuming open sagas");

    let mut failures = 0usize;
    for saga_id in &open {
        match orchestrator.resume(*saga_id).await {
            Ok(report) => {
                info!(saga_id = %saga_id, status = %report.status, "saga resumed");
            }
            Err(e) => {
                failures += 1;
                error!(saga_id = %saga_id, error = %e, "resume failed");
            }
        }
    }
    manager.stop_all().await;

    if failures > 0 {
        warn!(failures, total = open.len(), "recovery incomplete");
        ExitCode::from(EXIT_PARTIAL_RECOVERY)
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(not(feature = "sqlite"))]
async fn resume_open(_config: &Config, _older_than: Duration) -> ExitCode {
    error!("saga resume-open requires the 'sqlite' feature");
    ExitCode::from(EXIT_NO_RELATIONAL)
}

#[cfg(feature = "sqlite")]
async fn replay_recovery(config: &Config) -> ExitCode {
    use uds3::batcher::{
        BatcherStats, ManagerSink, RecoveryLog, RecoveryReplayer, SqlRecoveryLog,
    };
    use uds3::governance::GovernanceGate;
    use uds3::manager::BackendManager;

    let relational = match relational_store(config).await {
        Ok(store) => store,
        Err(code) => return code,
    };
    let pool = match relational.pool().await {
        Ok(pool) => pool,
        Err(e) => {
            error!("relational pool unavailable: {}", e);
            return ExitCode::from(EXIT_NO_RELATIONAL);
        }
    };
    let log = SqlRecoveryLog::new(pool);

    let manager = match BackendManager::from_config(
        &config.backends,
        GovernanceGate::new(config.governance.clone()),
        config.manager.clone(),
    )
    .await
    {
        Ok(manager) => manager,
        Err(e) => {
            error!("backend construction failed: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let report = manager.start_all(None, manager.per_backend_timeout()).await;
    if !report.failed.is_empty() {
        warn!(failed = report.failed.len(), "some backends failed to start");
    }

    let sink = ManagerSink::vector_ingest(manager.clone());
    let stats = BatcherStats::default();
    let mut replayed_total = 0u64;
    loop {
        match RecoveryReplayer::run_once(&log, &sink, &stats).await {
            Ok(0) => break,
            Ok(replayed) => replayed_total += replayed,
            Err(e) => {
                error!("recovery replay failed: {}", e);
                manager.stop_all().await;
                return ExitCode::FAILURE;
            }
        }
    }
    let remaining = log.len().await.unwrap_or(usize::MAX);
    manager.stop_all().await;

    if remaining > 0 {
        warn!(
            replayed = replayed_total,
            remaining, "recovery log not fully drained"
        );
        ExitCode::from(EXIT_PARTIAL_RECOVERY)
    } else {
        info!(replayed = replayed_total, "recovery log drained");
        ExitCode::SUCCESS
    }
}

#[cfg(not(feature = "sqlite"))]
async fn replay_recovery(_config: &Config) -> ExitCode {
    error!("batch replay-recovery requires the 'sqlite' feature");
    ExitCode::from(EXIT_NO_RELATIONAL)
}
