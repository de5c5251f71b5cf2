//! Application configuration.
//!
//! Aggregates the per-subsystem configuration structs into a single
//! `Config` loaded from YAML files and environment variables.
//!
//! Sources, later overriding earlier:
//! 1. `config.yaml` / `uds3.yaml` in the current directory (if present)
//! 2. A file passed explicitly (CLI `--config`)
//! 3. The file named by `UDS3_CONFIG`
//! 4. Environment variables with the `UDS3` prefix and `__` separator,
//!    e.g. `UDS3__SAGA__LEASE_TTL_MS=10000`, `UDS3__GOVERNANCE__MODE=lenient`,
//!    `UDS3__BACKENDS__RELATIONAL__PATH=/var/lib/uds3/uds3.db`
//!
//! Adapter-specific fields inside backend entries are preserved but not
//! interpreted by the core.

use serde::Deserialize;

use crate::backends::BackendsConfig;
use crate::batcher::BatcherConfig;
use crate::governance::GovernanceConfig;
use crate::manager::ManagerConfig;
use crate::saga::SagaConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "uds3.yaml";
/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "UDS3_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "UDS3";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "UDS3_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// One entry per backend kind.
    pub backends: BackendsConfig,
    /// Manager lifecycle and health probing.
    pub manager: ManagerConfig,
    /// Saga engine configuration.
    pub saga: SagaConfig,
    /// Adaptive batcher configuration.
    pub batcher: BatcherConfig,
    /// Governance policy configuration.
    pub governance: GovernanceConfig,
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
