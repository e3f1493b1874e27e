//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.
//!
//! ```yaml
//! outbox:
//!   sweep_interval_ms: 1000
//!   max_attempts: 10
//! messaging:
//!   type: kafka
//!   address: "localhost:9092"
//!   app_id: billing
//!   partitions: 4
//! namespace:
//!   preregister: [tenant-a, tenant-b]
//! ```

use serde::Deserialize;

use crate::bus::{BusError, MessagingConfig};
use crate::namespace::NamespaceConfig;
use crate::outbox::OutboxConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTRELAY";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid messaging configuration: {0}")]
    Messaging(#[from] BusError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub outbox: OutboxConfig,
    pub messaging: MessagingConfig,
    pub namespace: NamespaceConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `EVENTRELAY_CONFIG` environment variable (if set)
    /// 4. Environment variables such as `EVENTRELAY__MESSAGING__TYPE=nats`
    ///
    /// The messaging section is validated before returning.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
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
        config.messaging.bus_config().validate()?;
        Ok(config)
    }
}
