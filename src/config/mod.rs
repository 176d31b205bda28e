//! Application configuration module
//!
//! Typed configuration loaded from environment variables using the
//! `config` and `dotenvy` crates. Variables use the `EVENTLINE` prefix and
//! nested values are separated by double underscores.
//!
//! # Example
//!
//! ```no_run
//! use eventline::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//!
//! println!("Using the {:?} adapter", config.adapter.kind);
//! ```

mod adapter;
mod bus;
mod database;
mod error;
mod logging;
mod outbox;
mod redis;
mod schema;

pub use adapter::{AdapterConfig, AdapterKind, CommitStrategy};
pub use bus::BusConfig;
pub use database::DatabaseConfig;
pub use error::{ConfigError, ValidationError};
pub use logging::LoggingConfig;
pub use outbox::OutboxConfig;
pub use redis::RedisConfig;
pub use schema::SchemaConfig;

use serde::Deserialize;

/// Root application configuration
///
/// Every section has defaults, so an empty environment yields a runnable
/// in-memory setup apart from the database URL the binary needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Broker backend selection and tuning
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Redis connection (stream-log adapter only)
    #[serde(default)]
    pub redis: RedisConfig,

    /// PostgreSQL connection for the outbox
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Publish retries, dead-lettering, reconnects
    #[serde(default)]
    pub bus: BusConfig,

    /// Dispatcher workers, leases, retention
    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `EVENTLINE` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    /// 4. Deserializes into typed configuration structs
    ///
    /// # Environment Variable Format
    ///
    /// - `EVENTLINE__ADAPTER__KIND=partitioned_log` -> `adapter.kind = partitioned_log`
    /// - `EVENTLINE__OUTBOX__LEASE_SECS=60` -> `outbox.lease_secs = 60`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if values cannot be parsed into expected types.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("EVENTLINE")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// Redis is only checked when the stream-log adapter is selected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.adapter.validate()?;
        if self.adapter.kind == AdapterKind::StreamLog {
            self.redis.validate()?;
        }
        self.database.validate()?;
        self.bus.validate()?;
        self.outbox.validate()?;
        self.logging.validate()?;

        // A claimed row must be publishable before its lease runs out.
        let budget = self.bus.publish_budget(self.adapter.operation_timeout());
        if self.outbox.lease() <= budget {
            return Err(ValidationError::LeaseTooShort {
                lease_secs: self.outbox.lease_secs,
                budget_ms: budget.as_millis() as u64,
            });
        }
        Ok(())
    }
}
