//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid database URL format")]
    InvalidDatabaseUrl,

    #[error("Invalid Redis URL format")]
    InvalidRedisUrl,

    #[error("Pool min_connections exceeds max_connections")]
    InvalidPoolSize,

    #[error("Pool size exceeds maximum allowed (100)")]
    PoolSizeTooLarge,

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("{0}: maximum backoff is below the initial backoff")]
    InvalidBackoff(&'static str),

    #[error("{0} must be between 0.0 and 1.0")]
    InvalidRatio(&'static str),

    #[error("Backoff multiplier must be at least 1.0")]
    InvalidMultiplier,

    #[error("Invalid topic prefix '{0}'")]
    InvalidTopicPrefix(String),

    #[error("outbox.lease_secs ({lease_secs}s) must exceed the worst-case publish time ({budget_ms}ms)")]
    LeaseTooShort { lease_secs: u64, budget_ms: u64 },

    #[error("Invalid log filter '{0}'")]
    InvalidLogLevel(String),
}
