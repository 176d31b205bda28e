//! Outbox dispatcher and retention settings

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use crate::domain::delivery::RetryPolicy;

/// Outbox configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Competing dispatcher workers in this process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rows claimed per dispatch cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a claim is held before another worker may take the row
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Failed dispatches before a row is parked as DEAD
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// PUBLISHED rows older than this are deleted
    #[serde(default = "default_retention")]
    pub retention_hours: u64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::MustBePositive("outbox.workers"));
        }
        if self.batch_size == 0 {
            return Err(ValidationError::MustBePositive("outbox.batch_size"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::MustBePositive("outbox.poll_interval_ms"));
        }
        if self.lease_secs == 0 {
            return Err(ValidationError::MustBePositive("outbox.lease_secs"));
        }
        if self.max_retries == 0 {
            return Err(ValidationError::MustBePositive("outbox.max_retries"));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(ValidationError::MustBePositive("outbox.maintenance_interval_secs"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ValidationError::InvalidBackoff("outbox"));
        }
        Ok(())
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval(),
            lease_secs: default_lease(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            retention_hours: default_retention(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> u64 {
    500
}

fn default_lease() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    1_000
}

fn default_max_backoff() -> u64 {
    300_000
}

fn default_retention() -> u64 {
    168
}

fn default_maintenance_interval() -> u64 {
    60
}
