//! Event bus retry, dead-letter, and shutdown settings

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use crate::domain::delivery::RetryPolicy;

/// Event bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Attempts per publish, including the first
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of each backoff randomized in either direction
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Handler failures before a record is dead-lettered
    #[serde(default = "default_handler_failure_threshold")]
    pub handler_failure_threshold: u32,

    #[serde(default = "default_handler_retry_delay")]
    pub handler_retry_delay_ms: u64,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Namespace prepended to every topic as `<prefix>.<event_type>`
    #[serde(default)]
    pub topic_prefix: Option<String>,
}

impl BusConfig {
    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_publish_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
        .with_multiplier(self.backoff_multiplier)
    }

    /// Handler retries use a flat delay.
    pub fn handler_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.handler_retry_delay_ms);
        RetryPolicy::new(self.handler_failure_threshold, delay, delay).with_multiplier(1.0)
    }

    /// Reconnects never give up, so only the delay curve matters.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            u32::MAX,
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
        .with_multiplier(self.backoff_multiplier)
    }

    /// Worst-case wall time of one publish with every retry spent.
    ///
    /// Each attempt may reconnect and then call the adapter, and both calls
    /// are bounded by `operation_timeout`.
    pub fn publish_budget(&self, operation_timeout: Duration) -> Duration {
        let policy = self.publish_policy();
        let attempts = self.max_publish_attempts.max(1);
        let calls = operation_timeout.saturating_mul(attempts.saturating_mul(2));
        let backoff: Duration = (1..attempts).map(|failures| policy.backoff_for(failures)).sum();
        calls.saturating_add(backoff.mul_f64(1.0 + self.jitter_ratio.clamp(0.0, 1.0)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_publish_attempts == 0 {
            return Err(ValidationError::MustBePositive("bus.max_publish_attempts"));
        }
        if self.handler_failure_threshold == 0 {
            return Err(ValidationError::MustBePositive("bus.handler_failure_threshold"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ValidationError::InvalidBackoff("bus.publish"));
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(ValidationError::InvalidBackoff("bus.reconnect"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ValidationError::InvalidMultiplier);
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ValidationError::InvalidRatio("bus.jitter_ratio"));
        }
        if let Some(prefix) = &self.topic_prefix {
            let valid = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !valid || prefix.ends_with('.') {
                return Err(ValidationError::InvalidTopicPrefix(prefix.clone()));
            }
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_publish_attempts: default_max_publish_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            handler_failure_threshold: default_handler_failure_threshold(),
            handler_retry_delay_ms: default_handler_retry_delay(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            shutdown_grace_secs: default_shutdown_grace(),
            topic_prefix: None,
        }
    }
}

fn default_max_publish_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_handler_failure_threshold() -> u32 {
    5
}

fn default_handler_retry_delay() -> u64 {
    50
}

fn default_reconnect_initial() -> u64 {
    200
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_shutdown_grace() -> u64 {
    10
}
