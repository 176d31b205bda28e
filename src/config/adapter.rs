//! Broker adapter selection and tuning

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use crate::adapters::broker::{CommitMode, DeliveryMode};

/// Which broker backend the process uses. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    Memory,
    StreamLog,
    PartitionedLog,
}

/// How consumed offsets are committed on the partitioned log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStrategy {
    #[default]
    PerMessage,
    Batched,
}

/// Adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub kind: AdapterKind,

    /// Upper bound for a single broker call, in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// How long an idle consumer waits before polling again
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Partitions for topics created implicitly on the partitioned log
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,

    #[serde(default = "default_true")]
    pub auto_create_topics: bool,

    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    #[serde(default)]
    pub commit_mode: CommitStrategy,

    /// Commits buffered before a flush when `commit_mode = batched`
    #[serde(default = "default_commit_batch_size")]
    pub commit_batch_size: usize,

    /// Pending stream entries older than this are reclaimed by another consumer
    #[serde(default = "default_idle_claim_timeout")]
    pub idle_claim_timeout_secs: u64,

    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
}

impl AdapterConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_claim_timeout_secs)
    }

    pub fn commit_mode(&self) -> CommitMode {
        match self.commit_mode {
            CommitStrategy::PerMessage => CommitMode::PerMessage,
            CommitStrategy::Batched => CommitMode::Batched(self.commit_batch_size),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.operation_timeout_secs == 0 {
            return Err(ValidationError::MustBePositive("adapter.operation_timeout_secs"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::MustBePositive("adapter.poll_interval_ms"));
        }
        if self.default_partitions == 0 {
            return Err(ValidationError::MustBePositive("adapter.default_partitions"));
        }
        if self.commit_batch_size == 0 {
            return Err(ValidationError::MustBePositive("adapter.commit_batch_size"));
        }
        if self.read_batch_size == 0 {
            return Err(ValidationError::MustBePositive("adapter.read_batch_size"));
        }
        Ok(())
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::default(),
            operation_timeout_secs: default_operation_timeout(),
            poll_interval_ms: default_poll_interval(),
            default_partitions: default_partitions(),
            auto_create_topics: true,
            delivery_mode: DeliveryMode::default(),
            commit_mode: CommitStrategy::default(),
            commit_batch_size: default_commit_batch_size(),
            idle_claim_timeout_secs: default_idle_claim_timeout(),
            read_batch_size: default_read_batch_size(),
        }
    }
}

fn default_operation_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    50
}

fn default_partitions() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_commit_batch_size() -> usize {
    100
}

fn default_idle_claim_timeout() -> u64 {
    30
}

fn default_read_batch_size() -> usize {
    32
}
