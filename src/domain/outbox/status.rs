//! Outbox row status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::foundation::{StateMachine, ValidationError};

/// Delivery status of an outbox row.
///
/// ```text
/// PENDING -> PROCESSING -> PUBLISHED
///                       -> PENDING   (retry or release)
///                       -> DEAD      (retries exhausted)
///                       -> FAILED    (non-retryable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DEAD" => Ok(OutboxStatus::Dead),
            other => Err(ValidationError::invalid_format(
                "status",
                format!("unknown outbox status '{}'", other),
            )),
        }
    }
}

impl StateMachine for OutboxStatus {
    fn valid_transitions(&self) -> Vec<Self> {
        use OutboxStatus::*;
        match self {
            Pending => vec![Processing],
            Processing => vec![Pending, Published, Dead, Failed],
            Published | Failed | Dead => vec![],
        }
    }
}
