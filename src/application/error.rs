//! Caller-facing error taxonomy for publishing, consuming, and the outbox.

use thiserror::Error;
use uuid::Uuid;

use crate::adapters::broker::AdapterError;
use crate::domain::foundation::ValidationError;
use crate::domain::schema::{SchemaError, SchemaViolation};
use crate::ports::OutboxError;

#[derive(Debug, Clone, Error)]
pub enum EventError {
    /// Payload does not conform to its registered schema. Never retried.
    #[error("payload for '{subject}' violates its schema ({} violation(s))", .violations.len())]
    Validation {
        subject: String,
        violations: Vec<SchemaViolation>,
    },

    /// Registration or lookup rejected by the schema registry.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The adapter kept failing until the attempt limit.
    #[error("publish to '{topic}' failed after {attempts} attempt(s): {reason}")]
    Publish {
        topic: String,
        attempts: u32,
        reason: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    /// Another processor holds the row. Benign.
    #[error("outbox row {0} is claimed by another processor")]
    OutboxClaimConflict(Uuid),

    #[error("invalid event metadata: {0}")]
    InvalidMetadata(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EventError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventError::Publish { .. } | EventError::Connection(_))
    }

    /// Failures caused by the event itself rather than the infrastructure.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            EventError::Validation { .. } | EventError::Schema(_) | EventError::InvalidMetadata(_)
        )
    }
}

impl From<AdapterError> for EventError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Connection(_) | AdapterError::Timeout(_) => {
                EventError::Connection(err.to_string())
            }
            other => EventError::Subscription(other.to_string()),
        }
    }
}

impl From<OutboxError> for EventError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::ClaimConflict(id) => EventError::OutboxClaimConflict(id),
            other => EventError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_publish_and_connection_errors_are_retryable() {
        let publish = EventError::Publish {
            topic: "orders".into(),
            attempts: 5,
            reason: "timeout".into(),
        };
        assert!(publish.is_retryable());
        assert!(EventError::Connection("refused".into()).is_retryable());
        assert!(!EventError::Subscription("bad group".into()).is_retryable());
        assert!(!EventError::OutboxClaimConflict(Uuid::new_v4()).is_retryable());
        assert!(!EventError::Validation {
            subject: "invoice".into(),
            violations: vec![],
        }
        .is_retryable());
    }

    #[test]
    fn adapter_timeouts_surface_as_connection_errors() {
        let err = EventError::from(AdapterError::Timeout(Duration::from_secs(5)));
        assert!(matches!(err, EventError::Connection(_)));

        let err = EventError::from(AdapterError::TopicNotFound("orders".into()));
        assert!(matches!(err, EventError::Subscription(_)));
    }

    #[test]
    fn claim_conflicts_keep_their_row_id() {
        let id = Uuid::new_v4();
        let err = EventError::from(OutboxError::ClaimConflict(id));
        assert!(matches!(err, EventError::OutboxClaimConflict(got) if got == id));

        let err = EventError::from(OutboxError::Storage("pool closed".into()));
        assert!(matches!(err, EventError::Storage(_)));
    }

    #[test]
    fn schema_failures_are_permanent() {
        let err = EventError::from(SchemaError::SubjectNotFound("invoice".into()));
        assert!(err.is_permanent());
        assert!(!EventError::Connection("down".into()).is_permanent());
    }
}
