//! ProcessedEventStore port - Interface for tracking processed events.
//!
//! This port enables idempotent event handling by tracking which events
//! have been processed by which handlers. This prevents duplicate
//! processing when events are redelivered.
//!
//! ## Why Idempotency Matters
//!
//! Events may be delivered more than once due to:
//! - Publish retries after an ambiguous timeout
//! - Outbox rows re-dispatched after a lease expired
//! - Consumers crashing before the offset was committed
//!
//! Outbox-dispatched events reuse the row id as their event id, so a
//! redelivered row is recognised as the same event.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, EventId, Timestamp};

/// Port for tracking which events have been processed by which handlers.
///
/// Each handler has its own processing record, allowing different handlers
/// to process the same event independently while maintaining idempotency
/// within each handler.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Check if an event has been processed by a specific handler.
    async fn contains(&self, event_id: &EventId, handler_name: &str) -> Result<bool, DomainError>;

    /// Mark an event as processed by a specific handler.
    ///
    /// This should be called AFTER successful event handling to ensure
    /// the event is not reprocessed on retry.
    async fn mark_processed(&self, event_id: &EventId, handler_name: &str) -> Result<(), DomainError>;

    /// Delete entries recorded before `timestamp`. Returns the number deleted.
    async fn delete_before(&self, timestamp: Timestamp) -> Result<u64, DomainError>;
}
