//! EventHandler port - Interface for processing consumed events.
//!
//! Handlers are registered with the bus per consumer group and know
//! nothing about the adapter that delivered the record.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, EventRecord};

/// Handler for processing consumed events.
///
/// Delivery is at-least-once, so implementations should be:
/// - **Idempotent** - Safe to call multiple times with the same event
/// - **Quick** - Long operations should be queued for async processing
///
/// Returning an error counts as a failed attempt; after the configured
/// threshold the record is routed to the topic's dead-letter queue.
///
/// # Example
///
/// ```ignore
/// struct InvoiceProjector { /* ... */ }
///
/// #[async_trait]
/// impl EventHandler for InvoiceProjector {
///     async fn handle(&self, event: EventRecord) -> Result<(), DomainError> {
///         let invoice: InvoiceCreated = event.data_as()
///             .map_err(|e| DomainError::handler(e.to_string()))?;
///         // Update read model...
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "InvoiceProjector"
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process an event.
    async fn handle(&self, event: EventRecord) -> Result<(), DomainError>;

    /// Handler name for logging and idempotency keys.
    fn name(&self) -> &'static str;
}
