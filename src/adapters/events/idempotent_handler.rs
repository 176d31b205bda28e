//! IdempotentHandler - Wrapper for consumer-side deduplication.
//!
//! Delivery is at-least-once, so a handler may see the same event again
//! after a reconnect, a stream reclaim, or an outbox lease expiry. This
//! wrapper records each successfully handled `event_id` per handler name
//! in a `ProcessedEventStore` and skips events it has already seen.
//!
//! ## Usage
//!
//! ```ignore
//! let handler = IdempotentHandler::new(InvoiceProjector::new(repo), processed.clone());
//! bus.subscribe(&["invoice.created"], "projections", Arc::new(handler))?;
//! ```
//!
//! ## Error Handling
//!
//! - If the inner handler fails, the event is NOT marked as processed, so
//!   the bus retries it
//! - ProcessedEventStore errors are propagated and count as a failed attempt

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::foundation::{DomainError, EventRecord};
use crate::ports::{EventHandler, ProcessedEventStore};

/// Decorates any `EventHandler` with idempotency tracking, keyed on the
/// inner handler's `name()`.
pub struct IdempotentHandler<H: EventHandler> {
    inner: H,
    processed_events: Arc<dyn ProcessedEventStore>,
}

impl<H: EventHandler> IdempotentHandler<H> {
    pub fn new(inner: H, processed_events: Arc<dyn ProcessedEventStore>) -> Self {
        Self {
            inner,
            processed_events,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: EventHandler + 'static> EventHandler for IdempotentHandler<H> {
    async fn handle(&self, event: EventRecord) -> Result<(), DomainError> {
        let handler_name = self.inner.name();

        if self
            .processed_events
            .contains(&event.event_id, handler_name)
            .await?
        {
            tracing::debug!(
                event_id = %event.event_id,
                handler = handler_name,
                "Skipping duplicate event"
            );
            return Ok(());
        }

        let event_id = event.event_id.clone();
        self.inner.handle(event).await?;

        // Only after success, so a failed attempt is retried.
        self.processed_events
            .mark_processed(&event_id, handler_name)
            .await?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
