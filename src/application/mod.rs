//! Application layer - services that orchestrate the domain and ports.
//!
//! - `event_bus` - Validated publish with retries, consumer loops with DLQ routing
//! - `outbox` - Transactional outbox storage, dispatch workers, maintenance

mod error;
pub mod event_bus;
pub mod outbox;

pub use error::EventError;
pub use event_bus::{
    ConsumerState, EventBus, HealthReport, MetricsSnapshot, SubscriptionHandle,
};
pub use outbox::{DispatchReport, DispatcherHandle, OutboxDispatcher, OutboxManager};
