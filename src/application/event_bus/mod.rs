//! Event bus - publish and subscribe over the configured adapter.
//!
//! - `EventBus` - Validation, topic naming, retries, health
//! - `SubscriptionHandle` - Control over a running consumption loop
//! - `ConsumerState` - Lifecycle of that loop

mod bus;
mod consumer;
mod metrics;

pub use bus::{EventBus, HealthReport};
pub use consumer::{dlq_topic, ConsumerState, SubscriptionHandle};
pub use metrics::{BusMetrics, MetricsSnapshot};
