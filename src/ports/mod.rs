//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the core and the outside world. Adapters implement these ports.
//!
//! ## Event Ports
//!
//! - `EventHandler` - Handler that processes consumed events
//! - `ProcessedEventStore` - Idempotency tracking for event handlers
//! - `TenantContext` - Tenant lookup for events published without one
//!
//! ## Storage Ports
//!
//! - `OutboxTransaction` - Insert outbox rows inside a caller's transaction
//! - `OutboxRepository` - Claim and update outbox rows for dispatch
//! - `StreamStore` - Append-only streams with consumer groups

mod event_handler;
mod outbox_repository;
mod processed_event_store;
mod stream_store;
mod tenant_context;

pub use event_handler::EventHandler;
pub use outbox_repository::{OutboxError, OutboxRepository, OutboxStats, OutboxTransaction};
pub use processed_event_store::ProcessedEventStore;
pub use stream_store::{StreamEntry, StreamStore, StreamStoreError};
pub use tenant_context::{FixedTenantContext, TenantContext};
