//! Consumer-side event helpers.
//!
//! - `IdempotentHandler` - Wrapper that skips events a handler already processed
//! - `InMemoryProcessedEventStore` - Idempotency records for tests and single-process use

mod idempotent_handler;
mod processed_store;

pub use idempotent_handler::IdempotentHandler;
pub use processed_store::InMemoryProcessedEventStore;
