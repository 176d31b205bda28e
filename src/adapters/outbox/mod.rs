//! In-process outbox storage.

mod in_memory;

pub use in_memory::{InMemoryOutboxStore, InMemoryTransaction};
