//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the core to external systems:
//! - `broker` - Event transports (in-memory, stream log, partitioned log)
//! - `streams` - Stream stores behind the stream-log transport (Redis, in-memory)
//! - `outbox` - In-process transactional outbox store
//! - `postgres` - PostgreSQL outbox repository
//! - `events` - Consumer-side idempotency helpers

pub mod broker;
pub mod events;
pub mod outbox;
pub mod postgres;
pub mod streams;

pub use broker::{EventAdapter, InMemoryAdapter, PartitionedLogAdapter, StreamLogAdapter};
pub use events::{IdempotentHandler, InMemoryProcessedEventStore};
pub use outbox::{InMemoryOutboxStore, InMemoryTransaction};
pub use postgres::PostgresOutboxRepository;
pub use streams::{InMemoryStreamStore, RedisStreamStore};
