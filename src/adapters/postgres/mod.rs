//! PostgreSQL adapters.
//!
//! The outbox table is created by `migrations/*_create_outbox_events.sql`.

mod outbox_repository;

pub use outbox_repository::PostgresOutboxRepository;
