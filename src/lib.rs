//! eventline - Event bus over pluggable streaming backends.
//!
//! The crate has three parts:
//!
//! - An [`EventBus`](application::EventBus) that publishes and consumes
//!   [`EventRecord`](domain::foundation::EventRecord)s through an in-memory,
//!   stream-log, or partitioned-log adapter, with retries, dead-letter
//!   topics, and offset commits.
//! - A transactional outbox: rows are written in the caller's transaction
//!   and published by claim-based [`OutboxDispatcher`](application::OutboxDispatcher)
//!   workers.
//! - A versioned [`SchemaRegistry`](domain::schema::SchemaRegistry) with
//!   compatibility checks, consulted on publish.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;
