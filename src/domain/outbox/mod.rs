//! Outbox module - events stored alongside business writes.

mod event;
mod status;

pub use event::{NewOutboxEvent, OutboxEvent};
pub use status::OutboxStatus;
