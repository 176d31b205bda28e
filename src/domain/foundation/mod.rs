//! Foundation module - Shared domain primitives.
//!
//! Contains value objects, identifiers, delivery results, and error types
//! that form the vocabulary of the event core.

mod delivery;
mod errors;
mod events;
mod state_machine;
mod timestamp;

pub use delivery::{AckToken, ConsumerRecord, Offset, PublishResult, StreamEntryId};
pub use errors::{DomainError, ErrorCode, ValidationError};
pub use events::{EventId, EventMetadata, EventRecord, PartitionKey};
pub use state_machine::StateMachine;
pub use timestamp::{ProducerClock, Timestamp};
