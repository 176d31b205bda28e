//! StreamStore port - Append-only streams with consumer groups.
//!
//! Mirrors the Redis Streams command set the stream-log adapter needs:
//!
//! | Method         | Redis command                        |
//! |----------------|--------------------------------------|
//! | `append`       | `XADD stream * envelope <json>`      |
//! | `ensure_group` | `XGROUP CREATE stream group 0 MKSTREAM` |
//! | `read_group`   | `XREADGROUP GROUP g c COUNT n STREAMS s >` |
//! | `ack`          | `XACK stream group id`               |
//! | `claim_idle`   | `XPENDING` + `XCLAIM stream group c min-idle ids` |
//! | `delete_stream`| `DEL stream`                         |

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::foundation::StreamEntryId;

/// An entry read from a stream on behalf of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    /// The serialized envelope stored in the entry's single field.
    pub payload: String,
    /// Times the entry has been handed to the group, including this one.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamStoreError {
    #[error("stream store unavailable: {0}")]
    Unavailable(String),

    #[error("stream '{0}' does not exist")]
    NoSuchStream(String),

    #[error("consumer group '{group}' does not exist on '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("unexpected reply: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn ping(&self) -> Result<(), StreamStoreError>;

    /// Append a payload and return the id assigned to it.
    async fn append(&self, stream: &str, payload: &str) -> Result<StreamEntryId, StreamStoreError>;

    /// Create the group at the start of the stream, creating the stream if needed.
    ///
    /// Succeeds if the group already exists.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamStoreError>;

    /// Read entries never delivered to the group and add them to its pending list.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamStoreError>;

    /// Remove an entry from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, id: StreamEntryId) -> Result<(), StreamStoreError>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamStoreError>;

    /// Create an empty stream if it does not exist.
    async fn create_stream(&self, stream: &str) -> Result<(), StreamStoreError>;

    async fn stream_exists(&self, stream: &str) -> Result<bool, StreamStoreError>;

    /// Returns true if the stream existed.
    async fn delete_stream(&self, stream: &str) -> Result<bool, StreamStoreError>;

    async fn list_streams(&self) -> Result<Vec<String>, StreamStoreError>;
}
