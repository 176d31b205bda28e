//! Broker adapters - the transport beneath the event bus.
//!
//! [`EventAdapter`] is a closed set of backends chosen once from
//! configuration:
//!
//! - `Memory` - single-process ordered log per topic, one cursor per group
//! - `StreamLog` - append-only streams with pending-entry reclaim (Redis Streams)
//! - `PartitionedLog` - partitioned topics with group rebalancing
//!
//! Every variant is cheap to clone and clones share one connection, so a
//! process builds the adapter once and hands clones to every publisher.

mod codec;
mod memory;
mod partitioned_log;
mod stream_log;

pub use codec::{decode_record, encode_record, WireEnvelope};
pub use memory::InMemoryAdapter;
pub use partitioned_log::{partition_for_key, PartitionedLogAdapter};
pub use stream_log::StreamLogAdapter;

use futures::stream::BoxStream;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::adapters::streams::RedisStreamStore;
use crate::config::{AdapterConfig, AdapterKind, RedisConfig};
use crate::domain::foundation::{ConsumerRecord, EventRecord, Offset, PublishResult};
use crate::ports::StreamStoreError;

/// Errors raised by broker adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("invalid offset {offset} for topic '{topic}': {reason}")]
    InvalidOffset {
        topic: String,
        offset: String,
        reason: String,
    },

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl AdapterError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Connection(_) | AdapterError::Timeout(_) | AdapterError::Backend(_)
        )
    }

    pub(crate) fn not_connected(adapter: &str) -> Self {
        AdapterError::Connection(format!("{} adapter is not connected", adapter))
    }
}

impl From<StreamStoreError> for AdapterError {
    fn from(err: StreamStoreError) -> Self {
        match err {
            StreamStoreError::Unavailable(msg) => AdapterError::Connection(msg),
            StreamStoreError::NoSuchStream(stream) => AdapterError::TopicNotFound(stream),
            err @ StreamStoreError::NoSuchGroup { .. } => AdapterError::Subscription(err.to_string()),
            StreamStoreError::Protocol(msg) => AdapterError::Backend(msg),
        }
    }
}

/// Delivery guarantee of the partitioned log's producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    AtLeastOnce,
    /// Idempotent producer: a re-publish of a stored event id is a no-op.
    ExactlyOnce,
}

/// When consumed offsets become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    #[default]
    PerMessage,
    /// Flush after this many commits, or on unsubscribe/disconnect.
    Batched(usize),
}

/// Tuning shared by all adapter variants.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub poll_interval: Duration,
    pub auto_create_topics: bool,
    pub default_partitions: u32,
    pub delivery_mode: DeliveryMode,
    pub commit_mode: CommitMode,
    pub idle_claim_timeout: Duration,
    pub read_batch_size: usize,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            auto_create_topics: true,
            default_partitions: 3,
            delivery_mode: DeliveryMode::AtLeastOnce,
            commit_mode: CommitMode::PerMessage,
            idle_claim_timeout: Duration::from_secs(30),
            read_batch_size: 32,
        }
    }
}

impl From<&AdapterConfig> for AdapterOptions {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            auto_create_topics: config.auto_create_topics,
            default_partitions: config.default_partitions,
            delivery_mode: config.delivery_mode,
            commit_mode: config.commit_mode(),
            idle_claim_timeout: config.idle_claim_timeout(),
            read_batch_size: config.read_batch_size,
        }
    }
}

/// A consumer's membership in a group, returned by `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: Uuid,
    pub topics: Vec<String>,
    pub group: String,
    /// Consumer name inside the group.
    pub consumer: String,
}

impl Subscription {
    pub(crate) fn new(topics: &[String], group: &str) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            topics: topics.to_vec(),
            group: group.to_string(),
            consumer: format!("{}-{}", group, id.simple()),
        }
    }
}

/// Lazy, restartable sequence of consumed records.
pub type RecordStream = BoxStream<'static, Result<ConsumerRecord, AdapterError>>;

/// The configured transport.
#[derive(Clone)]
pub enum EventAdapter {
    Memory(InMemoryAdapter),
    StreamLog(StreamLogAdapter),
    PartitionedLog(PartitionedLogAdapter),
}

impl std::fmt::Debug for EventAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventAdapter").field(&self.name()).finish()
    }
}

impl EventAdapter {
    /// Build the adapter selected by configuration.
    ///
    /// The stream-log variant opens its Redis connection here.
    pub async fn from_config(adapter: &AdapterConfig, redis: &RedisConfig) -> Result<Self, AdapterError> {
        let options = AdapterOptions::from(adapter);
        match adapter.kind {
            AdapterKind::Memory => Ok(EventAdapter::Memory(InMemoryAdapter::new(options))),
            AdapterKind::PartitionedLog => {
                Ok(EventAdapter::PartitionedLog(PartitionedLogAdapter::new(options)))
            }
            AdapterKind::StreamLog => {
                let store = RedisStreamStore::connect(&redis.url, redis.connect_timeout())
                    .await
                    .map_err(AdapterError::from)?;
                Ok(EventAdapter::StreamLog(StreamLogAdapter::new(Arc::new(store), options)))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventAdapter::Memory(_) => "memory",
            EventAdapter::StreamLog(_) => "stream_log",
            EventAdapter::PartitionedLog(_) => "partitioned_log",
        }
    }

    pub async fn connect(&self) -> Result<(), AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.connect().await,
            EventAdapter::StreamLog(a) => a.connect().await,
            EventAdapter::PartitionedLog(a) => a.connect().await,
        }
    }

    pub async fn disconnect(&self) -> Result<(), AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.disconnect().await,
            EventAdapter::StreamLog(a) => a.disconnect().await,
            EventAdapter::PartitionedLog(a) => a.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            EventAdapter::Memory(a) => a.is_connected(),
            EventAdapter::StreamLog(a) => a.is_connected(),
            EventAdapter::PartitionedLog(a) => a.is_connected(),
        }
    }

    pub async fn publish(&self, topic: &str, record: &EventRecord) -> Result<PublishResult, AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.publish(topic, record).await,
            EventAdapter::StreamLog(a) => a.publish(topic, record).await,
            EventAdapter::PartitionedLog(a) => a.publish(topic, record).await,
        }
    }

    pub async fn publish_batch(
        &self,
        topic: &str,
        records: &[EventRecord],
    ) -> Result<Vec<PublishResult>, AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.publish_batch(topic, records).await,
            EventAdapter::StreamLog(a) => a.publish_batch(topic, records).await,
            EventAdapter::PartitionedLog(a) => a.publish_batch(topic, records).await,
        }
    }

    pub async fn subscribe(&self, topics: &[String], group: &str) -> Result<Subscription, AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.subscribe(topics, group).await,
            EventAdapter::StreamLog(a) => a.subscribe(topics, group).await,
            EventAdapter::PartitionedLog(a) => a.subscribe(topics, group).await,
        }
    }

    /// Leave the consumer group. Local bookkeeping succeeds while disconnected.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.unsubscribe(subscription).await,
            EventAdapter::StreamLog(a) => a.unsubscribe(subscription).await,
            EventAdapter::PartitionedLog(a) => a.unsubscribe(subscription).await,
        }
    }

    /// Records for a subscription, resuming from the group's committed position.
    ///
    /// The stream ends once the subscription is removed and yields
    /// `AdapterError::Connection` while the adapter is disconnected.
    pub fn consume(&self, subscription: &Subscription) -> RecordStream {
        match self {
            EventAdapter::Memory(a) => a.consume(subscription),
            EventAdapter::StreamLog(a) => a.consume(subscription),
            EventAdapter::PartitionedLog(a) => a.consume(subscription),
        }
    }

    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: Offset,
    ) -> Result<(), AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.commit_offset(group, topic, partition, offset).await,
            EventAdapter::StreamLog(a) => a.commit_offset(group, topic, partition, offset).await,
            EventAdapter::PartitionedLog(a) => a.commit_offset(group, topic, partition, offset).await,
        }
    }

    /// Create a topic; `partitions` only matters for the partitioned log.
    pub async fn create_topic(&self, name: &str, partitions: Option<u32>) -> Result<(), AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.create_topic(name).await,
            EventAdapter::StreamLog(a) => a.create_topic(name).await,
            EventAdapter::PartitionedLog(a) => a.create_topic(name, partitions).await,
        }
    }

    pub async fn delete_topic(&self, name: &str) -> Result<(), AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.delete_topic(name).await,
            EventAdapter::StreamLog(a) => a.delete_topic(name).await,
            EventAdapter::PartitionedLog(a) => a.delete_topic(name).await,
        }
    }

    pub async fn list_topics(&self) -> Result<Vec<String>, AdapterError> {
        match self {
            EventAdapter::Memory(a) => a.list_topics().await,
            EventAdapter::StreamLog(a) => a.list_topics().await,
            EventAdapter::PartitionedLog(a) => a.list_topics().await,
        }
    }
}

impl From<InMemoryAdapter> for EventAdapter {
    fn from(adapter: InMemoryAdapter) -> Self {
        EventAdapter::Memory(adapter)
    }
}

impl From<StreamLogAdapter> for EventAdapter {
    fn from(adapter: StreamLogAdapter) -> Self {
        EventAdapter::StreamLog(adapter)
    }
}

impl From<PartitionedLogAdapter> for EventAdapter {
    fn from(adapter: PartitionedLogAdapter) -> Self {
        EventAdapter::PartitionedLog(adapter)
    }
}
