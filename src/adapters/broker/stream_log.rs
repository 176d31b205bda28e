//! Stream-log adapter over a [`StreamStore`].
//!
//! Each topic is one append-only stream; each entry holds the encoded
//! envelope in a single field. Consumers read through a consumer group and
//! acknowledge entries by committing their ids. Entries a crashed consumer
//! never acknowledged stay in the group's pending list and are reclaimed by
//! another member once they have been idle for `idle_claim_timeout`.

use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::foundation::{AckToken, ConsumerRecord, EventRecord, Offset, PublishResult};
use crate::ports::{StreamEntry, StreamStore};

use super::codec::{decode_record, encode_record};
use super::{AdapterError, AdapterOptions, RecordStream, Subscription};

const NAME: &str = "stream_log";

#[derive(Clone)]
pub struct StreamLogAdapter {
    inner: Arc<StreamLogInner>,
}

struct StreamLogInner {
    store: Arc<dyn StreamStore>,
    connected: AtomicBool,
    options: AdapterOptions,
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
}

impl StreamLogAdapter {
    pub fn new(store: Arc<dyn StreamStore>, options: AdapterOptions) -> Self {
        Self {
            inner: Arc::new(StreamLogInner {
                store,
                connected: AtomicBool::new(false),
                options,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn connect(&self) -> Result<(), AdapterError> {
        self.inner.store.ping().await?;
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            tracing::info!(adapter = NAME, "Adapter connected");
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), AdapterError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.subscriptions.lock().await.clear();
        tracing::info!(adapter = NAME, "Adapter disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, topic: &str, record: &EventRecord) -> Result<PublishResult, AdapterError> {
        self.ensure_connected()?;
        self.ensure_topic(topic).await?;
        let payload = encode_record(record)?;
        let id = self.inner.store.append(topic, &payload).await?;
        Ok(PublishResult::accepted(topic, 0, Offset::Entry(id)))
    }

    /// Append records in order.
    ///
    /// Every record is encoded before the first append, so codec failures
    /// never leave a partial batch; a store failure mid-batch can.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: &[EventRecord],
    ) -> Result<Vec<PublishResult>, AdapterError> {
        self.ensure_connected()?;
        self.ensure_topic(topic).await?;
        let payloads = records
            .iter()
            .map(encode_record)
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            let id = self.inner.store.append(topic, payload).await?;
            results.push(PublishResult::accepted(topic, 0, Offset::Entry(id)));
        }
        Ok(results)
    }

    pub async fn subscribe(&self, topics: &[String], group: &str) -> Result<Subscription, AdapterError> {
        self.ensure_connected()?;
        for topic in topics {
            self.ensure_topic(topic).await?;
            self.inner.store.ensure_group(topic, group).await?;
        }
        let subscription = Subscription::new(topics, group);
        self.inner
            .subscriptions
            .lock()
            .await
            .insert(subscription.id, subscription.clone());
        tracing::debug!(
            adapter = NAME,
            consumer_group = group,
            consumer = %subscription.consumer,
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Stop reading. Entries this consumer left pending are reclaimed by
    /// other members after the idle timeout.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        self.inner.subscriptions.lock().await.remove(&subscription.id);
        Ok(())
    }

    pub fn consume(&self, subscription: &Subscription) -> RecordStream {
        let state = ConsumeState {
            adapter: self.clone(),
            subscription: subscription.clone(),
            buffer: VecDeque::new(),
        };
        Box::pin(stream::unfold(state, |mut state| async move {
            loop {
                if !state.adapter.is_connected() {
                    return Some((Err(AdapterError::not_connected(NAME)), state));
                }
                if !state.is_active().await {
                    return None;
                }
                if let Some(record) = state.buffer.pop_front() {
                    return Some((Ok(record), state));
                }
                match state.fill().await {
                    Ok(0) => tokio::time::sleep(state.adapter.inner.options.poll_interval).await,
                    Ok(_) => {}
                    Err(err) => return Some((Err(err), state)),
                }
            }
        }))
    }

    /// Acknowledge an entry (XACK).
    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        _partition: u32,
        offset: Offset,
    ) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let Offset::Entry(id) = offset else {
            return Err(AdapterError::InvalidOffset {
                topic: topic.to_string(),
                offset: offset.to_string(),
                reason: "expected a stream entry id".to_string(),
            });
        };
        self.inner.store.ack(topic, group, id).await?;
        Ok(())
    }

    pub async fn create_topic(&self, name: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        self.inner.store.create_stream(name).await?;
        Ok(())
    }

    pub async fn delete_topic(&self, name: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        if !self.inner.store.delete_stream(name).await? {
            return Err(AdapterError::TopicNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn list_topics(&self) -> Result<Vec<String>, AdapterError> {
        self.ensure_connected()?;
        let mut topics = self.inner.store.list_streams().await?;
        topics.sort();
        Ok(topics)
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::not_connected(NAME))
        }
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), AdapterError> {
        if self.inner.options.auto_create_topics || self.inner.store.stream_exists(topic).await? {
            Ok(())
        } else {
            Err(AdapterError::TopicNotFound(topic.to_string()))
        }
    }
}

struct ConsumeState {
    adapter: StreamLogAdapter,
    subscription: Subscription,
    buffer: VecDeque<ConsumerRecord>,
}

impl ConsumeState {
    async fn is_active(&self) -> bool {
        self.adapter
            .inner
            .subscriptions
            .lock()
            .await
            .contains_key(&self.subscription.id)
    }

    /// Reclaim idle entries, then read new ones. Returns how many were buffered.
    async fn fill(&mut self) -> Result<usize, AdapterError> {
        let inner = &self.adapter.inner;
        let sub = &self.subscription;
        let batch = inner.options.read_batch_size.max(1);
        let mut buffered = 0;

        for topic in &sub.topics {
            let reclaimed = inner
                .store
                .claim_idle(topic, &sub.group, &sub.consumer, inner.options.idle_claim_timeout, batch)
                .await?;
            if !reclaimed.is_empty() {
                tracing::warn!(
                    topic = %topic,
                    consumer_group = %sub.group,
                    consumer = %sub.consumer,
                    count = reclaimed.len(),
                    "Reclaimed idle pending entries"
                );
            }
            let fresh = inner.store.read_group(topic, &sub.group, &sub.consumer, batch).await?;

            for entry in reclaimed.into_iter().chain(fresh) {
                if let Some(record) = self.adapter.to_consumer_record(topic, &sub.group, entry).await {
                    self.buffer.push_back(record);
                    buffered += 1;
                }
            }
        }
        Ok(buffered)
    }
}

impl StreamLogAdapter {
    /// Decode an entry; undecodable entries are acknowledged and dropped.
    async fn to_consumer_record(&self, topic: &str, group: &str, entry: StreamEntry) -> Option<ConsumerRecord> {
        match decode_record(&entry.payload) {
            Ok(record) => Some(ConsumerRecord {
                topic: topic.to_string(),
                record,
                delivery_count: entry.delivery_count,
                ack: AckToken {
                    topic: topic.to_string(),
                    partition: 0,
                    offset: Offset::Entry(entry.id),
                },
            }),
            Err(err) => {
                tracing::error!(
                    topic,
                    consumer_group = group,
                    entry_id = %entry.id,
                    error = %err,
                    "Dropping undecodable stream entry"
                );
                if let Err(ack_err) = self.inner.store.ack(topic, group, entry.id).await {
                    tracing::warn!(topic, error = %ack_err, "Failed to acknowledge undecodable entry");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::streams::InMemoryStreamStore;
    use futures::StreamExt;
    use std::time::Duration;

    async fn adapter_with(store: Arc<InMemoryStreamStore>, idle: Duration) -> StreamLogAdapter {
        let adapter = StreamLogAdapter::new(
            store,
            AdapterOptions {
                poll_interval: Duration::from_millis(5),
                idle_claim_timeout: idle,
                ..AdapterOptions::default()
            },
        );
        adapter.connect().await.unwrap();
        adapter
    }

    fn topics() -> Vec<String> {
        vec!["orders".to_string()]
    }

    #[tokio::test]
    async fn publish_returns_entry_offset() {
        let adapter = adapter_with(Arc::new(InMemoryStreamStore::new()), Duration::from_secs(30)).await;
        let result = adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap();
        assert!(matches!(result.offset, Some(Offset::Entry(_))));
        assert_eq!(adapter.list_topics().await.unwrap(), topics());
    }

    #[tokio::test]
    async fn consumed_record_matches_published() {
        let adapter = adapter_with(Arc::new(InMemoryStreamStore::new()), Duration::from_secs(30)).await;
        let record = EventRecord::test_fixture();
        adapter.publish("orders", &record).await.unwrap();

        let sub = adapter.subscribe(&topics(), "g").await.unwrap();
        let consumed = adapter.consume(&sub).next().await.unwrap().unwrap();

        assert_eq!(consumed.record, record);
        assert_eq!(consumed.delivery_count, 1);
    }

    #[tokio::test]
    async fn unacknowledged_entry_is_reclaimed_by_another_member() {
        let store = Arc::new(InMemoryStreamStore::new());
        let adapter = adapter_with(store.clone(), Duration::from_millis(20)).await;
        let record = EventRecord::test_fixture();

        let crashed = adapter.subscribe(&topics(), "g").await.unwrap();
        let survivor = adapter.subscribe(&topics(), "g").await.unwrap();
        adapter.publish("orders", &record).await.unwrap();

        let first = adapter.consume(&crashed).next().await.unwrap().unwrap();
        assert_eq!(first.record.event_id, record.event_id);
        adapter.unsubscribe(&crashed).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = adapter.consume(&survivor).next().await.unwrap().unwrap();
        assert_eq!(reclaimed.record.event_id, record.event_id);
        assert_eq!(reclaimed.delivery_count, 2);

        adapter
            .commit_offset("g", "orders", 0, reclaimed.ack.offset)
            .await
            .unwrap();
        assert_eq!(store.pending_count("orders", "g").await, 0);
    }

    #[tokio::test]
    async fn sequence_offsets_are_rejected() {
        let adapter = adapter_with(Arc::new(InMemoryStreamStore::new()), Duration::from_secs(30)).await;
        let err = adapter
            .commit_offset("g", "orders", 0, Offset::Sequence(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOffset { .. }));
    }

    #[tokio::test]
    async fn undecodable_entries_are_dropped() {
        let store = Arc::new(InMemoryStreamStore::new());
        let adapter = adapter_with(store.clone(), Duration::from_secs(30)).await;
        let sub = adapter.subscribe(&topics(), "g").await.unwrap();
        store.append("orders", "{broken").await.unwrap();
        let record = EventRecord::test_fixture();
        adapter.publish("orders", &record).await.unwrap();

        let consumed = adapter.consume(&sub).next().await.unwrap().unwrap();
        assert_eq!(consumed.record.event_id, record.event_id);
    }

    #[tokio::test]
    async fn disconnect_surfaces_as_connection_error() {
        let adapter = adapter_with(Arc::new(InMemoryStreamStore::new()), Duration::from_secs(30)).await;
        let sub = adapter.subscribe(&topics(), "g").await.unwrap();
        let mut stream = adapter.consume(&sub);
        adapter.disconnect().await.unwrap();
        assert!(matches!(stream.next().await, Some(Err(AdapterError::Connection(_)))));
    }
}
