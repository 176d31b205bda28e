//! In-memory adapter for tests and local development.
//!
//! One ordered log per topic and one shared cursor per (group, topic).
//! Members of a group compete for the cursor; the cursor rewinds to the
//! group's committed offset whenever the first member joins, so records
//! taken but never committed are delivered again after a restart.

use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::foundation::{AckToken, ConsumerRecord, EventRecord, Offset, PublishResult};

use super::{AdapterError, AdapterOptions, RecordStream, Subscription};

const NAME: &str = "memory";

#[derive(Clone)]
pub struct InMemoryAdapter {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
    outage: AtomicBool,
    publish_latency_ms: AtomicU64,
    options: AdapterOptions,
}

#[derive(Default)]
struct MemoryState {
    topics: BTreeMap<String, Vec<EventRecord>>,
    cursors: HashMap<(String, String), GroupCursor>,
    subscriptions: HashMap<uuid::Uuid, Subscription>,
}

#[derive(Default)]
struct GroupCursor {
    next: u64,
    committed: u64,
    members: usize,
    deliveries: HashMap<u64, u32>,
}

impl MemoryState {
    fn ensure_topic(&mut self, topic: &str, auto_create: bool) -> Result<&mut Vec<EventRecord>, AdapterError> {
        if !self.topics.contains_key(topic) {
            if !auto_create {
                return Err(AdapterError::TopicNotFound(topic.to_string()));
            }
            self.topics.insert(topic.to_string(), Vec::new());
        }
        self.topics
            .get_mut(topic)
            .ok_or_else(|| AdapterError::TopicNotFound(topic.to_string()))
    }

    fn leave(&mut self, subscription: &Subscription) {
        if self.subscriptions.remove(&subscription.id).is_none() {
            return;
        }
        for topic in &subscription.topics {
            if let Some(cursor) = self.cursors.get_mut(&(subscription.group.clone(), topic.clone())) {
                cursor.members = cursor.members.saturating_sub(1);
            }
        }
    }

    /// Take the next record for a subscription, rotating across its topics.
    fn take_next(&mut self, subscription: &Subscription, start: usize) -> Option<ConsumerRecord> {
        let count = subscription.topics.len();
        for i in 0..count {
            let topic = &subscription.topics[(start + i) % count];
            let Some(log) = self.topics.get(topic) else {
                continue;
            };
            let Some(cursor) = self.cursors.get_mut(&(subscription.group.clone(), topic.clone())) else {
                continue;
            };
            let Some(record) = log.get(cursor.next as usize) else {
                continue;
            };
            let offset = cursor.next;
            cursor.next += 1;
            let delivery_count = cursor.deliveries.entry(offset).or_insert(0);
            *delivery_count += 1;
            return Some(ConsumerRecord {
                topic: topic.clone(),
                record: record.clone(),
                delivery_count: *delivery_count,
                ack: AckToken {
                    topic: topic.clone(),
                    partition: 0,
                    offset: Offset::Sequence(offset),
                },
            });
        }
        None
    }
}

impl InMemoryAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                connected: AtomicBool::new(false),
                outage: AtomicBool::new(false),
                publish_latency_ms: AtomicU64::new(0),
                options,
            }),
        }
    }

    pub async fn connect(&self) -> Result<(), AdapterError> {
        if self.inner.outage.load(Ordering::SeqCst) {
            return Err(AdapterError::Connection("memory broker unreachable".to_string()));
        }
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            tracing::info!(adapter = NAME, "Adapter connected");
        }
        Ok(())
    }

    /// Disconnect and drop every group membership.
    pub async fn disconnect(&self) -> Result<(), AdapterError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.drop_memberships().await;
        tracing::info!(adapter = NAME, "Adapter disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, topic: &str, record: &EventRecord) -> Result<PublishResult, AdapterError> {
        self.ensure_connected()?;
        self.stall().await;
        let mut state = self.inner.state.lock().await;
        let log = state.ensure_topic(topic, self.inner.options.auto_create_topics)?;
        log.push(record.clone());
        let offset = (log.len() - 1) as u64;
        Ok(PublishResult::accepted(topic, 0, Offset::Sequence(offset)))
    }

    /// Append all records or none.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: &[EventRecord],
    ) -> Result<Vec<PublishResult>, AdapterError> {
        self.ensure_connected()?;
        self.stall().await;
        let mut state = self.inner.state.lock().await;
        let log = state.ensure_topic(topic, self.inner.options.auto_create_topics)?;
        let first = log.len() as u64;
        log.extend(records.iter().cloned());
        Ok((0..records.len() as u64)
            .map(|i| PublishResult::accepted(topic, 0, Offset::Sequence(first + i)))
            .collect())
    }

    pub async fn subscribe(&self, topics: &[String], group: &str) -> Result<Subscription, AdapterError> {
        self.ensure_connected()?;
        let subscription = Subscription::new(topics, group);
        let mut state = self.inner.state.lock().await;
        for topic in topics {
            state.ensure_topic(topic, self.inner.options.auto_create_topics)?;
        }
        for topic in topics {
            let cursor = state
                .cursors
                .entry((group.to_string(), topic.clone()))
                .or_default();
            if cursor.members == 0 {
                cursor.next = cursor.committed;
            }
            cursor.members += 1;
        }
        state.subscriptions.insert(subscription.id, subscription.clone());
        tracing::debug!(adapter = NAME, consumer_group = group, topics = ?topics, "Subscribed");
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        self.inner.state.lock().await.leave(subscription);
        Ok(())
    }

    pub fn consume(&self, subscription: &Subscription) -> RecordStream {
        let adapter = self.clone();
        let subscription = subscription.clone();
        Box::pin(stream::unfold(
            (adapter, subscription, 0usize),
            |(adapter, subscription, rotation)| async move {
                loop {
                    if !adapter.is_connected() {
                        let err = AdapterError::not_connected(NAME);
                        return Some((Err(err), (adapter, subscription, rotation)));
                    }
                    {
                        let mut state = adapter.inner.state.lock().await;
                        if !state.subscriptions.contains_key(&subscription.id) {
                            return None;
                        }
                        if let Some(record) = state.take_next(&subscription, rotation) {
                            drop(state);
                            return Some((Ok(record), (adapter, subscription, rotation + 1)));
                        }
                    }
                    tokio::time::sleep(adapter.inner.options.poll_interval).await;
                }
            },
        ))
    }

    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        _partition: u32,
        offset: Offset,
    ) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let Offset::Sequence(position) = offset else {
            return Err(invalid_offset(topic, offset, "expected a sequence offset"));
        };
        let mut state = self.inner.state.lock().await;
        let len = state
            .topics
            .get(topic)
            .map(|log| log.len() as u64)
            .ok_or_else(|| AdapterError::TopicNotFound(topic.to_string()))?;
        if position >= len {
            return Err(invalid_offset(topic, offset, "beyond end of log"));
        }
        let cursor = state
            .cursors
            .entry((group.to_string(), topic.to_string()))
            .or_default();
        cursor.committed = cursor.committed.max(position + 1);
        cursor.deliveries.remove(&position);
        Ok(())
    }

    pub async fn create_topic(&self, name: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        self.inner
            .state
            .lock()
            .await
            .topics
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    pub async fn delete_topic(&self, name: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let mut state = self.inner.state.lock().await;
        if state.topics.remove(name).is_none() {
            return Err(AdapterError::TopicNotFound(name.to_string()));
        }
        state.cursors.retain(|(_, topic), _| topic != name);
        Ok(())
    }

    pub async fn list_topics(&self) -> Result<Vec<String>, AdapterError> {
        self.ensure_connected()?;
        Ok(self.inner.state.lock().await.topics.keys().cloned().collect())
    }

    /// Drop the connection and refuse reconnects until [`restore`](Self::restore).
    pub async fn simulate_outage(&self) {
        self.inner.outage.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.drop_memberships().await;
        tracing::warn!(adapter = NAME, "Simulated outage");
    }

    /// Allow reconnects again. Does not connect by itself.
    pub fn restore(&self) {
        self.inner.outage.store(false, Ordering::SeqCst);
    }

    /// Delay every publish by `latency` before it is appended.
    pub fn set_publish_latency(&self, latency: Duration) {
        self.inner
            .publish_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn topic_len(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Offset of the next record the group will read after a restart.
    pub async fn committed_offset(&self, group: &str, topic: &str) -> Option<u64> {
        self.inner
            .state
            .lock()
            .await
            .cursors
            .get(&(group.to_string(), topic.to_string()))
            .map(|cursor| cursor.committed)
    }

    pub async fn records(&self, topic: &str) -> Vec<EventRecord> {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    async fn stall(&self) {
        let latency = self.inner.publish_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::not_connected(NAME))
        }
    }

    async fn drop_memberships(&self) {
        let mut state = self.inner.state.lock().await;
        state.subscriptions.clear();
        for cursor in state.cursors.values_mut() {
            cursor.members = 0;
        }
    }
}

fn invalid_offset(topic: &str, offset: Offset, reason: &str) -> AdapterError {
    AdapterError::InvalidOffset {
        topic: topic.to_string(),
        offset: offset.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn connected() -> InMemoryAdapter {
        let adapter = InMemoryAdapter::new(AdapterOptions {
            poll_interval: Duration::from_millis(5),
            ..AdapterOptions::default()
        });
        adapter.connect().await.unwrap();
        adapter
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let adapter = InMemoryAdapter::new(AdapterOptions::default());
        let err = adapter.publish("t", &EventRecord::test_fixture()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Connection(_)));
    }

    #[tokio::test]
    async fn publish_assigns_sequential_offsets() {
        let adapter = connected().await;
        let first = adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap();
        let second = adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap();
        assert_eq!(first.offset, Some(Offset::Sequence(0)));
        assert_eq!(second.offset, Some(Offset::Sequence(1)));
        assert_eq!(adapter.topic_len("orders").await, 2);
    }

    #[tokio::test]
    async fn missing_topic_is_rejected_without_auto_create() {
        let adapter = InMemoryAdapter::new(AdapterOptions {
            auto_create_topics: false,
            ..AdapterOptions::default()
        });
        adapter.connect().await.unwrap();
        let err = adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap_err();
        assert_eq!(err, AdapterError::TopicNotFound("orders".to_string()));
    }

    #[tokio::test]
    async fn consume_yields_records_in_order() {
        let adapter = connected().await;
        let a = EventRecord::test_fixture();
        let b = EventRecord::test_fixture();
        adapter.publish("orders", &a).await.unwrap();
        adapter.publish("orders", &b).await.unwrap();

        let sub = adapter.subscribe(&topics(&["orders"]), "g").await.unwrap();
        let mut stream = adapter.consume(&sub);

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.record.event_id, a.event_id);
        assert_eq!(second.record.event_id, b.event_id);
        assert_eq!(first.delivery_count, 1);
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered_after_resubscribe() {
        let adapter = connected().await;
        for _ in 0..3 {
            adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap();
        }

        let sub = adapter.subscribe(&topics(&["orders"]), "g").await.unwrap();
        let mut stream = adapter.consume(&sub);
        let first = stream.next().await.unwrap().unwrap();
        adapter.commit_offset("g", "orders", 0, first.ack.offset).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        drop(stream);
        adapter.unsubscribe(&sub).await.unwrap();

        let sub = adapter.subscribe(&topics(&["orders"]), "g").await.unwrap();
        let mut stream = adapter.consume(&sub);
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.record.event_id, second.record.event_id);
        assert_eq!(again.delivery_count, 2);
        assert_eq!(adapter.committed_offset("g", "orders").await, Some(1));
    }

    #[tokio::test]
    async fn groups_have_independent_cursors() {
        let adapter = connected().await;
        adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap();

        let a = adapter.subscribe(&topics(&["orders"]), "a").await.unwrap();
        let b = adapter.subscribe(&topics(&["orders"]), "b").await.unwrap();

        assert!(adapter.consume(&a).next().await.unwrap().is_ok());
        assert!(adapter.consume(&b).next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn stream_reports_disconnect_and_ends_after_unsubscribe() {
        let adapter = connected().await;
        let sub = adapter.subscribe(&topics(&["orders"]), "g").await.unwrap();
        let mut stream = adapter.consume(&sub);

        adapter.simulate_outage().await;
        assert!(matches!(stream.next().await, Some(Err(AdapterError::Connection(_)))));
        assert!(adapter.connect().await.is_err());

        adapter.restore();
        adapter.connect().await.unwrap();
        // Memberships were dropped with the connection.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn commit_beyond_end_is_invalid() {
        let adapter = connected().await;
        adapter.publish("orders", &EventRecord::test_fixture()).await.unwrap();
        let err = adapter
            .commit_offset("g", "orders", 0, Offset::Sequence(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOffset { .. }));
    }

    #[tokio::test]
    async fn topics_can_be_created_listed_and_deleted() {
        let adapter = connected().await;
        adapter.create_topic("b").await.unwrap();
        adapter.create_topic("a").await.unwrap();
        assert_eq!(adapter.list_topics().await.unwrap(), topics(&["a", "b"]));

        adapter.delete_topic("a").await.unwrap();
        assert_eq!(adapter.list_topics().await.unwrap(), topics(&["b"]));
        assert!(adapter.delete_topic("a").await.is_err());
    }
}
