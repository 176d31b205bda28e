//! Partitioned-log adapter.
//!
//! Topics are split into a fixed number of partitions. A record's partition
//! is chosen from its partition key, so every event of one aggregate lands
//! in one partition and keeps its order. Each consumer group owns one
//! committed offset per partition, and partitions are spread across the
//! group's members; any join or leave triggers a rebalance that bumps the
//! group's generation. Consumers resume from committed offsets after a
//! rebalance, which is where at-least-once redelivery comes from.

use futures::stream;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::foundation::{AckToken, ConsumerRecord, EventId, EventRecord, Offset, PublishResult};

use super::codec::{decode_record, encode_record};
use super::{AdapterError, AdapterOptions, CommitMode, DeliveryMode, RecordStream, Subscription};

const NAME: &str = "partitioned_log";

type TopicPartition = (String, u32);

/// Stable partition for a key: first 8 bytes of its SHA-256, big-endian, modulo `partitions`.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

#[derive(Clone)]
pub struct PartitionedLogAdapter {
    inner: Arc<PartitionedInner>,
}

struct PartitionedInner {
    state: Mutex<LogState>,
    connected: AtomicBool,
    outage: AtomicBool,
    options: AdapterOptions,
}

#[derive(Default)]
struct LogState {
    topics: BTreeMap<String, TopicLog>,
    groups: HashMap<String, ConsumerGroup>,
    subscriptions: HashMap<Uuid, Subscription>,
}

struct TopicLog {
    partitions: Vec<PartitionLog>,
    next_unkeyed: u32,
}

#[derive(Default)]
struct PartitionLog {
    /// Encoded wire envelopes.
    messages: Vec<String>,
    /// Offset of each stored event id. Exactly-once mode only.
    ids: HashMap<EventId, u64>,
}

#[derive(Default)]
struct ConsumerGroup {
    generation: u64,
    /// Member name -> subscribed topics.
    members: BTreeMap<String, Vec<String>>,
    assignment: HashMap<String, Vec<TopicPartition>>,
    committed: HashMap<TopicPartition, u64>,
    pending: HashMap<TopicPartition, u64>,
    pending_count: usize,
    delivery_counts: HashMap<(String, u32, u64), u32>,
}

impl ConsumerGroup {
    fn advance(&mut self, tp: TopicPartition, next: u64) {
        let committed = self.committed.entry(tp.clone()).or_insert(0);
        *committed = (*committed).max(next);
        let committed = *committed;
        self.delivery_counts
            .retain(|(topic, partition, offset), _| !(*topic == tp.0 && *partition == tp.1 && *offset < committed));
    }

    fn flush(&mut self) {
        let pending: Vec<_> = self.pending.drain().collect();
        for (tp, next) in pending {
            self.advance(tp, next);
        }
        self.pending_count = 0;
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_count = 0;
    }
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| PartitionLog::default()).collect(),
            next_unkeyed: 0,
        }
    }

    fn route(&mut self, key: &str) -> u32 {
        let count = self.partitions.len() as u32;
        if key.is_empty() {
            let partition = self.next_unkeyed % count;
            self.next_unkeyed = self.next_unkeyed.wrapping_add(1);
            partition
        } else {
            partition_for_key(key, count)
        }
    }
}

enum Step {
    Gone,
    Idle,
    Record(ConsumerRecord),
}

/// A consumer's local read positions, valid for one group generation.
#[derive(Default)]
struct ReadCursor {
    generation: Option<u64>,
    positions: HashMap<TopicPartition, u64>,
    rotation: usize,
}

impl LogState {
    fn ensure_topic(&mut self, topic: &str, options: &AdapterOptions) -> Result<&mut TopicLog, AdapterError> {
        if !self.topics.contains_key(topic) {
            if !options.auto_create_topics {
                return Err(AdapterError::TopicNotFound(topic.to_string()));
            }
            self.topics
                .insert(topic.to_string(), TopicLog::new(options.default_partitions));
        }
        self.topics
            .get_mut(topic)
            .ok_or_else(|| AdapterError::TopicNotFound(topic.to_string()))
    }

    fn append(&mut self, topic: &str, record: &EventRecord, payload: String, options: &AdapterOptions) -> Result<PublishResult, AdapterError> {
        let log = self.ensure_topic(topic, options)?;
        let partition = log.route(record.partition_key.as_str());
        let part = &mut log.partitions[partition as usize];

        let idempotent = options.delivery_mode == DeliveryMode::ExactlyOnce;
        if idempotent {
            if let Some(offset) = part.ids.get(&record.event_id) {
                tracing::debug!(
                    topic,
                    partition,
                    event_id = %record.event_id,
                    "Duplicate publish ignored"
                );
                return Ok(PublishResult::accepted(topic, partition, Offset::Sequence(*offset)));
            }
        }

        let offset = part.messages.len() as u64;
        part.messages.push(payload);
        if idempotent {
            part.ids.insert(record.event_id.clone(), offset);
        }
        Ok(PublishResult::accepted(topic, partition, Offset::Sequence(offset)))
    }

    /// Reassign every partition the group reads: partition `p` of a topic
    /// goes to the `p % n`-th of the `n` members subscribed to it, in name order.
    fn rebalance(&mut self, group_name: &str) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        group.flush();

        let mut assignment: HashMap<String, Vec<TopicPartition>> = group
            .members
            .keys()
            .map(|member| (member.clone(), Vec::new()))
            .collect();
        let topics: BTreeSet<String> = group.members.values().flatten().cloned().collect();

        for topic in topics {
            let Some(log) = self.topics.get(&topic) else {
                continue;
            };
            let eligible: Vec<&String> = group
                .members
                .iter()
                .filter(|(_, subscribed)| subscribed.contains(&topic))
                .map(|(member, _)| member)
                .collect();
            for partition in 0..log.partitions.len() {
                let member = eligible[partition % eligible.len()];
                if let Some(owned) = assignment.get_mut(member) {
                    owned.push((topic.clone(), partition as u32));
                }
            }
        }

        group.assignment = assignment;
        group.generation += 1;
        tracing::debug!(
            consumer_group = group_name,
            generation = group.generation,
            members = group.members.len(),
            "Consumer group rebalanced"
        );
    }

    fn groups_reading(&self, topic: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, group)| group.members.values().any(|topics| topics.iter().any(|t| t == topic)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn poll(&mut self, subscription: &Subscription, cursor: &mut ReadCursor) -> Step {
        if !self.subscriptions.contains_key(&subscription.id) {
            return Step::Gone;
        }
        let Some(group) = self.groups.get_mut(&subscription.group) else {
            return Step::Idle;
        };
        let assigned = group
            .assignment
            .get(&subscription.consumer)
            .cloned()
            .unwrap_or_default();

        if cursor.generation != Some(group.generation) {
            cursor.positions = assigned
                .iter()
                .map(|tp| (tp.clone(), group.committed.get(tp).copied().unwrap_or(0)))
                .collect();
            cursor.generation = Some(group.generation);
        }

        let count = assigned.len();
        for i in 0..count {
            let (topic, partition) = &assigned[(cursor.rotation + i) % count];
            let Some(part) = self
                .topics
                .get(topic)
                .and_then(|log| log.partitions.get(*partition as usize))
            else {
                continue;
            };
            let position = cursor
                .positions
                .entry((topic.clone(), *partition))
                .or_insert(0);

            while let Some(payload) = part.messages.get(*position as usize) {
                let offset = *position;
                *position += 1;
                match decode_record(payload) {
                    Ok(record) => {
                        let delivery_count = group
                            .delivery_counts
                            .entry((topic.clone(), *partition, offset))
                            .or_insert(0);
                        *delivery_count += 1;
                        cursor.rotation = (cursor.rotation + i + 1) % count;
                        return Step::Record(ConsumerRecord {
                            topic: topic.clone(),
                            record,
                            delivery_count: *delivery_count,
                            ack: AckToken {
                                topic: topic.clone(),
                                partition: *partition,
                                offset: Offset::Sequence(offset),
                            },
                        });
                    }
                    Err(err) => {
                        tracing::error!(
                            topic = %topic,
                            partition = *partition,
                            offset,
                            error = %err,
                            "Skipping undecodable message"
                        );
                    }
                }
            }
        }
        Step::Idle
    }

    /// Remove every member. Pending batched commits are flushed or lost.
    fn drop_memberships(&mut self, flush: bool) {
        self.subscriptions.clear();
        for group in self.groups.values_mut() {
            if flush {
                group.flush();
            } else {
                group.discard_pending();
            }
            group.members.clear();
            group.assignment.clear();
            group.generation += 1;
        }
    }
}

impl PartitionedLogAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            inner: Arc::new(PartitionedInner {
                state: Mutex::new(LogState::default()),
                connected: AtomicBool::new(false),
                outage: AtomicBool::new(false),
                options,
            }),
        }
    }

    pub async fn connect(&self) -> Result<(), AdapterError> {
        if self.inner.outage.load(Ordering::SeqCst) {
            return Err(AdapterError::Connection("partitioned log unreachable".to_string()));
        }
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            tracing::info!(adapter = NAME, "Adapter connected");
        }
        Ok(())
    }

    /// Disconnect after flushing batched commits; every member leaves its group.
    pub async fn disconnect(&self) -> Result<(), AdapterError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.state.lock().await.drop_memberships(true);
        tracing::info!(adapter = NAME, "Adapter disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, topic: &str, record: &EventRecord) -> Result<PublishResult, AdapterError> {
        self.ensure_connected()?;
        let payload = encode_record(record)?;
        let mut state = self.inner.state.lock().await;
        state.append(topic, record, payload, &self.inner.options)
    }

    /// Append all records or none: everything is encoded before the log is touched.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: &[EventRecord],
    ) -> Result<Vec<PublishResult>, AdapterError> {
        self.ensure_connected()?;
        let payloads = records
            .iter()
            .map(encode_record)
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.inner.state.lock().await;
        state.ensure_topic(topic, &self.inner.options)?;
        records
            .iter()
            .zip(payloads)
            .map(|(record, payload)| state.append(topic, record, payload, &self.inner.options))
            .collect()
    }

    pub async fn subscribe(&self, topics: &[String], group: &str) -> Result<Subscription, AdapterError> {
        self.ensure_connected()?;
        let subscription = Subscription::new(topics, group);
        let mut state = self.inner.state.lock().await;
        for topic in topics {
            state.ensure_topic(topic, &self.inner.options)?;
        }
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .members
            .insert(subscription.consumer.clone(), topics.to_vec());
        state.subscriptions.insert(subscription.id, subscription.clone());
        state.rebalance(group);
        tracing::debug!(
            adapter = NAME,
            consumer_group = group,
            consumer = %subscription.consumer,
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Leave the group; its partitions move to the remaining members.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AdapterError> {
        let mut state = self.inner.state.lock().await;
        if state.subscriptions.remove(&subscription.id).is_none() {
            return Ok(());
        }
        if let Some(group) = state.groups.get_mut(&subscription.group) {
            group.members.remove(&subscription.consumer);
        }
        state.rebalance(&subscription.group);
        Ok(())
    }

    pub fn consume(&self, subscription: &Subscription) -> RecordStream {
        let adapter = self.clone();
        let subscription = subscription.clone();
        Box::pin(stream::unfold(
            (adapter, subscription, ReadCursor::default()),
            |(adapter, subscription, mut cursor)| async move {
                loop {
                    if !adapter.is_connected() {
                        let err = AdapterError::not_connected(NAME);
                        return Some((Err(err), (adapter, subscription, cursor)));
                    }
                    let step = adapter.inner.state.lock().await.poll(&subscription, &mut cursor);
                    match step {
                        Step::Gone => return None,
                        Step::Record(record) => return Some((Ok(record), (adapter, subscription, cursor))),
                        Step::Idle => tokio::time::sleep(adapter.inner.options.poll_interval).await,
                    }
                }
            },
        ))
    }

    /// Commit `offset` as processed; the group resumes after it.
    ///
    /// In batched mode the commit is held until the batch fills, the member
    /// leaves, or [`flush_commits`](Self::flush_commits) is called.
    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: Offset,
    ) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let Offset::Sequence(position) = offset else {
            return Err(invalid_offset(topic, offset, "expected a sequence offset"));
        };

        let mut state = self.inner.state.lock().await;
        let log = state
            .topics
            .get(topic)
            .ok_or_else(|| AdapterError::TopicNotFound(topic.to_string()))?;
        let part = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| invalid_offset(topic, offset, "no such partition"))?;
        if position >= part.messages.len() as u64 {
            return Err(invalid_offset(topic, offset, "beyond end of partition"));
        }

        let group = state.groups.entry(group.to_string()).or_default();
        let tp = (topic.to_string(), partition);
        match self.inner.options.commit_mode {
            CommitMode::PerMessage => group.advance(tp, position + 1),
            CommitMode::Batched(size) => {
                let pending = group.pending.entry(tp).or_insert(0);
                *pending = (*pending).max(position + 1);
                group.pending_count += 1;
                if group.pending_count >= size.max(1) {
                    group.flush();
                }
            }
        }
        Ok(())
    }

    /// Make every held batched commit of `group` durable.
    pub async fn flush_commits(&self, group: &str) {
        if let Some(group) = self.inner.state.lock().await.groups.get_mut(group) {
            group.flush();
        }
    }

    /// Create a topic; a no-op if it already exists.
    pub async fn create_topic(&self, name: &str, partitions: Option<u32>) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let mut state = self.inner.state.lock().await;
        if state.topics.contains_key(name) {
            return Ok(());
        }
        let partitions = partitions.unwrap_or(self.inner.options.default_partitions);
        state.topics.insert(name.to_string(), TopicLog::new(partitions));
        for group in state.groups_reading(name) {
            state.rebalance(&group);
        }
        tracing::info!(topic = name, partitions, "Topic created");
        Ok(())
    }

    pub async fn delete_topic(&self, name: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let mut state = self.inner.state.lock().await;
        if state.topics.remove(name).is_none() {
            return Err(AdapterError::TopicNotFound(name.to_string()));
        }
        for group in state.groups.values_mut() {
            group.committed.retain(|(topic, _), _| topic != name);
            group.pending.retain(|(topic, _), _| topic != name);
            group.delivery_counts.retain(|(topic, _, _), _| topic != name);
        }
        for group in state.groups_reading(name) {
            state.rebalance(&group);
        }
        Ok(())
    }

    pub async fn list_topics(&self) -> Result<Vec<String>, AdapterError> {
        self.ensure_connected()?;
        Ok(self.inner.state.lock().await.topics.keys().cloned().collect())
    }

    /// Drop the connection without flushing and refuse reconnects until
    /// [`restore`](Self::restore).
    pub async fn simulate_outage(&self) {
        self.inner.outage.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.state.lock().await.drop_memberships(false);
        tracing::warn!(adapter = NAME, "Simulated outage");
    }

    pub fn restore(&self) {
        self.inner.outage.store(false, Ordering::SeqCst);
    }

    /// Partitions currently assigned to a subscription, sorted.
    pub async fn assignment(&self, subscription: &Subscription) -> Vec<(String, u32)> {
        let state = self.inner.state.lock().await;
        let mut assigned = state
            .groups
            .get(&subscription.group)
            .and_then(|group| group.assignment.get(&subscription.consumer))
            .cloned()
            .unwrap_or_default();
        assigned.sort();
        assigned
    }

    pub async fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .state
            .lock()
            .await
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    pub async fn partition_count(&self, topic: &str) -> Option<u32> {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map(|log| log.partitions.len() as u32)
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::not_connected(NAME))
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
