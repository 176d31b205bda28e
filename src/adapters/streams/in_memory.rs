//! In-memory stream store with Redis Streams consumer-group semantics.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::foundation::{StreamEntryId, Timestamp};
use crate::ports::{StreamEntry, StreamStore, StreamStoreError};

#[derive(Default)]
pub struct InMemoryStreamStore {
    streams: Mutex<HashMap<String, StreamState>>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(StreamEntryId, String)>,
    groups: HashMap<String, GroupState>,
    last_id: Option<StreamEntryId>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: Option<StreamEntryId>,
    pending: BTreeMap<StreamEntryId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    count: u32,
}

impl StreamState {
    fn next_id(&mut self) -> StreamEntryId {
        let millis = Timestamp::now().as_unix_millis().max(0) as u64;
        let id = match self.last_id {
            Some(last) if last.millis >= millis => StreamEntryId::new(last.millis, last.seq + 1),
            _ => StreamEntryId::new(millis, 0),
        };
        self.last_id = Some(id);
        id
    }

    fn payload(&self, id: StreamEntryId) -> Option<&String> {
        self.entries
            .binary_search_by_key(&id, |(entry_id, _)| *entry_id)
            .ok()
            .map(|index| &self.entries[index].1)
    }
}

fn group_mut<'a>(
    streams: &'a mut HashMap<String, StreamState>,
    stream: &str,
    group: &str,
) -> Result<(&'a mut GroupState, &'a Vec<(StreamEntryId, String)>), StreamStoreError> {
    let state = streams
        .get_mut(stream)
        .ok_or_else(|| StreamStoreError::NoSuchStream(stream.to_string()))?;
    let group_state = state
        .groups
        .get_mut(group)
        .ok_or_else(|| StreamStoreError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
    Ok((group_state, &state.entries))
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries delivered to `group` but not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Pending entries currently owned by one consumer.
    pub async fn pending_for(&self, stream: &str, group: &str, consumer: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.values().filter(|p| p.consumer == consumer).count())
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn ping(&self) -> Result<(), StreamStoreError> {
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<StreamEntryId, StreamStoreError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let id = state.next_id();
        state.entries.push((id, payload.to_string()));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamStoreError> {
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamStoreError> {
        let mut streams = self.streams.lock().await;
        let (group_state, entries) = group_mut(&mut streams, stream, group)?;
        let now = Instant::now();

        let fresh: Vec<StreamEntry> = entries
            .iter()
            .filter(|(id, _)| group_state.last_delivered.map_or(true, |last| *id > last))
            .take(count)
            .map(|(id, payload)| StreamEntry {
                id: *id,
                payload: payload.clone(),
                delivery_count: 1,
            })
            .collect();

        for entry in &fresh {
            group_state.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    count: 1,
                },
            );
            group_state.last_delivered = Some(entry.id);
        }
        Ok(fresh)
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamEntryId) -> Result<(), StreamStoreError> {
        let mut streams = self.streams.lock().await;
        let (group_state, _) = group_mut(&mut streams, stream, group)?;
        group_state.pending.remove(&id);
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamStoreError> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamStoreError::NoSuchStream(stream.to_string()))?;
        let now = Instant::now();

        let idle: Vec<StreamEntryId> = state
            .groups
            .get(group)
            .ok_or_else(|| StreamStoreError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut claimed = Vec::with_capacity(idle.len());
        for id in idle {
            let payload = state.payload(id).cloned();
            let Some(group_state) = state.groups.get_mut(group) else {
                break;
            };
            let Some(payload) = payload else {
                // Trimmed or deleted since delivery.
                group_state.pending.remove(&id);
                continue;
            };
            if let Some(pending) = group_state.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.count += 1;
                claimed.push(StreamEntry {
                    id,
                    payload,
                    delivery_count: pending.count,
                });
            }
        }
        Ok(claimed)
    }

    async fn create_stream(&self, stream: &str) -> Result<(), StreamStoreError> {
        self.streams
            .lock()
            .await
            .entry(stream.to_string())
            .or_default();
        Ok(())
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, StreamStoreError> {
        Ok(self.streams.lock().await.contains_key(stream))
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool, StreamStoreError> {
        Ok(self.streams.lock().await.remove(stream).is_some())
    }

    async fn list_streams(&self) -> Result<Vec<String>, StreamStoreError> {
        let mut names: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
