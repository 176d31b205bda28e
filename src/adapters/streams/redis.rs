//! Redis Streams implementation of [`StreamStore`].
//!
//! One multiplexed connection is shared by every clone; each call clones the
//! handle, which is cheap and keeps commands pipelined on one socket.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;

use crate::domain::foundation::StreamEntryId;
use crate::ports::{StreamEntry, StreamStore, StreamStoreError};

/// Field holding the encoded envelope in every entry.
const ENVELOPE_FIELD: &str = "envelope";

/// Throwaway group used to create an empty stream.
const INIT_GROUP: &str = "__eventline_init";

/// How many pending entries to inspect per reclaim pass, per entry requested.
const PENDING_SCAN_FACTOR: usize = 4;

#[derive(Clone)]
pub struct RedisStreamStore {
    conn: MultiplexedConnection,
}

impl RedisStreamStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Open a multiplexed connection, failing after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StreamStoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| StreamStoreError::Unavailable(format!("connect timed out after {:?}", timeout)))?
            .map_err(unavailable)?;
        tracing::info!("Connected to Redis stream store");
        Ok(Self::new(conn))
    }
}

impl std::fmt::Debug for RedisStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamStore").finish_non_exhaustive()
    }
}

fn unavailable(e: redis::RedisError) -> StreamStoreError {
    StreamStoreError::Unavailable(e.to_string())
}

fn group_error(stream: &str, group: &str, e: redis::RedisError) -> StreamStoreError {
    if e.code() == Some("NOGROUP") {
        StreamStoreError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        unavailable(e)
    }
}

fn parse_id(raw: &str) -> Result<StreamEntryId, StreamStoreError> {
    raw.parse()
        .map_err(|_| StreamStoreError::Protocol(format!("invalid stream id '{}'", raw)))
}

fn to_entry(entry: &StreamId, delivery_count: u32) -> Result<StreamEntry, StreamStoreError> {
    let payload: String = entry.get(ENVELOPE_FIELD).ok_or_else(|| {
        StreamStoreError::Protocol(format!("entry {} has no '{}' field", entry.id, ENVELOPE_FIELD))
    })?;
    Ok(StreamEntry {
        id: parse_id(&entry.id)?,
        payload,
        delivery_count,
    })
}

/// Separate usable entries from malformed ones, returning the raw ids of the
/// latter so they can be acknowledged.
fn split_entries<'a>(
    entries: impl IntoIterator<Item = (&'a StreamId, u32)>,
) -> (Vec<StreamEntry>, Vec<String>) {
    let mut usable = Vec::new();
    let mut malformed = Vec::new();
    for (entry, delivery_count) in entries {
        match to_entry(entry, delivery_count) {
            Ok(parsed) => usable.push(parsed),
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "Skipping malformed stream entry");
                malformed.push(entry.id.clone());
            }
        }
    }
    (usable, malformed)
}

impl RedisStreamStore {
    /// Acknowledge malformed entries so they leave the pending list for good.
    async fn ack_malformed(&self, stream: &str, group: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut conn = self.conn.clone();
        if let Err(e) = conn.xack::<_, _, _, i64>(stream, group, ids).await {
            tracing::warn!(stream, group, count = ids.len(), error = %e, "Failed to acknowledge malformed stream entries");
        }
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn ping(&self) -> Result<(), StreamStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<StreamEntryId, StreamStoreError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[(ENVELOPE_FIELD, payload)])
            .await
            .map_err(unavailable)?;
        parse_id(&id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamStoreError> {
        let mut conn = self.conn.clone();
        match conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0").await {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamStoreError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default().group(group, consumer).count(count);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|e| group_error(stream, group, e))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        let (entries, malformed) =
            split_entries(reply.keys.iter().flat_map(|key| key.ids.iter()).map(|entry| (entry, 1)));
        self.ack_malformed(stream, group, &malformed).await;
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamEntryId) -> Result<(), StreamStoreError> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, i64>(stream, group, &[id.to_string()])
            .await
            .map_err(|e| group_error(stream, group, e))?;
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
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as usize;

        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count.max(1) * PENDING_SCAN_FACTOR)
            .await
            .map_err(|e| group_error(stream, group, e))?;

        let idle: Vec<(String, u32)> = pending
            .ids
            .iter()
            .filter(|p| p.consumer != consumer && p.last_delivered_ms >= min_idle_ms)
            .take(count)
            .map(|p| (p.id.clone(), p.times_delivered as u32))
            .collect();
        if idle.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = idle.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await
            .map_err(|e| group_error(stream, group, e))?;

        // XCLAIM bumps the delivery counter by one.
        let (entries, malformed) = split_entries(claimed.ids.iter().map(|entry| {
            let previous = idle
                .iter()
                .find(|(id, _)| *id == entry.id)
                .map_or(1, |(_, times)| *times);
            (entry, previous + 1)
        }));
        self.ack_malformed(stream, group, &malformed).await;
        Ok(entries)
    }

    async fn create_stream(&self, stream: &str) -> Result<(), StreamStoreError> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, INIT_GROUP, "$")
            .await
        {
            Ok(()) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(unavailable(e)),
        }
        conn.xgroup_destroy::<_, _, i64>(stream, INIT_GROUP)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, StreamStoreError> {
        let mut conn = self.conn.clone();
        conn.exists(stream).await.map_err(unavailable)
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool, StreamStoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(stream).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn list_streams(&self) -> Result<Vec<String>, StreamStoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut names = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("TYPE")
                .arg("stream")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            names.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Commands against a live server are covered by the stream-log adapter
    // tests through InMemoryStreamStore; these cover reply parsing only.

    #[test]
    fn entry_ids_parse_from_redis_format() {
        assert_eq!(parse_id("1700000000000-3").unwrap(), StreamEntryId::new(1_700_000_000_000, 3));
        assert!(matches!(parse_id("garbage"), Err(StreamStoreError::Protocol(_))));
    }

    #[test]
    fn entries_without_envelope_field_are_protocol_errors() {
        let entry = StreamId {
            id: "1-0".to_string(),
            map: Default::default(),
        };
        assert!(matches!(to_entry(&entry, 1), Err(StreamStoreError::Protocol(_))));
    }

    #[test]
    fn malformed_entries_are_split_from_the_batch() {
        let mut map = std::collections::HashMap::new();
        map.insert(ENVELOPE_FIELD.to_string(), redis::Value::Data(b"{}".to_vec()));
        let good = StreamId { id: "7-0".to_string(), map };
        let mut other = std::collections::HashMap::new();
        other.insert("other".to_string(), redis::Value::Data(b"x".to_vec()));
        let missing_field = StreamId {
            id: "7-1".to_string(),
            map: other,
        };

        let (usable, malformed) = split_entries([(&missing_field, 2), (&good, 1)]);
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].id, StreamEntryId::new(7, 0));
        assert_eq!(malformed, vec!["7-1".to_string()]);
    }

    #[test]
    fn entries_carry_payload_and_delivery_count() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            ENVELOPE_FIELD.to_string(),
            redis::Value::Data(b"{\"event_id\":\"e\"}".to_vec()),
        );
        let entry = StreamId { id: "5-1".to_string(), map };

        let parsed = to_entry(&entry, 3).unwrap();
        assert_eq!(parsed.id, StreamEntryId::new(5, 1));
        assert_eq!(parsed.payload, "{\"event_id\":\"e\"}");
        assert_eq!(parsed.delivery_count, 3);
    }
}
