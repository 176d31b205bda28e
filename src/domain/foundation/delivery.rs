//! Delivery results - what adapters hand back after publishing and consuming.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{EventRecord, Timestamp, ValidationError};

/// Identifier of an entry in an append-only stream: `<millis>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamEntryId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub const ZERO: StreamEntryId = StreamEntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamEntryId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::invalid_format("stream_entry_id", format!("'{}' is not <millis>-<seq>", s));
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Adapter-specific position of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Offset {
    /// Position in an ordered log or partition.
    Sequence(u64),
    /// Entry id in an append-only stream.
    Entry(StreamEntryId),
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Sequence(n) => write!(f, "{}", n),
            Offset::Entry(id) => write!(f, "{}", id),
        }
    }
}

/// Everything an adapter needs to acknowledge a consumed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckToken {
    pub topic: String,
    pub partition: u32,
    pub offset: Offset,
}

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub record: EventRecord,
    /// How many times this record has been delivered to the group, including this one.
    pub delivery_count: u32,
    pub ack: AckToken,
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub topic: String,
    pub partition: Option<u32>,
    pub offset: Option<Offset>,
    pub timestamp: Timestamp,
}

impl PublishResult {
    pub fn accepted(topic: impl Into<String>, partition: u32, offset: Offset) -> Self {
        Self {
            success: true,
            topic: topic.into(),
            partition: Some(partition),
            offset: Some(offset),
            timestamp: Timestamp::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_entry_id_round_trips_through_text() {
        let id = StreamEntryId::new(1700000000000, 3);
        let parsed: StreamEntryId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn stream_entry_id_rejects_garbage() {
        assert!("1700000000000".parse::<StreamEntryId>().is_err());
        assert!("abc-1".parse::<StreamEntryId>().is_err());
    }

    #[test]
    fn stream_entry_ids_order_by_time_then_sequence() {
        assert!(StreamEntryId::new(1, 5) < StreamEntryId::new(2, 0));
        assert!(StreamEntryId::new(2, 0) < StreamEntryId::new(2, 1));
    }

    #[test]
    fn offset_displays_adapter_specific_form() {
        assert_eq!(Offset::Sequence(42).to_string(), "42");
        assert_eq!(Offset::Entry(StreamEntryId::new(10, 2)).to_string(), "10-2");
    }
}
