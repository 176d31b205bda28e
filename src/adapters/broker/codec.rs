//! Wire envelope shared by the stream-log and partitioned-log adapters.
//!
//! ```json
//! {"event_id": "...", "event_type": "invoice.created",
//!  "occurred_at": "...", "tenant_id": "acme", "correlation_id": "...",
//!  "causation_id": "...", "schema_subject": "invoice", "schema_version": 2,
//!  "data": {...}, "partition_key": "acme:inv_1"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain::foundation::{EventId, EventMetadata, EventRecord, PartitionKey};

use super::AdapterError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub event_id: EventId,
    pub event_type: String,
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<PartitionKey>,
}

impl From<&EventRecord> for WireEnvelope {
    fn from(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id.clone(),
            event_type: record.event_type.clone(),
            metadata: record.metadata.clone(),
            data: record.data.clone(),
            partition_key: Some(record.partition_key.clone()),
        }
    }
}

impl From<WireEnvelope> for EventRecord {
    fn from(envelope: WireEnvelope) -> Self {
        let partition_key = envelope.partition_key.unwrap_or_else(|| {
            PartitionKey::derive(
                envelope.metadata.tenant_id(),
                envelope.metadata.aggregate_id.as_deref(),
            )
        });
        EventRecord {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            metadata: envelope.metadata,
            data: envelope.data,
            partition_key,
        }
    }
}

pub fn encode_record(record: &EventRecord) -> Result<String, AdapterError> {
    serde_json::to_string(&WireEnvelope::from(record)).map_err(|e| AdapterError::Codec(e.to_string()))
}

pub fn decode_record(payload: &str) -> Result<EventRecord, AdapterError> {
    let envelope: WireEnvelope =
        serde_json::from_str(payload).map_err(|e| AdapterError::Codec(e.to_string()))?;
    Ok(envelope.into())
}
