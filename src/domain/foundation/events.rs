//! Event model - identifiers, metadata, and the record that travels the bus.
//!
//! This module provides the immutable value types shared by every component:
//! - `EventId` - Unique identifier used by consumers for deduplication
//! - `EventMetadata` - Correlation, tenancy, and schema context
//! - `PartitionKey` - Routing key derived from tenant and aggregate
//! - `EventRecord` - The event as published and consumed

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

use super::{Timestamp, ValidationError};

/// Longest identifier accepted in metadata fields.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Unique identifier for events (used for deduplication).
///
/// Uses a String internally to allow for various ID formats (UUID, ULID,
/// outbox row ids) while maintaining serializability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a new random EventId using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates an EventId from an existing string.
    ///
    /// No validation is performed - any string is accepted.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata for tracing, tenancy, and schema selection.
///
/// `correlation_id` and `tenant_id` cannot be changed once set; they are
/// only readable through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    correlation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,

    tenant_id: String,

    occurred_at: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_version: Option<u32>,

    /// ID of the aggregate that emitted this event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,

    /// Type of aggregate (e.g., "invoice").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,

    /// Distributed tracing identifier supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl EventMetadata {
    /// Creates metadata for a tenant with a fresh correlation id.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            tenant_id: tenant_id.into(),
            occurred_at: Timestamp::now(),
            schema_subject: None,
            schema_version: None,
            aggregate_id: None,
            aggregate_type: None,
            trace_id: None,
        }
    }

    /// Creates metadata whose tenant is supplied later by a tenant context.
    pub fn unscoped() -> Self {
        Self::new(String::new())
    }

    /// Replace the generated correlation id with a caller-supplied one.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Add causation ID (ID of event that caused this one).
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Attach the aggregate that produced the event.
    pub fn with_aggregate(mut self, aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Add trace ID for distributed tracing.
    pub fn with_trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Pin the schema subject and version the payload conforms to.
    pub fn with_schema(mut self, subject: impl Into<String>, version: Option<u32>) -> Self {
        self.schema_subject = Some(subject.into());
        self.schema_version = version;
        self
    }

    /// Override when the event occurred.
    pub fn with_occurred_at(mut self, occurred_at: Timestamp) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn occurred_at(&self) -> Timestamp {
        self.occurred_at
    }

    pub fn schema_subject(&self) -> Option<&str> {
        self.schema_subject.as_deref()
    }

    pub fn schema_version(&self) -> Option<u32> {
        self.schema_version
    }

    /// Supply the tenant for metadata created without one.
    ///
    /// Fails if a tenant is already set.
    pub fn assign_tenant(&mut self, tenant_id: impl Into<String>) -> Result<(), ValidationError> {
        if !self.tenant_id.is_empty() {
            return Err(ValidationError::invalid_format(
                "tenant_id",
                "tenant is already set and cannot change",
            ));
        }
        self.tenant_id = tenant_id.into();
        Ok(())
    }

    pub(crate) fn set_occurred_at(&mut self, occurred_at: Timestamp) {
        self.occurred_at = occurred_at;
    }

    pub(crate) fn set_schema(&mut self, subject: String, version: u32) {
        self.schema_subject = Some(subject);
        self.schema_version = Some(version);
    }

    /// Checks that identifiers are present and well-formed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("tenant_id", &self.tenant_id)?;
        validate_identifier("correlation_id", &self.correlation_id)?;
        if let Some(causation_id) = &self.causation_id {
            validate_identifier("causation_id", causation_id)?;
        }
        if let Some(subject) = &self.schema_subject {
            validate_identifier("schema_subject", subject)?;
        }
        if let Some(version) = self.schema_version {
            if version == 0 {
                return Err(ValidationError::out_of_range(
                    "schema_version",
                    1,
                    u32::MAX as i64,
                    0,
                ));
            }
        }
        if let Some(aggregate_id) = &self.aggregate_id {
            validate_identifier("aggregate_id", aggregate_id)?;
        }
        Ok(())
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::empty_field(field));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::invalid_format(
            field,
            format!("longer than {} characters", MAX_IDENTIFIER_LEN),
        ));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '@')))
    {
        return Err(ValidationError::invalid_format(
            field,
            format!("unexpected character {:?}", bad),
        ));
    }
    Ok(())
}

/// Routing key that pins all events of one aggregate to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Derive `tenant:aggregate`, or the tenant alone when no aggregate is known.
    pub fn derive(tenant_id: &str, aggregate_id: Option<&str>) -> Self {
        match aggregate_id {
            Some(aggregate) if !aggregate.is_empty() => Self(format!("{}:{}", tenant_id, aggregate)),
            _ => Self(tenant_id.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event as it travels through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Globally unique; consumers deduplicate on it.
    pub event_id: EventId,

    /// Event type, also the default topic (e.g., "invoice.created").
    pub event_type: String,

    pub metadata: EventMetadata,

    /// Opaque structured payload.
    pub data: JsonValue,

    pub partition_key: PartitionKey,
}

impl EventRecord {
    /// Creates a record with a fresh event id and a derived partition key.
    pub fn new(event_type: impl Into<String>, data: JsonValue, metadata: EventMetadata) -> Self {
        let partition_key =
            PartitionKey::derive(metadata.tenant_id(), metadata.aggregate_id.as_deref());
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            metadata,
            data,
            partition_key,
        }
    }

    /// Use a caller-chosen event id (e.g., an outbox row id).
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Recompute the partition key after metadata changed.
    pub(crate) fn rederive_partition_key(&mut self) {
        self.partition_key = PartitionKey::derive(
            self.metadata.tenant_id(),
            self.metadata.aggregate_id.as_deref(),
        );
    }

    /// Deserialize payload to a specific type.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

#[cfg(test)]
impl EventRecord {
    /// Creates a test fixture record for use in tests.
    pub fn test_fixture() -> Self {
        Self::new(
            "test.event",
            serde_json::json!({"test": "data"}),
            EventMetadata::new("tenant-1").with_aggregate("test", "agg-1"),
        )
    }
}
