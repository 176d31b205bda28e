//! Outbox rows and their lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::foundation::{
    EventId, EventMetadata, EventRecord, StateMachine, Timestamp, ValidationError,
};

use super::OutboxStatus;

/// Input for storing an event in the outbox.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub metadata: EventMetadata,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            metadata,
        }
    }
}

/// A row in the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub tenant_id: String,
    pub metadata: EventMetadata,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub published_at: Option<Timestamp>,
    pub lease_expires_at: Option<Timestamp>,
    pub processor_id: Option<String>,
    pub last_error: Option<String>,
    /// A PENDING row is not claimable before this instant.
    pub next_attempt_at: Timestamp,
}

impl OutboxEvent {
    /// Build a PENDING row, validating identifiers and metadata.
    pub fn pending(new: NewOutboxEvent) -> Result<Self, ValidationError> {
        if new.aggregate_type.trim().is_empty() {
            return Err(ValidationError::empty_field("aggregate_type"));
        }
        if new.aggregate_id.trim().is_empty() {
            return Err(ValidationError::empty_field("aggregate_id"));
        }
        if new.event_type.trim().is_empty() {
            return Err(ValidationError::empty_field("event_type"));
        }
        new.metadata.validate()?;

        let now = Timestamp::now();
        let metadata = new
            .metadata
            .with_aggregate(new.aggregate_type.clone(), new.aggregate_id.clone());
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: metadata.tenant_id().to_string(),
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            event_type: new.event_type,
            payload: new.payload,
            metadata,
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: now,
            published_at: None,
            lease_expires_at: None,
            processor_id: None,
            last_error: None,
            next_attempt_at: now,
        })
    }

    /// PENDING and due, or PROCESSING with an expired lease.
    pub fn is_claimable(&self, now: Timestamp) -> bool {
        match self.status {
            OutboxStatus::Pending => !self.next_attempt_at.is_after(&now),
            OutboxStatus::Processing => self.lease_expired(now),
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: Timestamp) -> bool {
        self.status == OutboxStatus::Processing
            && self.lease_expires_at.map_or(true, |lease| lease.is_before(&now))
    }

    /// Whether `processor_id` currently holds this row's claim.
    pub fn is_claimed_by(&self, processor_id: &str) -> bool {
        self.status == OutboxStatus::Processing && self.processor_id.as_deref() == Some(processor_id)
    }

    /// Claim the row for a processor until `now + lease`.
    pub fn claim(&mut self, processor_id: &str, lease: Duration, now: Timestamp) -> Result<(), ValidationError> {
        if !self.is_claimable(now) {
            return Err(ValidationError::invalid_format(
                "status",
                format!("row in status {} is not claimable", self.status),
            ));
        }
        // An expired PROCESSING row is re-leased in place.
        if self.status == OutboxStatus::Pending {
            self.status = self.status.transition_to(OutboxStatus::Processing)?;
        }
        self.processor_id = Some(processor_id.to_string());
        self.lease_expires_at = Some(now.plus(lease));
        Ok(())
    }

    pub fn mark_published(&mut self, now: Timestamp) -> Result<(), ValidationError> {
        self.status = self.status.transition_to(OutboxStatus::Published)?;
        self.published_at = Some(now);
        self.clear_claim();
        Ok(())
    }

    /// Count a failed attempt and return the row to PENDING until `next_attempt_at`.
    pub fn schedule_retry(&mut self, error: impl Into<String>, next_attempt_at: Timestamp) -> Result<(), ValidationError> {
        self.status = self.status.transition_to(OutboxStatus::Pending)?;
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.next_attempt_at = next_attempt_at;
        self.clear_claim();
        Ok(())
    }

    /// Count the final failed attempt and park the row.
    pub fn mark_dead(&mut self, error: impl Into<String>) -> Result<(), ValidationError> {
        self.status = self.status.transition_to(OutboxStatus::Dead)?;
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.clear_claim();
        Ok(())
    }

    /// Park the row after an error that no retry can fix.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), ValidationError> {
        self.status = self.status.transition_to(OutboxStatus::Failed)?;
        self.last_error = Some(error.into());
        self.clear_claim();
        Ok(())
    }

    /// Give the claim back without counting an attempt.
    pub fn release(&mut self) -> Result<(), ValidationError> {
        self.status = self.status.transition_to(OutboxStatus::Pending)?;
        self.clear_claim();
        Ok(())
    }

    /// The record published for this row; its event id is the row id.
    pub fn to_event_record(&self) -> EventRecord {
        EventRecord::new(self.event_type.clone(), self.payload.clone(), self.metadata.clone())
            .with_event_id(EventId::from(self.id))
    }

    fn clear_claim(&mut self) {
        self.processor_id = None;
        self.lease_expires_at = None;
    }
}
