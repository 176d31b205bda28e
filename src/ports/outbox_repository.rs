//! Outbox ports - Transactional event persistence and dispatcher storage.
//!
//! This pair of ports implements the Transactional Outbox Pattern, which
//! ensures events are persisted in the same transaction as business
//! changes, guaranteeing no events are lost even if the process crashes.
//!
//! ## Pattern Overview
//!
//! 1. The caller opens a transaction, writes its business rows AND calls
//!    `OutboxTransaction::insert_outbox_event` on the same transaction
//! 2. The dispatcher claims due rows through `OutboxRepository::claim_batch`
//! 3. Each claimed row is published through the event bus and then marked
//!    PUBLISHED, scheduled for retry, or parked as DEAD/FAILED
//!
//! Claim exclusivity is a property of the storage (row locks that skip
//! locked rows), never of in-process locks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::foundation::Timestamp;
use crate::domain::outbox::OutboxEvent;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    /// The row is not (or no longer) claimed by the calling processor.
    #[error("outbox row {0} is not claimed by this processor")]
    ClaimConflict(Uuid),

    #[error("outbox row {id} cannot change state: {reason}")]
    InvalidTransition { id: Uuid, reason: String },

    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub published: u64,
    pub failed: u64,
    pub dead: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.published + self.failed + self.dead
    }
}

/// A caller-owned transaction the outbox row is written into.
///
/// # Example
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// sqlx::query("INSERT INTO invoices ...").execute(&mut *tx).await?;
/// outbox.store_event(new_event, &mut tx).await?;
/// tx.commit().await?;
/// ```
#[async_trait]
pub trait OutboxTransaction: Send {
    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<(), OutboxError>;
}

/// Dispatcher-side access to outbox rows.
///
/// Every mutation after the claim is conditional on `processor_id` still
/// holding the claim and fails with `OutboxError::ClaimConflict` otherwise.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Atomically claim up to `limit` claimable rows, oldest first.
    ///
    /// Claimable rows are PENDING rows whose `next_attempt_at` has passed
    /// and PROCESSING rows whose lease expired.
    async fn claim_batch(
        &self,
        processor_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn mark_published(&self, id: Uuid, processor_id: &str) -> Result<(), OutboxError>;

    /// Count a failed attempt and return the row to PENDING.
    async fn schedule_retry(
        &self,
        id: Uuid,
        processor_id: &str,
        error: &str,
        next_attempt_at: Timestamp,
    ) -> Result<(), OutboxError>;

    /// Count the final failed attempt and park the row as DEAD.
    async fn mark_dead(&self, id: Uuid, processor_id: &str, error: &str) -> Result<(), OutboxError>;

    /// Park the row as FAILED after a non-retryable error.
    async fn mark_failed(&self, id: Uuid, processor_id: &str, error: &str) -> Result<(), OutboxError>;

    /// Return a claimed row to PENDING without counting an attempt.
    async fn release(&self, id: Uuid, processor_id: &str) -> Result<(), OutboxError>;

    /// Return PROCESSING rows with expired leases to PENDING. Returns the count.
    async fn reset_stuck(&self) -> Result<u64, OutboxError>;

    /// Delete PUBLISHED rows published before `cutoff`. Returns the count.
    async fn delete_published_before(&self, cutoff: Timestamp) -> Result<u64, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;

    async fn find(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError>;
}
