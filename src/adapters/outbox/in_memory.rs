//! In-memory transactional outbox store for tests.
//!
//! A transaction stages its outbox rows and business rows locally; nothing
//! is visible to the dispatcher until `commit`. Dropping a transaction
//! without committing discards everything it staged, exactly like a
//! database rollback.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::foundation::{Timestamp, ValidationError};
use crate::domain::outbox::{OutboxEvent, OutboxStatus};
use crate::ports::{OutboxError, OutboxRepository, OutboxStats, OutboxTransaction};

#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<Uuid, OutboxEvent>,
    business_rows: Vec<(String, JsonValue)>,
}

impl StoreState {
    fn claimed_row(&mut self, id: Uuid, processor_id: &str) -> Result<&mut OutboxEvent, OutboxError> {
        let row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| OutboxError::Storage(format!("outbox row {} not found", id)))?;
        if !row.is_claimed_by(processor_id) {
            return Err(OutboxError::ClaimConflict(id));
        }
        Ok(row)
    }
}

fn transition_error(id: Uuid) -> impl Fn(ValidationError) -> OutboxError {
    move |e| OutboxError::InvalidTransition {
        id,
        reason: e.to_string(),
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            store: self.clone(),
            events: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Committed business rows of one table.
    pub async fn business_rows(&self, table: &str) -> Vec<JsonValue> {
        self.state
            .lock()
            .await
            .business_rows
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, row)| row.clone())
            .collect()
    }

    /// All committed outbox rows, oldest first.
    pub async fn rows(&self) -> Vec<OutboxEvent> {
        let mut rows: Vec<_> = self.state.lock().await.rows.values().cloned().collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        rows
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// A unit of work against [`InMemoryOutboxStore`].
pub struct InMemoryTransaction {
    store: InMemoryOutboxStore,
    events: Vec<OutboxEvent>,
    rows: Vec<(String, JsonValue)>,
}

impl InMemoryTransaction {
    /// Stage an unrelated business write.
    pub fn insert_row(&mut self, table: impl Into<String>, row: JsonValue) {
        self.rows.push((table.into(), row));
    }

    pub async fn commit(mut self) -> Result<(), OutboxError> {
        let events = std::mem::take(&mut self.events);
        let rows = std::mem::take(&mut self.rows);
        let mut state = self.store.state.lock().await;
        if let Some(duplicate) = events.iter().find(|e| state.rows.contains_key(&e.id)) {
            return Err(OutboxError::Storage(format!(
                "duplicate outbox row id {}",
                duplicate.id
            )));
        }
        for event in events {
            state.rows.insert(event.id, event);
        }
        state.business_rows.extend(rows);
        Ok(())
    }

    /// Discard everything staged; same as dropping the transaction.
    pub fn rollback(mut self) {
        self.events.clear();
        self.rows.clear();
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.events.is_empty() || !self.rows.is_empty() {
            tracing::debug!(
                outbox_rows = self.events.len(),
                business_rows = self.rows.len(),
                "Transaction dropped without commit, staged writes discarded"
            );
        }
    }
}

#[async_trait]
impl OutboxTransaction for InMemoryTransaction {
    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<(), OutboxError> {
        self.events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxStore {
    async fn claim_batch(
        &self,
        processor_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let now = Timestamp::now();
        let mut state = self.state.lock().await;

        let mut due: Vec<(Timestamp, Uuid)> = state
            .rows
            .values()
            .filter(|row| row.is_claimable(now))
            .map(|row| (row.created_at, row.id))
            .collect();
        due.sort();

        let mut claimed = Vec::with_capacity(limit.min(due.len()));
        for (_, id) in due.into_iter().take(limit) {
            if let Some(row) = state.rows.get_mut(&id) {
                row.claim(processor_id, lease, now).map_err(transition_error(id))?;
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, processor_id: &str) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        state
            .claimed_row(id, processor_id)?
            .mark_published(Timestamp::now())
            .map_err(transition_error(id))
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        processor_id: &str,
        error: &str,
        next_attempt_at: Timestamp,
    ) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        state
            .claimed_row(id, processor_id)?
            .schedule_retry(error, next_attempt_at)
            .map_err(transition_error(id))
    }

    async fn mark_dead(&self, id: Uuid, processor_id: &str, error: &str) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        state
            .claimed_row(id, processor_id)?
            .mark_dead(error)
            .map_err(transition_error(id))
    }

    async fn mark_failed(&self, id: Uuid, processor_id: &str, error: &str) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        state
            .claimed_row(id, processor_id)?
            .mark_failed(error)
            .map_err(transition_error(id))
    }

    async fn release(&self, id: Uuid, processor_id: &str) -> Result<(), OutboxError> {
        let mut state = self.state.lock().await;
        state
            .claimed_row(id, processor_id)?
            .release()
            .map_err(transition_error(id))
    }

    async fn reset_stuck(&self) -> Result<u64, OutboxError> {
        let now = Timestamp::now();
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for row in state.rows.values_mut() {
            if row.lease_expired(now) {
                row.release().map_err(transition_error(row.id))?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn delete_published_before(&self, cutoff: Timestamp) -> Result<u64, OutboxError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|_, row| {
            !(row.status == OutboxStatus::Published
                && row.published_at.map_or(false, |at| at.is_before(&cutoff)))
        });
        Ok((before - state.rows.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let state = self.state.lock().await;
        let mut stats = OutboxStats::default();
        for row in state.rows.values() {
            match row.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        Ok(self.state.lock().await.rows.get(&id).cloned())
    }
}
