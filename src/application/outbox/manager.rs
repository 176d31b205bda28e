//! OutboxManager - stores events transactionally and runs maintenance.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::event_bus::EventBus;
use crate::application::EventError;
use crate::config::OutboxConfig;
use crate::domain::foundation::Timestamp;
use crate::domain::outbox::{NewOutboxEvent, OutboxEvent};
use crate::ports::{OutboxRepository, OutboxStats, OutboxTransaction};

use super::OutboxDispatcher;

/// Entry point for the transactional outbox.
#[derive(Clone)]
pub struct OutboxManager {
    repository: Arc<dyn OutboxRepository>,
    config: OutboxConfig,
}

impl OutboxManager {
    pub fn new(repository: Arc<dyn OutboxRepository>, config: OutboxConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Stage a PENDING row in the caller's transaction.
    ///
    /// Nothing reaches the broker here; the row becomes visible to the
    /// dispatcher only when the caller commits. Returns the row id, which is
    /// also the event id consumers will see.
    pub async fn store_event<T>(&self, event: NewOutboxEvent, transaction: &mut T) -> Result<Uuid, EventError>
    where
        T: OutboxTransaction + ?Sized,
    {
        let row = OutboxEvent::pending(event)?;
        transaction.insert_outbox_event(&row).await?;
        tracing::debug!(
            outbox_id = %row.id,
            event_type = %row.event_type,
            aggregate_type = %row.aggregate_type,
            aggregate_id = %row.aggregate_id,
            "Outbox event staged"
        );
        Ok(row.id)
    }

    /// Delete PUBLISHED rows older than `retention`.
    pub async fn cleanup_old_events(&self, retention: Duration) -> Result<u64, EventError> {
        let cutoff = Timestamp::now().minus(retention);
        Ok(self.repository.delete_published_before(cutoff).await?)
    }

    /// Return PROCESSING rows with expired leases to PENDING.
    pub async fn reset_stuck_events(&self) -> Result<u64, EventError> {
        Ok(self.repository.reset_stuck().await?)
    }

    pub async fn stats(&self) -> Result<OutboxStats, EventError> {
        Ok(self.repository.stats().await?)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<OutboxEvent>, EventError> {
        Ok(self.repository.find(id).await?)
    }

    /// Dispatcher publishing this outbox through `bus`.
    pub fn dispatcher(&self, bus: Arc<EventBus>) -> OutboxDispatcher {
        OutboxDispatcher::new(Arc::clone(&self.repository), bus, self.config.clone())
    }

    /// Periodically reset stuck rows and apply retention until cancelled.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_maintenance(cancel).await })
    }

    async fn run_maintenance(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.maintenance_interval_secs,
            retention_hours = self.config.retention_hours,
            "Outbox maintenance job started"
        );

        let mut interval = tokio::time::interval(self.config.maintenance_interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Outbox maintenance job stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.reset_stuck_events().await {
                        Ok(0) => {}
                        Ok(reset) => tracing::warn!(reset, "Outbox maintenance: reclaimed rows with expired leases"),
                        Err(e) => tracing::error!(error = %e, "Outbox maintenance: reset failed"),
                    }
                    match self.cleanup_old_events(self.config.retention()).await {
                        Ok(0) => tracing::debug!("Outbox maintenance: no rows to purge"),
                        Ok(deleted) => tracing::info!(deleted, "Outbox maintenance: purged published rows"),
                        Err(e) => tracing::error!(error = %e, "Outbox maintenance: cleanup failed"),
                    }
                }
            }
        }
    }
}
