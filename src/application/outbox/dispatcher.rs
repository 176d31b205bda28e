//! OutboxDispatcher - Background workers that publish claimed outbox rows.
//!
//! Each worker repeatedly claims a batch of due rows under its own
//! `processor_id` and publishes them through the [`EventBus`]:
//!
//! | Publish outcome | Row becomes |
//! |-----------------|-------------|
//! | success | PUBLISHED |
//! | schema or metadata rejection | FAILED |
//! | transient failure, retries left | PENDING with `next_attempt_at` pushed back |
//! | transient failure, retries exhausted | DEAD |
//!
//! Workers compete only through the repository's claim; there are no
//! in-process locks between them. A claim lost to lease expiry surfaces as
//! `ClaimConflict` and is skipped.
//!
//! ## Graceful Shutdown
//!
//! Cancelling stops new claims. The row being published finishes, and rows
//! claimed but not yet started are released back to PENDING.
//!
//! ## Lease Budget
//!
//! A worker only starts a publish while the rest of its lease still covers
//! [`EventBus::publish_budget`]. Once it does not, the remaining rows are
//! released rather than published under a claim another worker may already
//! have taken over.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::application::event_bus::EventBus;
use crate::application::EventError;
use crate::config::OutboxConfig;
use crate::domain::delivery::{decide, AttemptOutcome, RetryDecision, RetryPolicy, RetryState};
use crate::domain::foundation::Timestamp;
use crate::domain::outbox::OutboxEvent;
use crate::ports::{OutboxError, OutboxRepository};
use crate::telemetry::worker_span;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead: usize,
    pub failed: usize,
    /// Rows whose claim was taken over by another processor.
    pub conflicts: usize,
    /// Rows handed back unprocessed, on shutdown or because too little of
    /// the lease was left to publish them safely.
    pub released: usize,
    /// Rows whose status update failed; their lease will expire.
    pub errors: usize,
}

/// Publishes outbox rows through the event bus.
#[derive(Clone)]
pub struct OutboxDispatcher {
    repository: Arc<dyn OutboxRepository>,
    bus: Arc<EventBus>,
    config: OutboxConfig,
    policy: RetryPolicy,
}

impl OutboxDispatcher {
    pub fn new(repository: Arc<dyn OutboxRepository>, bus: Arc<EventBus>, config: OutboxConfig) -> Self {
        Self {
            repository,
            bus,
            policy: config.retry_policy(),
            config,
        }
    }

    /// Claim and publish one batch.
    ///
    /// Only the claim itself can fail the cycle. Per-row update failures are
    /// logged and counted in the report.
    pub async fn process_batch(
        &self,
        processor_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, EventError> {
        let lease_deadline = Instant::now() + self.config.lease();
        let rows = self
            .repository
            .claim_batch(processor_id, self.config.batch_size, self.config.lease())
            .await?;
        let mut report = DispatchReport {
            claimed: rows.len(),
            ..Default::default()
        };
        let budget = self.bus.publish_budget();
        let mut lease_spent = false;

        for row in rows {
            if cancel.is_cancelled() {
                self.release(&row, processor_id, &mut report).await;
                continue;
            }
            // Never start a publish that could outlive the claim.
            if lease_spent || lease_deadline.saturating_duration_since(Instant::now()) <= budget {
                if !lease_spent {
                    tracing::warn!(
                        processor_id,
                        budget_ms = budget.as_millis() as u64,
                        "Outbox lease nearly spent, releasing the rest of the batch"
                    );
                    lease_spent = true;
                }
                self.release(&row, processor_id, &mut report).await;
                continue;
            }
            if let Err(e) = self.dispatch(&row, processor_id, &mut report).await {
                report.errors += 1;
                tracing::error!(
                    processor_id,
                    outbox_id = %row.id,
                    error = %e,
                    "Failed to record outbox dispatch result"
                );
            }
        }

        Ok(report)
    }

    /// Start `workers` competing workers. Cancelling `cancel` (or calling
    /// [`DispatcherHandle::shutdown`]) stops them.
    pub fn spawn(&self, workers: usize, cancel: &CancellationToken) -> DispatcherHandle {
        let cancel = cancel.child_token();
        let instance = Uuid::new_v4().simple().to_string();
        let workers = (0..workers.max(1))
            .map(|index| {
                let processor_id = format!("outbox-{}-{}", &instance[..8], index);
                let worker = self.clone();
                let span = worker_span(&processor_id);
                let task = tokio::spawn(
                    worker
                        .run_worker(processor_id.clone(), cancel.clone())
                        .instrument(span),
                );
                (processor_id, task)
            })
            .collect();
        DispatcherHandle { cancel, workers }
    }

    async fn run_worker(self, processor_id: String, cancel: CancellationToken) {
        tracing::info!(
            processor_id = %processor_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Outbox worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Keep going while batches come back full.
            loop {
                match self.process_batch(&processor_id, &cancel).await {
                    Ok(report) => {
                        if report.claimed > 0 {
                            tracing::debug!(processor_id = %processor_id, ?report, "Outbox batch dispatched");
                        }
                        if report.claimed < self.config.batch_size || cancel.is_cancelled() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(processor_id = %processor_id, error = %e, "Outbox claim failed");
                        break;
                    }
                }
            }
        }

        tracing::info!(processor_id = %processor_id, "Outbox worker stopped");
    }

    async fn dispatch(
        &self,
        row: &OutboxEvent,
        processor_id: &str,
        report: &mut DispatchReport,
    ) -> Result<(), EventError> {
        let err = match self.bus.publish_record(row.to_event_record()).await {
            Ok(_) => {
                let result = self.repository.mark_published(row.id, processor_id).await;
                if settle(result, row.id, processor_id, report)? {
                    report.published += 1;
                }
                return Ok(());
            }
            Err(err) => err,
        };
        let reason = err.to_string();

        if err.is_permanent() {
            tracing::warn!(
                processor_id,
                outbox_id = %row.id,
                event_type = %row.event_type,
                error = %reason,
                "Outbox event rejected, marking failed"
            );
            let result = self.repository.mark_failed(row.id, processor_id, &reason).await;
            if settle(result, row.id, processor_id, report)? {
                report.failed += 1;
            }
            return Ok(());
        }

        let state = RetryState::resume(&self.policy, row.retry_count);
        match decide(&self.policy, state, AttemptOutcome::Failed) {
            (RetryDecision::Retry { delay }, next) => {
                let next_attempt_at = Timestamp::now().plus(delay);
                tracing::warn!(
                    processor_id,
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    attempt = next.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Outbox publish failed, scheduling retry"
                );
                let result = self
                    .repository
                    .schedule_retry(row.id, processor_id, &reason, next_attempt_at)
                    .await;
                if settle(result, row.id, processor_id, report)? {
                    report.retried += 1;
                }
            }
            (_, next) => {
                tracing::error!(
                    processor_id,
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    aggregate_type = %row.aggregate_type,
                    aggregate_id = %row.aggregate_id,
                    attempts = next.attempts,
                    error = %reason,
                    "Outbox retries exhausted, marking dead"
                );
                let result = self.repository.mark_dead(row.id, processor_id, &reason).await;
                if settle(result, row.id, processor_id, report)? {
                    report.dead += 1;
                }
            }
        }
        Ok(())
    }

    async fn release(&self, row: &OutboxEvent, processor_id: &str, report: &mut DispatchReport) {
        let result = self.repository.release(row.id, processor_id).await;
        match settle(result, row.id, processor_id, report) {
            Ok(true) => report.released += 1,
            Ok(false) => {}
            Err(e) => {
                report.errors += 1;
                tracing::error!(processor_id, outbox_id = %row.id, error = %e, "Failed to release outbox row");
            }
        }
    }
}

/// Treat a lost claim as benign. Returns whether the update applied.
fn settle(
    result: Result<(), OutboxError>,
    id: Uuid,
    processor_id: &str,
    report: &mut DispatchReport,
) -> Result<bool, EventError> {
    match result {
        Ok(()) => Ok(true),
        Err(OutboxError::ClaimConflict(_)) => {
            report.conflicts += 1;
            tracing::debug!(processor_id, outbox_id = %id, "Outbox row claimed by another processor, skipping");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Running dispatcher workers.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl DispatcherHandle {
    pub fn processor_ids(&self) -> Vec<&str> {
        self.workers.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop claiming, let in-flight publishes finish, and wait for workers.
    ///
    /// Workers still running after `grace` are aborted; rows they held are
    /// reclaimed once their lease expires. Returns true on a clean stop.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let aborts: Vec<_> = self.workers.iter().map(|(_, task)| task.abort_handle()).collect();
        let tasks = self.workers.into_iter().map(|(_, task)| task);

        match tokio::time::timeout(grace, futures::future::join_all(tasks)).await {
            Ok(_) => {
                tracing::info!(workers = aborts.len(), "Outbox dispatcher stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Outbox workers did not stop within grace period, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}
