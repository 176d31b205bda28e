//! Consumption loop started by `EventBus::subscribe`.
//!
//! ```text
//! INITIAL -> CONNECTING -> CONSUMING -> (stop) DRAINING -> STOPPED
//!                 ^            |
//!                 |            v
//!                 +-------- ERROR   (bounded-backoff reconnect)
//! ```
//!
//! Each record is handed to the handler until it succeeds or the retry
//! decision says to dead-letter it. Either way the offset is committed, so a
//! poison record never blocks its partition. Adapter failures never end the
//! loop; they move it to ERROR and it re-subscribes from the group's
//! committed position.

use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::broker::{AdapterError, EventAdapter, Subscription};
use crate::domain::delivery::{
    apply_jitter, decide, AttemptOutcome, RetryDecision, RetryPolicy, RetryState,
};
use crate::domain::foundation::{ConsumerRecord, DomainError, StateMachine};
use crate::ports::EventHandler;

use super::bus::bounded;
use super::metrics::BusMetrics;

/// Dead-letter topic for records consumed from `topic`.
pub fn dlq_topic(topic: &str) -> String {
    format!("{}.dlq", topic)
}

/// Lifecycle of one consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Initial,
    Connecting,
    Consuming,
    Draining,
    Stopped,
    Error,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Initial => "INITIAL",
            ConsumerState::Connecting => "CONNECTING",
            ConsumerState::Consuming => "CONSUMING",
            ConsumerState::Draining => "DRAINING",
            ConsumerState::Stopped => "STOPPED",
            ConsumerState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StateMachine for ConsumerState {
    fn valid_transitions(&self) -> Vec<Self> {
        use ConsumerState::*;
        match self {
            Initial => vec![Connecting, Draining],
            Connecting => vec![Consuming, Error, Draining],
            Consuming => vec![Draining, Error],
            Error => vec![Connecting, Draining],
            Draining => vec![Stopped],
            Stopped => vec![],
        }
    }
}

/// Handle to a running consumption loop.
pub struct SubscriptionHandle {
    group: String,
    topics: Vec<String>,
    state: watch::Receiver<ConsumerState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("group", &self.group)
            .field("topics", &self.topics)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Resolved topic names, including any configured prefix.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Watch the loop's state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop consuming and wait for the in-flight record to finish.
    ///
    /// The task is aborted if it is still running after `grace`. Returns the
    /// last observed state.
    pub async fn stop(self, grace: Duration) -> ConsumerState {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!(
                consumer_group = %self.group,
                grace_ms = grace.as_millis() as u64,
                "Consumer did not stop within grace period, aborting"
            );
            task.abort();
        }
        let state = *self.state.borrow();
        state
    }
}

enum Exit {
    Cancelled,
    Failed(AdapterError),
}

enum Processed {
    Committed,
    DeadLettered,
    /// Stop was requested between handler retries; nothing was committed.
    Interrupted,
}

pub(crate) struct ConsumerLoop {
    pub(crate) adapter: EventAdapter,
    pub(crate) topics: Vec<String>,
    pub(crate) group: String,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) handler_policy: RetryPolicy,
    pub(crate) reconnect_policy: RetryPolicy,
    pub(crate) jitter_ratio: f64,
    pub(crate) operation_timeout: Duration,
    pub(crate) metrics: Arc<BusMetrics>,
}

impl ConsumerLoop {
    /// Spawn the loop on an already established subscription.
    pub(crate) fn spawn(self, initial: Subscription, cancel: CancellationToken) -> SubscriptionHandle {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Initial);
        let group = self.group.clone();
        let topics = self.topics.clone();
        let task = tokio::spawn(self.run(initial, state_tx, cancel.clone()));
        SubscriptionHandle {
            group,
            topics,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        initial: Subscription,
        state: watch::Sender<ConsumerState>,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            consumer_group = %self.group,
            topics = ?self.topics,
            handler = self.handler.name(),
            adapter = self.adapter.name(),
            "Consumer loop started"
        );

        let mut established = Some(initial);
        let mut reconnect = RetryState::new(&self.reconnect_policy);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(&state, ConsumerState::Connecting);

            let subscription = match established.take() {
                Some(subscription) => subscription,
                None => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.resubscribe() => result,
                    };
                    match result {
                        Ok(subscription) => subscription,
                        Err(err) => {
                            self.set_state(&state, ConsumerState::Error);
                            tracing::warn!(
                                consumer_group = %self.group,
                                error = %err,
                                "Consumer could not re-subscribe"
                            );
                            if !self.back_off(&mut reconnect, &cancel).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            reconnect = RetryState::new(&self.reconnect_policy);
            self.set_state(&state, ConsumerState::Consuming);
            let exit = self.consume(&subscription, &cancel).await;

            if matches!(exit, Exit::Cancelled) {
                self.set_state(&state, ConsumerState::Draining);
            } else {
                self.set_state(&state, ConsumerState::Error);
            }
            if let Err(err) = self.adapter.unsubscribe(&subscription).await {
                tracing::debug!(consumer_group = %self.group, error = %err, "Unsubscribe failed");
            }

            match exit {
                Exit::Cancelled => break,
                Exit::Failed(err) => {
                    tracing::warn!(
                        consumer_group = %self.group,
                        error = %err,
                        "Consumer lost its subscription, reconnecting"
                    );
                    if !self.back_off(&mut reconnect, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(&state, ConsumerState::Draining);
        self.set_state(&state, ConsumerState::Stopped);
        tracing::info!(consumer_group = %self.group, topics = ?self.topics, "Consumer loop stopped");
    }

    async fn resubscribe(&self) -> Result<Subscription, AdapterError> {
        if !self.adapter.is_connected() {
            bounded(self.operation_timeout, self.adapter.connect()).await?;
        }
        bounded(
            self.operation_timeout,
            self.adapter.subscribe(&self.topics, &self.group),
        )
        .await
    }

    /// Wait out the next reconnect delay. Returns false if stopped meanwhile.
    async fn back_off(&self, retry: &mut RetryState, cancel: &CancellationToken) -> bool {
        let (decision, next) = decide(&self.reconnect_policy, *retry, AttemptOutcome::Failed);
        *retry = next;
        let delay = match decision {
            RetryDecision::Retry { delay } => delay,
            _ => self.reconnect_policy.max_delay,
        };
        let delay = apply_jitter(delay, self.jitter_ratio);
        tracing::warn!(
            consumer_group = %self.group,
            attempt = retry.attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting consumer"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn consume(&self, subscription: &Subscription, cancel: &CancellationToken) -> Exit {
        let mut records = self.adapter.consume(subscription);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Exit::Cancelled,
                next = records.next() => next,
            };
            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(err)) => return Exit::Failed(err),
                None => {
                    return Exit::Failed(AdapterError::Subscription(format!(
                        "subscription {} ended",
                        subscription.id
                    )))
                }
            };
            self.metrics.record_consume();

            match self.process(&record, cancel).await {
                Ok(Processed::Committed) | Ok(Processed::DeadLettered) => {}
                Ok(Processed::Interrupted) => return Exit::Cancelled,
                Err(err) => return Exit::Failed(err),
            }
        }
    }

    async fn process(
        &self,
        record: &ConsumerRecord,
        cancel: &CancellationToken,
    ) -> Result<Processed, AdapterError> {
        let mut retry = RetryState::new(&self.handler_policy);
        let mut last_error: Option<DomainError> = None;

        loop {
            let outcome = match self.handler.handle(record.record.clone()).await {
                Ok(()) => AttemptOutcome::Succeeded,
                Err(err) => {
                    self.metrics.record_failure();
                    tracing::warn!(
                        consumer_group = %self.group,
                        topic = %record.topic,
                        event_id = %record.record.event_id,
                        handler = self.handler.name(),
                        attempt = retry.attempts + 1,
                        error = %err,
                        "Handler failed"
                    );
                    last_error = Some(err);
                    AttemptOutcome::Failed
                }
            };

            let (decision, next) = decide(&self.handler_policy, retry, outcome);
            retry = next;
            match decision {
                RetryDecision::Commit => {
                    self.commit(record).await?;
                    return Ok(Processed::Committed);
                }
                RetryDecision::Retry { delay } => {
                    let delay = apply_jitter(delay, self.jitter_ratio);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(Processed::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DeadLetter => {
                    self.dead_letter(record, retry.attempts, last_error.as_ref()).await?;
                    return Ok(Processed::DeadLettered);
                }
            }
        }
    }

    /// Republish unchanged to `<topic>.dlq`, then commit the original.
    ///
    /// Nothing is committed if the dead-letter publish fails.
    async fn dead_letter(
        &self,
        record: &ConsumerRecord,
        attempts: u32,
        last_error: Option<&DomainError>,
    ) -> Result<(), AdapterError> {
        let dlq = dlq_topic(&record.topic);
        let reason = last_error.map(ToString::to_string).unwrap_or_default();

        if let Err(err) = bounded(self.operation_timeout, self.adapter.publish(&dlq, &record.record)).await {
            tracing::error!(
                consumer_group = %self.group,
                topic = %record.topic,
                dlq_topic = %dlq,
                event_id = %record.record.event_id,
                error = %err,
                "Dead-letter publish failed, record will be redelivered"
            );
            return Err(err);
        }
        self.metrics.record_dead_letter();
        tracing::error!(
            consumer_group = %self.group,
            topic = %record.topic,
            partition = record.ack.partition,
            offset = %record.ack.offset,
            dlq_topic = %dlq,
            event_id = %record.record.event_id,
            event_type = %record.record.event_type,
            correlation_id = record.record.metadata.correlation_id(),
            handler = self.handler.name(),
            attempts,
            delivery_count = record.delivery_count,
            error = %reason,
            "Record routed to dead-letter queue"
        );

        self.commit(record).await
    }

    async fn commit(&self, record: &ConsumerRecord) -> Result<(), AdapterError> {
        bounded(
            self.operation_timeout,
            self.adapter.commit_offset(
                &self.group,
                &record.ack.topic,
                record.ack.partition,
                record.ack.offset,
            ),
        )
        .await
    }

    fn set_state(&self, state: &watch::Sender<ConsumerState>, next: ConsumerState) {
        state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match current.transition_to(next) {
                Ok(next) => {
                    tracing::debug!(consumer_group = %self.group, from = %current, to = %next, "Consumer state changed");
                    *current = next;
                    true
                }
                Err(err) => {
                    tracing::warn!(consumer_group = %self.group, error = %err, "Ignored consumer state change");
                    false
                }
            }
        });
    }
}
