//! EventBus - validated publish and managed subscriptions over one adapter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::adapters::broker::{AdapterError, EventAdapter};
use crate::config::BusConfig;
use crate::domain::delivery::{apply_jitter, decide, AttemptOutcome, RetryDecision, RetryPolicy, RetryState};
use crate::domain::foundation::{EventMetadata, EventRecord, ProducerClock, PublishResult, ValidationError};
use crate::domain::schema::{validate_payload, SchemaRegistry, VersionSelector};
use crate::ports::{EventHandler, TenantContext};

use super::consumer::{ConsumerLoop, SubscriptionHandle};
use super::metrics::{BusMetrics, MetricsSnapshot};
use crate::application::EventError;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an adapter call with an upper bound on its duration.
pub(super) async fn bounded<T>(
    timeout: Duration,
    operation: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(timeout, operation)
        .await
        .unwrap_or(Err(AdapterError::Timeout(timeout)))
}

/// Adapter connectivity plus bus counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub adapter: &'static str,
    pub connected: bool,
    pub metrics: MetricsSnapshot,
}

/// Publishes and consumes events through the configured adapter.
///
/// One bus per process. Every publish, whether direct or dispatched from the
/// outbox, goes through [`EventBus::publish_record`], so metadata checks,
/// schema validation, topic naming, and retries are applied uniformly.
pub struct EventBus {
    adapter: EventAdapter,
    registry: Arc<SchemaRegistry>,
    tenant_context: Option<Arc<dyn TenantContext>>,
    config: BusConfig,
    publish_policy: RetryPolicy,
    operation_timeout: Duration,
    clock: ProducerClock,
    metrics: Arc<BusMetrics>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("adapter", &self.adapter)
            .field("topic_prefix", &self.config.topic_prefix)
            .finish()
    }
}

impl EventBus {
    pub fn new(adapter: EventAdapter, registry: Arc<SchemaRegistry>, config: BusConfig) -> Self {
        Self {
            adapter,
            registry,
            tenant_context: None,
            publish_policy: config.publish_policy(),
            config,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            clock: ProducerClock::new(),
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    /// Supply tenants for events whose metadata has none.
    pub fn with_tenant_context(mut self, context: Arc<dyn TenantContext>) -> Self {
        self.tenant_context = Some(context);
        self
    }

    /// Upper bound for each individual adapter call.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Longest a single [`publish_record`](Self::publish_record) can take.
    pub fn publish_budget(&self) -> Duration {
        self.config.publish_budget(self.operation_timeout)
    }

    pub fn adapter(&self) -> &EventAdapter {
        &self.adapter
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Topic an event type is published to, including the configured prefix.
    pub fn resolve_topic(&self, name: &str) -> String {
        match &self.config.topic_prefix {
            Some(prefix) => format!("{}.{}", prefix, name),
            None => name.to_string(),
        }
    }

    /// Build a record and publish it to the topic named after `event_type`.
    pub async fn publish(
        &self,
        event_type: &str,
        data: JsonValue,
        metadata: EventMetadata,
    ) -> Result<PublishResult, EventError> {
        self.publish_record(EventRecord::new(event_type, data, metadata)).await
    }

    /// Validate and publish a prepared record.
    ///
    /// Validation failures are returned immediately. Transient adapter
    /// failures are retried with backoff until the attempt limit.
    pub async fn publish_record(&self, mut record: EventRecord) -> Result<PublishResult, EventError> {
        self.prepare(&mut record)?;
        let topic = self.resolve_topic(&record.event_type);
        let result = self
            .with_retry(&topic, || self.adapter.publish(&topic, &record))
            .await?;
        self.metrics.record_publish(1);
        tracing::debug!(
            topic = %topic,
            event_id = %record.event_id,
            offset = ?result.offset,
            "Event published"
        );
        Ok(result)
    }

    /// Publish many records. Consecutive records for the same topic go out as
    /// one adapter batch. Results are in input order.
    pub async fn publish_batch(&self, mut records: Vec<EventRecord>) -> Result<Vec<PublishResult>, EventError> {
        for record in records.iter_mut() {
            self.prepare(record)?;
        }

        let mut results = Vec::with_capacity(records.len());
        let mut start = 0;
        while start < records.len() {
            let topic = self.resolve_topic(&records[start].event_type);
            let end = records[start..]
                .iter()
                .position(|r| self.resolve_topic(&r.event_type) != topic)
                .map_or(records.len(), |len| start + len);
            let run = &records[start..end];
            let published = self
                .with_retry(&topic, || self.adapter.publish_batch(&topic, run))
                .await?;
            self.metrics.record_publish(published.len() as u64);
            results.extend(published);
            start = end;
        }
        Ok(results)
    }

    /// Create a topic if the adapter does not have it yet.
    pub async fn ensure_topic(&self, name: &str, partitions: Option<u32>) -> Result<(), EventError> {
        self.ensure_connected().await?;
        let topic = self.resolve_topic(name);
        bounded(self.operation_timeout, self.adapter.create_topic(&topic, partitions))
            .await
            .map_err(EventError::from)
    }

    /// Start a consumption loop for `consumer_group` on `topics`.
    ///
    /// The group membership is established before returning, so setup
    /// failures surface here. Later adapter failures are handled inside the
    /// loop by reconnecting.
    pub async fn subscribe(
        &self,
        topics: &[&str],
        consumer_group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, EventError> {
        if topics.is_empty() {
            return Err(EventError::Subscription("at least one topic is required".to_string()));
        }
        for topic in topics {
            validate_name("topic", topic)?;
        }
        validate_name("consumer_group", consumer_group)?;

        let resolved: Vec<String> = topics.iter().map(|t| self.resolve_topic(t)).collect();
        self.ensure_connected().await?;
        let subscription = bounded(
            self.operation_timeout,
            self.adapter.subscribe(&resolved, consumer_group),
        )
        .await
        .map_err(|err| EventError::Subscription(err.to_string()))?;

        let consumer = ConsumerLoop {
            adapter: self.adapter.clone(),
            topics: resolved,
            group: consumer_group.to_string(),
            handler,
            handler_policy: self.config.handler_policy(),
            reconnect_policy: self.config.reconnect_policy(),
            jitter_ratio: self.config.jitter_ratio,
            operation_timeout: self.operation_timeout,
            metrics: Arc::clone(&self.metrics),
        };
        Ok(consumer.spawn(subscription, CancellationToken::new()))
    }

    pub fn health_check(&self) -> HealthReport {
        HealthReport {
            adapter: self.adapter.name(),
            connected: self.adapter.is_connected(),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Disconnect the shared adapter.
    pub async fn close(&self) -> Result<(), EventError> {
        self.adapter.disconnect().await.map_err(EventError::from)
    }

    /// Tenant, metadata, timestamp, and schema checks shared by every publish.
    fn prepare(&self, record: &mut EventRecord) -> Result<(), EventError> {
        if record.metadata.tenant_id().is_empty() {
            if let Some(tenant) = self.tenant_context.as_ref().and_then(|c| c.current_tenant()) {
                record.metadata.assign_tenant(tenant)?;
                record.rederive_partition_key();
            }
        }
        record.metadata.validate()?;
        if record.event_type.trim().is_empty() {
            return Err(ValidationError::empty_field("event_type").into());
        }

        let stamped = self.clock.stamp_at(record.metadata.occurred_at());
        record.metadata.set_occurred_at(stamped);

        let subject = record
            .metadata
            .schema_subject()
            .unwrap_or(&record.event_type)
            .to_string();
        let pinned = record.metadata.schema_subject().is_some();
        if !pinned && !self.registry.has_subject(&subject) {
            return Ok(());
        }

        let selector = VersionSelector::from(record.metadata.schema_version());
        let entry = self.registry.get_schema(&subject, selector)?;
        let violations = validate_payload(entry.definition.root(), &record.data);
        if !violations.is_empty() {
            tracing::debug!(
                subject = %subject,
                event_id = %record.event_id,
                violations = violations.len(),
                "Payload rejected by schema"
            );
            return Err(EventError::Validation { subject, violations });
        }
        record.metadata.set_schema(subject, entry.version);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), EventError> {
        self.connect_adapter().await.map_err(EventError::from)
    }

    async fn connect_adapter(&self) -> Result<(), AdapterError> {
        if self.adapter.is_connected() {
            return Ok(());
        }
        bounded(self.operation_timeout, self.adapter.connect()).await
    }

    /// Retry an adapter call on transient failures with jittered backoff.
    async fn with_retry<T, F, Fut>(&self, topic: &str, mut operation: F) -> Result<T, EventError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut retry = RetryState::new(&self.publish_policy);
        loop {
            let result = match self.connect_adapter().await {
                Ok(()) => bounded(self.operation_timeout, operation()).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            self.metrics.record_failure();
            let attempt = retry.attempts + 1;
            if !err.is_transient() {
                return Err(EventError::Publish {
                    topic: topic.to_string(),
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let (decision, next) = decide(&self.publish_policy, retry, AttemptOutcome::Failed);
            retry = next;
            match decision {
                RetryDecision::Retry { delay } => {
                    let delay = apply_jitter(delay, self.config.jitter_ratio);
                    tracing::warn!(
                        topic = %topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DeadLetter | RetryDecision::Commit => {
                    tracing::warn!(topic = %topic, attempts = retry.attempts, error = %err, "Publish attempts exhausted");
                    return Err(EventError::Publish {
                        topic: topic.to_string(),
                        attempts: retry.attempts,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), EventError> {
    let valid = !value.is_empty()
        && value.len() <= 249
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(EventError::Subscription(format!("invalid {} '{}'", field, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::broker::{AdapterOptions, InMemoryAdapter};
    use crate::application::ConsumerState;
    use crate::domain::foundation::{DomainError, Timestamp};
    use crate::domain::schema::{CompatibilityLevel, SchemaError};
    use crate::ports::FixedTenantContext;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn fast_config() -> BusConfig {
        BusConfig {
            max_publish_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            handler_failure_threshold: 3,
            handler_retry_delay_ms: 1,
            reconnect_initial_ms: 5,
            reconnect_max_ms: 20,
            ..Default::default()
        }
    }

    fn memory() -> InMemoryAdapter {
        InMemoryAdapter::new(AdapterOptions {
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        })
    }

    fn bus_over(adapter: &InMemoryAdapter, config: BusConfig) -> EventBus {
        EventBus::new(
            EventAdapter::from(adapter.clone()),
            Arc::new(SchemaRegistry::new()),
            config,
        )
        .with_operation_timeout(Duration::from_millis(200))
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<EventRecord>>,
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle(&self, event: EventRecord) -> Result<(), DomainError> {
            self.seen.lock().await.push(event);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Recording"
        }
    }

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for AlwaysFails {
        async fn handle(&self, _event: EventRecord) -> Result<(), DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::handler("boom"))
        }

        fn name(&self) -> &'static str {
            "AlwaysFails"
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn publish_connects_lazily_and_counts() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());

        let result = bus
            .publish("invoice.created", json!({"id": "inv_1"}), EventMetadata::new("acme"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.topic, "invoice.created");
        assert_eq!(adapter.topic_len("invoice.created").await, 1);
        let health = bus.health_check();
        assert!(health.connected);
        assert_eq!(health.adapter, "memory");
        assert_eq!(health.metrics.publish_count, 1);
    }

    #[tokio::test]
    async fn topic_prefix_namespaces_topics() {
        let adapter = memory();
        let config = BusConfig {
            topic_prefix: Some("acme".to_string()),
            ..fast_config()
        };
        let bus = bus_over(&adapter, config);

        let result = bus
            .publish("invoice.created", json!({}), EventMetadata::new("acme"))
            .await
            .unwrap();

        assert_eq!(result.topic, "acme.invoice.created");
        assert_eq!(adapter.topic_len("acme.invoice.created").await, 1);
    }

    #[tokio::test]
    async fn missing_tenant_is_rejected_without_context() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());

        let err = bus
            .publish("invoice.created", json!({}), EventMetadata::unscoped())
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::InvalidMetadata(_)));
        assert_eq!(adapter.topic_len("invoice.created").await, 0);
    }

    #[tokio::test]
    async fn tenant_context_fills_missing_tenant_and_partition_key() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config())
            .with_tenant_context(Arc::new(FixedTenantContext::new("acme")));

        let metadata = EventMetadata::unscoped().with_aggregate("invoice", "inv_1");
        bus.publish("invoice.created", json!({}), metadata).await.unwrap();

        let stored = adapter.records("invoice.created").await;
        assert_eq!(stored[0].metadata.tenant_id(), "acme");
        assert_eq!(stored[0].partition_key.as_str(), "acme:inv_1");
    }

    #[tokio::test]
    async fn registered_schema_rejects_bad_payloads() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        bus.registry()
            .register_schema(
                "invoice.created",
                json!({
                    "type": "object",
                    "properties": {"id": {"type": "string"}, "amount": {"type": "integer"}},
                    "required": ["id", "amount"]
                }),
                CompatibilityLevel::Backward,
            )
            .unwrap();

        let err = bus
            .publish("invoice.created", json!({"id": "inv_1"}), EventMetadata::new("acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Validation { ref violations, .. } if !violations.is_empty()));
        assert!(!err.is_retryable());

        bus.publish(
            "invoice.created",
            json!({"id": "inv_1", "amount": 100}),
            EventMetadata::new("acme"),
        )
        .await
        .unwrap();
        let stored = adapter.records("invoice.created").await;
        assert_eq!(stored[0].metadata.schema_subject(), Some("invoice.created"));
        assert_eq!(stored[0].metadata.schema_version(), Some(1));
    }

    #[tokio::test]
    async fn pinned_unknown_subject_is_an_error() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());

        let metadata = EventMetadata::new("acme").with_schema("invoice", None);
        let err = bus.publish("invoice.created", json!({}), metadata).await.unwrap_err();

        assert!(matches!(err, EventError::Schema(SchemaError::SubjectNotFound(_))));
    }

    #[tokio::test]
    async fn occurred_at_never_goes_backwards() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        let later = Timestamp::now().plus(Duration::from_secs(60));

        bus.publish("t", json!({}), EventMetadata::new("acme").with_occurred_at(later))
            .await
            .unwrap();
        bus.publish("t", json!({}), EventMetadata::new("acme")).await.unwrap();

        let stored = adapter.records("t").await;
        assert!(stored[1].metadata.occurred_at() >= stored[0].metadata.occurred_at());
    }

    #[tokio::test]
    async fn publish_gives_up_after_attempt_limit() {
        let adapter = memory();
        adapter.simulate_outage().await;
        let bus = bus_over(&adapter, fast_config());

        let err = bus.publish("t", json!({}), EventMetadata::new("acme")).await.unwrap_err();

        assert!(matches!(err, EventError::Publish { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(bus.metrics().failure_count, 3);
    }

    #[tokio::test]
    async fn publish_batch_keeps_input_order_across_topics() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        let records = vec![
            EventRecord::new("a", json!({"n": 1}), EventMetadata::new("acme")),
            EventRecord::new("a", json!({"n": 2}), EventMetadata::new("acme")),
            EventRecord::new("b", json!({"n": 3}), EventMetadata::new("acme")),
        ];

        let results = bus.publish_batch(records).await.unwrap();

        let topics: Vec<_> = results.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics, vec!["a", "a", "b"]);
        assert_eq!(adapter.topic_len("a").await, 2);
        assert_eq!(bus.metrics().publish_count, 3);
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_inputs() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        let handler = Arc::new(Recording::default());

        let err = bus.subscribe(&[], "billing", handler.clone()).await.unwrap_err();
        assert!(matches!(err, EventError::Subscription(_)));
        let err = bus.subscribe(&["orders"], "bad group", handler).await.unwrap_err();
        assert!(matches!(err, EventError::Subscription(_)));
    }

    #[tokio::test]
    async fn subscriber_receives_and_commits() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        let handler = Arc::new(Recording::default());
        let handle = bus.subscribe(&["orders"], "billing", handler.clone()).await.unwrap();

        bus.publish("orders", json!({"n": 1}), EventMetadata::new("acme")).await.unwrap();
        eventually(|| async { adapter.committed_offset("billing", "orders").await == Some(1) }).await;

        assert_eq!(handler.seen.lock().await.len(), 1);
        assert_eq!(handle.current_state(), ConsumerState::Consuming);
        let state = handle.stop(Duration::from_secs(1)).await;
        assert_eq!(state, ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn poison_record_is_dead_lettered_after_threshold() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        let handler = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        let handle = bus.subscribe(&["orders"], "billing", handler.clone()).await.unwrap();

        bus.publish("orders", json!({"poison": true}), EventMetadata::new("acme"))
            .await
            .unwrap();
        eventually(|| async { adapter.topic_len("orders.dlq").await == 1 }).await;
        eventually(|| async { adapter.committed_offset("billing", "orders").await == Some(1) }).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.metrics().dlq_count, 1);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn consumer_recovers_after_outage() {
        let adapter = memory();
        let bus = bus_over(&adapter, fast_config());
        let handler = Arc::new(Recording::default());
        let handle = bus.subscribe(&["orders"], "billing", handler.clone()).await.unwrap();
        let mut state = handle.state();

        adapter.simulate_outage().await;
        state
            .wait_for(|s| *s == ConsumerState::Error)
            .await
            .unwrap();
        adapter.restore();
        bus.publish("orders", json!({"n": 1}), EventMetadata::new("acme")).await.unwrap();

        eventually(|| async { handler.seen.lock().await.len() == 1 }).await;
        assert_eq!(handle.current_state(), ConsumerState::Consuming);
        handle.stop(Duration::from_secs(1)).await;
    }
}
