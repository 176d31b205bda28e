//! Integration tests for the event bus over each adapter.
//!
//! These tests verify:
//! 1. Published events reach subscribers with payloads unchanged
//! 2. A poison record is dead-lettered after exactly the failure threshold
//!    and consumption continues past it
//! 3. Events published around an outage are delivered at least once
//! 4. Events sharing a partition key arrive in publish order

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use eventline::adapters::broker::AdapterOptions;
use eventline::adapters::{
    EventAdapter, InMemoryAdapter, InMemoryStreamStore, PartitionedLogAdapter, StreamLogAdapter,
};
use eventline::application::{ConsumerState, EventBus};
use eventline::config::BusConfig;
use eventline::domain::foundation::{DomainError, EventId, EventMetadata, EventRecord};
use eventline::domain::schema::SchemaRegistry;
use eventline::ports::EventHandler;

// =============================================================================
// Test Infrastructure
// =============================================================================

fn options() -> AdapterOptions {
    AdapterOptions {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn bus_config() -> BusConfig {
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

fn all_adapters() -> Vec<EventAdapter> {
    vec![
        EventAdapter::from(InMemoryAdapter::new(options())),
        EventAdapter::from(StreamLogAdapter::new(Arc::new(InMemoryStreamStore::new()), options())),
        EventAdapter::from(PartitionedLogAdapter::new(options())),
    ]
}

fn bus_over(adapter: EventAdapter) -> EventBus {
    EventBus::new(adapter, Arc::new(SchemaRegistry::new()), bus_config())
        .with_operation_timeout(Duration::from_millis(200))
}

/// Records every event it sees.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<EventRecord>>,
}

impl Recorder {
    async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    async fn ids(&self) -> HashSet<EventId> {
        self.seen.lock().await.iter().map(|e| e.event_id.clone()).collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: EventRecord) -> Result<(), DomainError> {
        self.seen.lock().await.push(event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Recorder"
    }
}

/// Fails every event flagged as poison, records the rest.
#[derive(Default)]
struct PoisonAware {
    poison_calls: AtomicU32,
    ok: Recorder,
}

#[async_trait]
impl EventHandler for PoisonAware {
    async fn handle(&self, event: EventRecord) -> Result<(), DomainError> {
        if event.data.get("poison") == Some(&Value::Bool(true)) {
            self.poison_calls.fetch_add(1, Ordering::SeqCst);
            return Err(DomainError::handler("cannot process poison record"));
        }
        self.ok.handle(event).await
    }

    fn name(&self) -> &'static str {
        "PoisonAware"
    }
}

async fn publish_numbered(bus: &EventBus, n: u32) -> EventId {
    let record = EventRecord::new("orders", json!({"n": n}), EventMetadata::new("acme"));
    let id = record.event_id.clone();
    bus.publish_record(record).await.unwrap();
    id
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn delivers_payloads_unchanged_on_every_adapter() {
    for adapter in all_adapters() {
        let name = adapter.name();
        let bus = bus_over(adapter);
        let recorder = Arc::new(Recorder::default());
        let handle = bus.subscribe(&["invoice.created"], "billing", recorder.clone()).await.unwrap();

        let data = json!({
            "id": "inv_1",
            "amount": 12_050,
            "lines": [{"sku": "A-1", "qty": 2}, {"sku": "B-7", "qty": 1}],
            "note": "ünïcödé \u{1F4B8}",
            "discount": null
        });
        let metadata = EventMetadata::new("acme")
            .with_aggregate("invoice", "inv_1")
            .with_correlation_id("req-42")
            .with_trace_id("4bf92f3577b34da6a3ce929d0e0e4736");
        bus.publish("invoice.created", data.clone(), metadata).await.unwrap();

        eventually(name, || async { recorder.len().await == 1 }).await;
        let seen = recorder.seen.lock().await[0].clone();
        assert_eq!(
            serde_json::to_vec(&seen.data).unwrap(),
            serde_json::to_vec(&data).unwrap(),
            "{} changed the payload",
            name
        );
        assert_eq!(seen.metadata.tenant_id(), "acme");
        assert_eq!(seen.metadata.correlation_id(), "req-42");
        assert_eq!(seen.metadata.trace_id.as_deref(), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
        assert_eq!(seen.partition_key.as_str(), "acme:inv_1");

        assert_eq!(handle.stop(Duration::from_secs(1)).await, ConsumerState::Stopped);
        bus.close().await.unwrap();
    }
}

#[tokio::test]
async fn poison_record_is_dead_lettered_after_threshold_on_every_adapter() {
    for adapter in all_adapters() {
        let name = adapter.name();
        let bus = bus_over(adapter);
        let handler = Arc::new(PoisonAware::default());
        let dlq = Arc::new(Recorder::default());
        let handle = bus.subscribe(&["orders"], "billing", handler.clone()).await.unwrap();
        let audit = bus.subscribe(&["orders.dlq"], "dlq-audit", dlq.clone()).await.unwrap();

        let metadata = EventMetadata::new("acme").with_aggregate("order", "ord_1");
        let poison = EventRecord::new("orders", json!({"poison": true}), metadata.clone());
        let poison_id = poison.event_id.clone();
        bus.publish_record(poison).await.unwrap();
        bus.publish("orders", json!({"n": 2}), metadata).await.unwrap();

        eventually(name, || async { dlq.len().await == 1 }).await;
        eventually(name, || async { handler.ok.len().await == 1 }).await;

        assert_eq!(handler.poison_calls.load(Ordering::SeqCst), 3, "{}", name);
        let dead = dlq.seen.lock().await[0].clone();
        assert_eq!(dead.event_id, poison_id);
        assert_eq!(dead.data, json!({"poison": true}));
        assert_eq!(bus.metrics().dlq_count, 1);

        // The poison record was committed, so it is not handled again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.poison_calls.load(Ordering::SeqCst), 3, "{}", name);

        handle.stop(Duration::from_secs(1)).await;
        audit.stop(Duration::from_secs(1)).await;
    }
}

#[tokio::test]
async fn dead_lettering_advances_the_committed_offset() {
    let adapter = InMemoryAdapter::new(options());
    let bus = bus_over(EventAdapter::from(adapter.clone()));
    let handler = Arc::new(PoisonAware::default());
    let handle = bus.subscribe(&["orders"], "billing", handler.clone()).await.unwrap();

    bus.publish("orders", json!({"poison": true}), EventMetadata::new("acme"))
        .await
        .unwrap();

    eventually("dlq", || async { adapter.topic_len("orders.dlq").await == 1 }).await;
    eventually("commit", || async {
        adapter.committed_offset("billing", "orders").await == Some(1)
    })
    .await;
    assert_eq!(handler.poison_calls.load(Ordering::SeqCst), 3);
    handle.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn events_survive_an_outage_at_least_once() {
    let adapter = InMemoryAdapter::new(options());
    let bus = bus_over(EventAdapter::from(adapter.clone()));
    let recorder = Arc::new(Recorder::default());
    let handle = bus.subscribe(&["orders"], "billing", recorder.clone()).await.unwrap();
    let mut state = handle.state();

    let mut published = HashSet::new();
    for n in 0..5 {
        published.insert(publish_numbered(&bus, n).await);
    }

    adapter.simulate_outage().await;
    state.wait_for(|s| *s == ConsumerState::Error).await.unwrap();
    let err = bus
        .publish("orders", json!({"n": "lost"}), EventMetadata::new("acme"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    adapter.restore();
    for n in 5..10 {
        published.insert(publish_numbered(&bus, n).await);
    }

    eventually("all events delivered", || async {
        recorder.ids().await.is_superset(&published)
    })
    .await;
    assert!(recorder.len().await >= published.len());
    assert_eq!(handle.current_state(), ConsumerState::Consuming);
    handle.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn same_partition_key_keeps_publish_order() {
    let bus = bus_over(EventAdapter::from(PartitionedLogAdapter::new(options())));
    bus.ensure_topic("ledger", Some(4)).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    let handle = bus.subscribe(&["ledger"], "projector", recorder.clone()).await.unwrap();

    for seq in 0..20 {
        let account = if seq % 2 == 0 { "acc_even" } else { "acc_odd" };
        let metadata = EventMetadata::new("acme").with_aggregate("account", account);
        bus.publish("ledger", json!({"seq": seq, "account": account}), metadata)
            .await
            .unwrap();
    }

    eventually("all ledger events", || async { recorder.len().await >= 20 }).await;
    let seen = recorder.seen.lock().await.clone();
    for account in ["acc_even", "acc_odd"] {
        let seqs: Vec<i64> = seen
            .iter()
            .filter(|e| e.data["account"] == account)
            .filter_map(|e| e.data["seq"].as_i64())
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "{} out of order", account);
    }
    handle.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn topic_prefix_applies_to_subscriptions_and_dlq() {
    let adapter = InMemoryAdapter::new(options());
    let bus = EventBus::new(
        EventAdapter::from(adapter.clone()),
        Arc::new(SchemaRegistry::new()),
        BusConfig {
            topic_prefix: Some("staging".to_string()),
            ..bus_config()
        },
    );
    let handler = Arc::new(PoisonAware::default());
    let handle = bus.subscribe(&["orders"], "billing", handler).await.unwrap();

    bus.publish("orders", json!({"poison": true}), EventMetadata::new("acme"))
        .await
        .unwrap();

    eventually("prefixed dlq", || async { adapter.topic_len("staging.orders.dlq").await == 1 }).await;
    assert_eq!(adapter.topic_len("orders").await, 0);
    handle.stop(Duration::from_secs(1)).await;
}
