//! Integration tests for the Transactional Outbox Pattern.
//!
//! These tests verify the end-to-end flow:
//! 1. A business write and its outbox row commit or roll back together
//! 2. Dispatcher workers claim rows without ever sharing one
//! 3. Claimed rows are published through the event bus and marked PUBLISHED
//! 4. An IdempotentHandler absorbs redelivery after a lost claim
//! 5. PUBLISHED rows are never dispatched again and age out via retention
//!
//! Uses in-memory implementations to test the pattern without external dependencies.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use eventline::adapters::broker::AdapterOptions;
use eventline::adapters::{
    EventAdapter, IdempotentHandler, InMemoryAdapter, InMemoryOutboxStore, InMemoryProcessedEventStore,
};
use eventline::application::{EventBus, OutboxManager};
use eventline::config::{BusConfig, OutboxConfig};
use eventline::domain::foundation::{DomainError, EventMetadata, EventRecord};
use eventline::domain::outbox::{NewOutboxEvent, OutboxStatus};
use eventline::domain::schema::SchemaRegistry;
use eventline::ports::{EventHandler, OutboxError, OutboxRepository};

// =============================================================================
// Test Infrastructure
// =============================================================================

struct Harness {
    store: InMemoryOutboxStore,
    adapter: InMemoryAdapter,
    bus: Arc<EventBus>,
    manager: OutboxManager,
}

fn harness(config: OutboxConfig) -> Harness {
    let store = InMemoryOutboxStore::new();
    let adapter = InMemoryAdapter::new(AdapterOptions {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    });
    let bus = Arc::new(EventBus::new(
        EventAdapter::from(adapter.clone()),
        Arc::new(SchemaRegistry::new()),
        BusConfig {
            max_publish_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            reconnect_initial_ms: 5,
            reconnect_max_ms: 20,
            ..Default::default()
        },
    ));
    let manager = OutboxManager::new(Arc::new(store.clone()), config);
    Harness {
        store,
        adapter,
        bus,
        manager,
    }
}

fn fast_outbox() -> OutboxConfig {
    OutboxConfig {
        poll_interval_ms: 10,
        batch_size: 3,
        ..Default::default()
    }
}

fn invoice_created(invoice_id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(
        "invoice",
        invoice_id,
        "invoice.created",
        json!({"id": invoice_id, "amount": 100}),
        EventMetadata::new("acme"),
    )
}

/// Simulates a business operation: write an invoice and its event in one transaction.
async fn create_invoice(h: &Harness, invoice_id: &str) -> Uuid {
    let mut tx = h.store.begin();
    tx.insert_row("invoices", json!({"id": invoice_id}));
    let id = h.manager.store_event(invoice_created(invoice_id), &mut tx).await.unwrap();
    tx.commit().await.unwrap();
    id
}

/// Counts handled events.
#[derive(Default)]
struct InvoiceProjector {
    handled: AtomicUsize,
}

#[async_trait]
impl EventHandler for InvoiceProjector {
    async fn handle(&self, _event: EventRecord) -> Result<(), DomainError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InvoiceProjector"
    }
}

async fn wait_until_published(store: &InMemoryOutboxStore, expected: u64) {
    for _ in 0..300 {
        if store.stats().await.unwrap().published == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} published rows", expected);
}

// =============================================================================
// Transactional Write
// =============================================================================

#[tokio::test]
async fn rollback_discards_business_write_and_outbox_row() {
    let h = harness(OutboxConfig::default());

    let mut tx = h.store.begin();
    tx.insert_row("invoices", json!({"id": "inv_1"}));
    h.manager.store_event(invoice_created("inv_1"), &mut tx).await.unwrap();
    tx.rollback();

    assert!(h.store.is_empty().await);
    assert!(h.store.business_rows("invoices").await.is_empty());
}

#[tokio::test]
async fn dropped_transaction_behaves_like_rollback() {
    let h = harness(OutboxConfig::default());

    {
        let mut tx = h.store.begin();
        h.manager.store_event(invoice_created("inv_1"), &mut tx).await.unwrap();
    }

    assert_eq!(h.store.len().await, 0);
}

#[tokio::test]
async fn commit_stores_pending_row_without_publishing() {
    let h = harness(OutboxConfig::default());

    let id = create_invoice(&h, "inv_1").await;

    let row = h.manager.find(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.tenant_id, "acme");
    assert_eq!(h.store.business_rows("invoices").await.len(), 1);
    assert_eq!(h.adapter.topic_len("invoice.created").await, 0);
}

// =============================================================================
// Claiming
// =============================================================================

#[tokio::test]
async fn concurrent_workers_never_share_a_row() {
    const WORKERS: usize = 8;
    const ROWS: usize = 200;

    let h = harness(OutboxConfig::default());
    for i in 0..ROWS {
        create_invoice(&h, &format!("inv_{}", i)).await;
    }

    let mut tasks = Vec::new();
    for w in 0..WORKERS {
        let store = h.store.clone();
        tasks.push(tokio::spawn(async move {
            let processor_id = format!("worker-{}", w);
            let mut claimed = Vec::new();
            loop {
                let batch = store
                    .claim_batch(&processor_id, 7, Duration::from_secs(30))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                for row in &batch {
                    assert_eq!(row.processor_id.as_deref(), Some(processor_id.as_str()));
                }
                claimed.extend(batch.into_iter().map(|row| row.id));
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), ROWS);
    assert_eq!(unique.len(), ROWS);
    assert_eq!(h.store.stats().await.unwrap().processing, ROWS as u64);
}

#[tokio::test]
async fn expired_lease_moves_claim_to_another_worker() {
    let h = harness(OutboxConfig::default());
    let id = create_invoice(&h, "inv_1").await;

    let first = h
        .store
        .claim_batch("worker-a", 10, Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = h
        .store
        .claim_batch("worker-b", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, id);

    // The stale worker can no longer settle the row.
    let err = h.store.mark_published(id, "worker-a").await.unwrap_err();
    assert_eq!(err, OutboxError::ClaimConflict(id));
    h.store.mark_published(id, "worker-b").await.unwrap();
}

// =============================================================================
// End-to-End Dispatch
// =============================================================================

#[tokio::test]
async fn stored_events_reach_subscribers_through_dispatcher() {
    let h = harness(fast_outbox());
    let projector = Arc::new(InvoiceProjector::default());
    let subscription = h
        .bus
        .subscribe(&["invoice.created"], "projections", projector.clone())
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..7 {
        ids.push(create_invoice(&h, &format!("inv_{}", i)).await);
    }

    let cancel = CancellationToken::new();
    let dispatcher = h.manager.dispatcher(Arc::clone(&h.bus)).spawn(2, &cancel);
    wait_until_published(&h.store, 7).await;

    for _ in 0..300 {
        if projector.handled.load(Ordering::SeqCst) == 7 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(projector.handled.load(Ordering::SeqCst), 7);

    let delivered: HashSet<_> = h
        .adapter
        .records("invoice.created")
        .await
        .into_iter()
        .map(|r| r.event_id.to_string())
        .collect();
    let expected: HashSet<_> = ids.iter().map(Uuid::to_string).collect();
    assert_eq!(delivered, expected);

    assert!(dispatcher.shutdown(Duration::from_secs(1)).await);
    subscription.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn published_rows_are_never_dispatched_again() {
    let h = harness(OutboxConfig::default());
    let id = create_invoice(&h, "inv_1").await;
    let dispatcher = h.manager.dispatcher(Arc::clone(&h.bus));
    let cancel = CancellationToken::new();

    let report = dispatcher.process_batch("worker-a", &cancel).await.unwrap();
    assert_eq!(report.published, 1);
    let published = h.manager.find(id).await.unwrap().unwrap();

    assert_eq!(h.manager.reset_stuck_events().await.unwrap(), 0);
    let report = dispatcher.process_batch("worker-b", &cancel).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert!(h.store.mark_published(id, "worker-a").await.is_err());

    assert_eq!(h.manager.find(id).await.unwrap().unwrap(), published);
    assert_eq!(h.adapter.topic_len("invoice.created").await, 1);
}

#[tokio::test]
async fn redelivery_after_lost_claim_is_absorbed_by_idempotent_handler() {
    let h = harness(OutboxConfig::default());
    let processed = Arc::new(InMemoryProcessedEventStore::new());
    let projector = IdempotentHandler::new(InvoiceProjector::default(), processed.clone());
    let projector = Arc::new(projector);
    let subscription = h
        .bus
        .subscribe(&["invoice.created"], "projections", projector.clone())
        .await
        .unwrap();

    let id = create_invoice(&h, "inv_1").await;
    let row = h
        .store
        .claim_batch("crashed-worker", 1, Duration::from_millis(1))
        .await
        .unwrap()
        .remove(0);
    // The crashed worker published but never recorded it.
    h.bus.publish_record(row.to_event_record()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let dispatcher = h.manager.dispatcher(Arc::clone(&h.bus));
    let report = dispatcher
        .process_batch("worker-b", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(h.adapter.topic_len("invoice.created").await, 2);

    for _ in 0..300 {
        if h.adapter.committed_offset("projections", "invoice.created").await == Some(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(projector.inner().handled.load(Ordering::SeqCst), 1);
    assert_eq!(processed.len().await, 1);
    assert_eq!(h.manager.find(id).await.unwrap().unwrap().status, OutboxStatus::Published);
    subscription.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn outage_schedules_retries_then_recovers() {
    let h = harness(OutboxConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        ..Default::default()
    });
    let id = create_invoice(&h, "inv_1").await;
    let dispatcher = h.manager.dispatcher(Arc::clone(&h.bus));
    let cancel = CancellationToken::new();

    h.adapter.simulate_outage().await;
    let report = dispatcher.process_batch("worker-a", &cancel).await.unwrap();
    assert_eq!(report.retried, 1);
    let row = h.manager.find(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.retry_count, 1);

    h.adapter.restore();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = dispatcher.process_batch("worker-a", &cancel).await.unwrap();
    assert_eq!(report.published, 1);
    let row = h.manager.find(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
    assert_eq!(row.retry_count, 1);
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn cleanup_removes_only_old_published_rows() {
    let h = harness(OutboxConfig::default());
    let dispatcher = h.manager.dispatcher(Arc::clone(&h.bus));
    create_invoice(&h, "inv_1").await;
    dispatcher
        .process_batch("worker-a", &CancellationToken::new())
        .await
        .unwrap();
    let pending = create_invoice(&h, "inv_2").await;

    assert_eq!(h.manager.cleanup_old_events(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.manager.cleanup_old_events(Duration::ZERO).await.unwrap(), 1);

    let remaining = h.store.rows().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, pending);
}
