//! Bus counters exported through `health_check`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by the publisher and every consumer loop.
#[derive(Debug, Default)]
pub struct BusMetrics {
    publish_count: AtomicU64,
    consume_count: AtomicU64,
    failure_count: AtomicU64,
    dlq_count: AtomicU64,
}

/// Point-in-time copy of [`BusMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub publish_count: u64,
    pub consume_count: u64,
    /// Failed publish attempts plus failed handler invocations.
    pub failure_count: u64,
    pub dlq_count: u64,
}

impl BusMetrics {
    pub fn record_publish(&self, records: u64) {
        self.publish_count.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_consume(&self) {
        self.consume_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dlq_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publish_count: self.publish_count.load(Ordering::Relaxed),
            consume_count: self.consume_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            dlq_count: self.dlq_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let metrics = BusMetrics::default();
        metrics.record_publish(3);
        metrics.record_consume();
        metrics.record_failure();
        metrics.record_failure();
        metrics.record_dead_letter();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                publish_count: 3,
                consume_count: 1,
                failure_count: 2,
                dlq_count: 1,
            }
        );
    }
}
