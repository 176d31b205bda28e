//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Calling
//! [`init_tracing`] more than once is a no-op.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Install the global subscriber: JSON lines or human-readable output.
pub fn init_tracing(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(filter);
        let result = if config.json {
            registry.with(fmt::layer().json().with_current_span(false)).try_init()
        } else {
            registry.with(fmt::layer().with_target(true)).try_init()
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already installed");
        }
    });
}

/// Span wrapping one outbox worker's lifetime.
pub fn worker_span(processor_id: &str) -> tracing::Span {
    tracing::info_span!("outbox_worker", processor_id = processor_id)
}
