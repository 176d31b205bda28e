//! eventline outbox relay.
//!
//! Connects the configured broker adapter and the PostgreSQL outbox, then
//! runs dispatcher workers and outbox maintenance until Ctrl-C or SIGTERM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use eventline::adapters::{EventAdapter, PostgresOutboxRepository};
use eventline::application::{EventBus, OutboxManager};
use eventline::config::AppConfig;
use eventline::domain::schema::SchemaRegistry;
use eventline::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    config.validate()?;
    init_tracing(&config.logging);

    tracing::info!(
        adapter = ?config.adapter.kind,
        workers = config.outbox.workers,
        "eventline starting"
    );

    let adapter = EventAdapter::from_config(&config.adapter, &config.redis).await?;
    let registry = Arc::new(
        SchemaRegistry::new().with_default_compatibility(config.schema.default_compatibility),
    );
    let bus = Arc::new(
        EventBus::new(adapter, registry, config.bus.clone())
            .with_operation_timeout(config.adapter.operation_timeout()),
    );

    let pool = config.database.connect().await?;
    if config.database.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Database migrations applied");
    }

    let repository = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    let manager = OutboxManager::new(repository, config.outbox.clone());

    let reset = manager.reset_stuck_events().await?;
    if reset > 0 {
        tracing::info!(rows = reset, "Released expired outbox claims from a previous run");
    }

    let cancel = CancellationToken::new();
    let dispatcher = manager
        .dispatcher(Arc::clone(&bus))
        .spawn(config.outbox.workers, &cancel);
    let maintenance = manager.spawn_maintenance(cancel.child_token());

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining");

    let grace = config.bus.shutdown_grace();
    if !dispatcher.shutdown(grace).await {
        tracing::warn!("Outbox dispatcher was aborted; unfinished rows will be reclaimed after their lease");
    }
    cancel.cancel();
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "Outbox maintenance task ended abnormally");
    }

    let health = bus.health_check();
    tracing::info!(
        published = health.metrics.publish_count,
        failures = health.metrics.failure_count,
        "Closing event bus"
    );
    bus.close().await?;
    pool.close().await;

    tracing::info!("eventline stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
