//! PostgreSQL implementation of the outbox ports.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so competing dispatchers, in this
//! process or any other, never claim the same row. Every later update is
//! conditional on the row still being PROCESSING under the caller's
//! `processor_id`.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::foundation::{EventMetadata, Timestamp};
use crate::domain::outbox::{OutboxEvent, OutboxStatus};
use crate::ports::{OutboxError, OutboxRepository, OutboxStats, OutboxTransaction};

const COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, tenant_id, metadata, \
     status, retry_count, created_at, published_at, lease_expires_at, processor_id, last_error, \
     next_attempt_at";

#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run a claim-protected update; zero affected rows means the claim was lost.
    async fn update_claimed(&self, id: Uuid, query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>) -> Result<(), OutboxError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| storage("update outbox row", e))?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::ClaimConflict(id));
        }
        Ok(())
    }
}

fn storage(action: &str, e: sqlx::Error) -> OutboxError {
    OutboxError::Storage(format!("Failed to {}: {}", action, e))
}

#[async_trait]
impl<'c> OutboxTransaction for Transaction<'c, Postgres> {
    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_type, aggregate_id, event_type, payload, tenant_id, metadata,
                status, retry_count, created_at, next_attempt_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.tenant_id)
        .bind(Json(&event.metadata))
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.created_at.as_datetime())
        .bind(event.next_attempt_at.as_datetime())
        .execute(&mut **self)
        .await
        .map_err(|e| storage("insert outbox event", e))?;

        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn claim_batch(
        &self,
        processor_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id FROM outbox_events
                WHERE (status = 'PENDING' AND next_attempt_at <= NOW())
                   OR (status = 'PROCESSING' AND lease_expires_at < NOW())
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET status = 'PROCESSING',
                processor_id = $1,
                lease_expires_at = NOW() + make_interval(secs => $3)
            FROM due
            WHERE o.id = due.id
            RETURNING {}
            "#,
            COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query(&sql)
            .bind(processor_id)
            .bind(limit as i64)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("claim outbox rows", e))?;

        let mut claimed = rows
            .into_iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, processor_id: &str) -> Result<(), OutboxError> {
        self.update_claimed(
            id,
            sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'PUBLISHED', published_at = NOW(),
                    processor_id = NULL, lease_expires_at = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND processor_id = $2
                "#,
            )
            .bind(id)
            .bind(processor_id),
        )
        .await
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        processor_id: &str,
        error: &str,
        next_attempt_at: Timestamp,
    ) -> Result<(), OutboxError> {
        self.update_claimed(
            id,
            sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'PENDING', retry_count = retry_count + 1, last_error = $3,
                    next_attempt_at = $4, processor_id = NULL, lease_expires_at = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND processor_id = $2
                "#,
            )
            .bind(id)
            .bind(processor_id)
            .bind(error)
            .bind(*next_attempt_at.as_datetime()),
        )
        .await
    }

    async fn mark_dead(&self, id: Uuid, processor_id: &str, error: &str) -> Result<(), OutboxError> {
        self.update_claimed(
            id,
            sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'DEAD', retry_count = retry_count + 1, last_error = $3,
                    processor_id = NULL, lease_expires_at = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND processor_id = $2
                "#,
            )
            .bind(id)
            .bind(processor_id)
            .bind(error),
        )
        .await
    }

    async fn mark_failed(&self, id: Uuid, processor_id: &str, error: &str) -> Result<(), OutboxError> {
        self.update_claimed(
            id,
            sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'FAILED', last_error = $3,
                    processor_id = NULL, lease_expires_at = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND processor_id = $2
                "#,
            )
            .bind(id)
            .bind(processor_id)
            .bind(error),
        )
        .await
    }

    async fn release(&self, id: Uuid, processor_id: &str) -> Result<(), OutboxError> {
        self.update_claimed(
            id,
            sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'PENDING', processor_id = NULL, lease_expires_at = NULL
                WHERE id = $1 AND status = 'PROCESSING' AND processor_id = $2
                "#,
            )
            .bind(id)
            .bind(processor_id),
        )
        .await
    }

    async fn reset_stuck(&self) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', processor_id = NULL, lease_expires_at = NULL
            WHERE status = 'PROCESSING' AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| storage("reset stuck outbox rows", e))?;

        Ok(result.rows_affected())
    }

    async fn delete_published_before(&self, cutoff: Timestamp) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'PUBLISHED' AND published_at < $1",
        )
        .bind(*cutoff.as_datetime())
        .execute(&self.pool)
        .await
        .map_err(|e| storage("delete published outbox rows", e))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage("count outbox rows", e))?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => stats.pending = count,
                Ok(OutboxStatus::Processing) => stats.processing = count,
                Ok(OutboxStatus::Published) => stats.published = count,
                Ok(OutboxStatus::Failed) => stats.failed = count,
                Ok(OutboxStatus::Dead) => stats.dead = count,
                Err(_) => tracing::warn!(status = %status, "Unknown outbox status in table"),
            }
        }
        Ok(stats)
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        let sql = format!("SELECT {} FROM outbox_events WHERE id = $1", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("fetch outbox row", e))?;

        row.map(row_to_event).transpose()
    }
}

fn row_to_event(row: PgRow) -> Result<OutboxEvent, OutboxError> {
    let decode = |e: sqlx::Error| storage("decode outbox row", e);

    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<OutboxStatus>()
        .map_err(|e| OutboxError::Storage(format!("Invalid outbox status: {}", e)))?;
    let metadata: Json<EventMetadata> = row.try_get("metadata").map_err(decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;
    let created_at: chrono::DateTime<chrono::Utc> = row.try_get("created_at").map_err(decode)?;
    let published_at: Option<chrono::DateTime<chrono::Utc>> =
        row.try_get("published_at").map_err(decode)?;
    let lease_expires_at: Option<chrono::DateTime<chrono::Utc>> =
        row.try_get("lease_expires_at").map_err(decode)?;
    let next_attempt_at: chrono::DateTime<chrono::Utc> =
        row.try_get("next_attempt_at").map_err(decode)?;

    Ok(OutboxEvent {
        id: row.try_get("id").map_err(decode)?,
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        aggregate_id: row.try_get("aggregate_id").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        tenant_id: row.try_get("tenant_id").map_err(decode)?,
        metadata: metadata.0,
        status,
        retry_count: retry_count.max(0) as u32,
        created_at: Timestamp::from_datetime(created_at),
        published_at: published_at.map(Timestamp::from_datetime),
        lease_expires_at: lease_expires_at.map(Timestamp::from_datetime),
        processor_id: row.try_get("processor_id").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        next_attempt_at: Timestamp::from_datetime(next_attempt_at),
    })
}
