//! Database query functions for the `execution_queue` table.
//!
//! Dequeue and failure handling are the contended paths: they are written as
//! single atomic statements (dequeue uses `FOR UPDATE SKIP LOCKED`) so that
//! independent workers never block on, or double-take, the same row.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{QueueItem, SlaClass};

/// Insert a new pending queue row for an execution.
pub async fn enqueue(
    pool: &PgPool,
    execution_id: Uuid,
    priority: i32,
    sla_class: SlaClass,
    max_attempts: i32,
    visibility_timeout_seconds: i32,
) -> Result<QueueItem> {
    let item = sqlx::query_as::<_, QueueItem>(
        "INSERT INTO execution_queue (execution_id, priority, sla_class, max_attempts, \
                                      visibility_timeout_seconds) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(priority)
    .bind(sla_class)
    .bind(max_attempts)
    .bind(visibility_timeout_seconds)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to enqueue execution {execution_id}"))?;

    Ok(item)
}

/// Atomically claim up to `batch` available items under a fresh lease.
///
/// An item is available when it is pending, its lease is absent or expired,
/// and it has attempts remaining. Selection is ordered by
/// `(priority ASC, enqueued_at ASC)` with `SKIP LOCKED` so concurrent
/// dequeues never hand the same row to two workers.
pub async fn dequeue_batch(
    pool: &PgPool,
    lease_token: Uuid,
    lease_duration_seconds: i64,
    batch: i64,
) -> Result<Vec<QueueItem>> {
    let lease_expires_at: DateTime<Utc> = Utc::now() + Duration::seconds(lease_duration_seconds);

    let items = sqlx::query_as::<_, QueueItem>(
        "WITH available AS ( \
             SELECT id FROM execution_queue \
             WHERE status = 'pending' \
               AND (lease_expires_at IS NULL OR lease_expires_at < NOW()) \
               AND attempt_count < max_attempts \
             ORDER BY priority ASC, enqueued_at ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE execution_queue q \
         SET status = 'processing', \
             lease_token = $2, \
             lease_expires_at = $3, \
             dequeued_at = NOW() \
         FROM available a \
         WHERE q.id = a.id \
         RETURNING q.*",
    )
    .bind(batch)
    .bind(lease_token)
    .bind(lease_expires_at)
    .fetch_all(pool)
    .await
    .context("failed to dequeue queue items")?;

    Ok(items)
}

/// Extend the lease on a processing item. Only succeeds when the caller's
/// token matches, proving current ownership.
pub async fn renew_lease(
    pool: &PgPool,
    queue_id: Uuid,
    lease_token: Uuid,
    lease_duration_seconds: i64,
) -> Result<bool> {
    let lease_expires_at: DateTime<Utc> = Utc::now() + Duration::seconds(lease_duration_seconds);

    let result = sqlx::query(
        "UPDATE execution_queue \
         SET lease_expires_at = $1 \
         WHERE id = $2 AND lease_token = $3 AND status = 'processing'",
    )
    .bind(lease_expires_at)
    .bind(queue_id)
    .bind(lease_token)
    .execute(pool)
    .await
    .context("failed to renew lease")?;

    Ok(result.rows_affected() > 0)
}

/// Mark a processing item completed. The lease token must still match.
///
/// Returns the number of rows affected; 0 means the caller no longer holds
/// the lease (or the item is gone).
pub async fn complete(pool: &PgPool, queue_id: Uuid, lease_token: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_queue \
         SET status = 'completed', \
             completed_at = NOW(), \
             lease_token = NULL, \
             lease_expires_at = NULL \
         WHERE id = $1 AND lease_token = $2 AND status = 'processing'",
    )
    .bind(queue_id)
    .bind(lease_token)
    .execute(pool)
    .await
    .context("failed to complete queue item")?;

    Ok(result.rows_affected())
}

/// Return an item to `pending` for another attempt, recording the error and
/// bumping the attempt counter.
pub async fn fail_retry(pool: &PgPool, queue_id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_queue \
         SET status = 'pending', \
             attempt_count = attempt_count + 1, \
             last_error = $1, \
             lease_token = NULL, \
             lease_expires_at = NULL \
         WHERE id = $2 AND status = 'processing'",
    )
    .bind(error_message)
    .bind(queue_id)
    .execute(pool)
    .await
    .context("failed to return queue item for retry")?;

    Ok(result.rows_affected())
}

/// Terminally fail an item and copy its snapshot into the dead-letter table,
/// in one transaction.
pub async fn fail_to_dlq(pool: &PgPool, queue_id: Uuid, error_message: &str) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let updated = sqlx::query(
        "UPDATE execution_queue \
         SET status = 'failed', \
             attempt_count = attempt_count + 1, \
             last_error = $1, \
             lease_token = NULL, \
             lease_expires_at = NULL \
         WHERE id = $2",
    )
    .bind(error_message)
    .bind(queue_id)
    .execute(&mut *tx)
    .await
    .context("failed to mark queue item failed")?;

    if updated.rows_affected() == 0 {
        anyhow::bail!("queue item {queue_id} not found");
    }

    sqlx::query(
        "INSERT INTO execution_dlq (execution_id, original_queue_id, failure_reason, \
                                    attempt_count, original_priority, original_sla_class) \
         SELECT execution_id, id, $1, attempt_count, priority, sla_class \
         FROM execution_queue \
         WHERE id = $2",
    )
    .bind(error_message)
    .bind(queue_id)
    .execute(&mut *tx)
    .await
    .context("failed to insert dead-letter row")?;

    tx.commit().await.context("failed to commit DLQ move")?;
    Ok(())
}

/// Fetch a single queue item by ID.
pub async fn get_item(pool: &PgPool, queue_id: Uuid) -> Result<Option<QueueItem>> {
    let item = sqlx::query_as::<_, QueueItem>("SELECT * FROM execution_queue WHERE id = $1")
        .bind(queue_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch queue item")?;

    Ok(item)
}

/// Fetch the most recent queue item for an execution, if any.
pub async fn get_item_for_execution(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Option<QueueItem>> {
    let item = sqlx::query_as::<_, QueueItem>(
        "SELECT * FROM execution_queue \
         WHERE execution_id = $1 \
         ORDER BY enqueued_at DESC LIMIT 1",
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch queue item for execution")?;

    Ok(item)
}

/// Revert processing items whose lease has lapsed back to `pending`.
/// Returns the number of leases reaped.
pub async fn reap_stale_leases(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_queue \
         SET status = 'pending', \
             lease_token = NULL, \
             lease_expires_at = NULL \
         WHERE status = 'processing' AND lease_expires_at < NOW()",
    )
    .execute(pool)
    .await
    .context("failed to reap stale leases")?;

    Ok(result.rows_affected())
}

/// Per-status queue statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatusStats {
    pub status: String,
    pub count: i64,
    pub avg_attempts: f64,
}

/// Aggregate item counts and average attempts per status.
pub async fn stats(pool: &PgPool) -> Result<Vec<QueueStatusStats>> {
    let rows: Vec<(String, i64, Option<f64>)> = sqlx::query_as(
        "SELECT status::text, COUNT(*), AVG(attempt_count)::float8 \
         FROM execution_queue \
         GROUP BY status \
         ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to aggregate queue stats")?;

    Ok(rows
        .into_iter()
        .map(|(status, count, avg_attempts)| QueueStatusStats {
            status,
            count,
            avg_attempts: avg_attempts.unwrap_or(0.0),
        })
        .collect())
}
