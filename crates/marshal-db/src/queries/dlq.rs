//! Database query functions for the `execution_dlq` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DlqItem;

/// List dead-letter items, newest failures first, optionally filtered by
/// requeued flag.
pub async fn list_items(
    pool: &PgPool,
    limit: i64,
    offset: i64,
    requeued: Option<bool>,
) -> Result<Vec<DlqItem>> {
    let items = match requeued {
        Some(requeued) => {
            sqlx::query_as::<_, DlqItem>(
                "SELECT * FROM execution_dlq \
                 WHERE requeued = $1 \
                 ORDER BY failed_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(requeued)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, DlqItem>(
                "SELECT * FROM execution_dlq \
                 ORDER BY failed_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list dead-letter items")?;

    Ok(items)
}

/// Fetch a single dead-letter item by ID.
pub async fn get_item(pool: &PgPool, dlq_id: Uuid) -> Result<Option<DlqItem>> {
    let item = sqlx::query_as::<_, DlqItem>("SELECT * FROM execution_dlq WHERE id = $1")
        .bind(dlq_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dead-letter item")?;

    Ok(item)
}

/// Requeue a dead-letter item: insert a fresh pending queue row, mark the
/// DLQ row requeued, and reset the execution to `queued` -- atomically.
///
/// Returns the new queue row's ID, or `None` when the item was already
/// requeued (optimistic check inside the transaction).
pub async fn requeue(
    pool: &PgPool,
    dlq_id: Uuid,
    max_attempts: i32,
    reset_attempts: bool,
) -> Result<Option<Uuid>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let item = sqlx::query_as::<_, DlqItem>(
        "SELECT * FROM execution_dlq WHERE id = $1 AND requeued = FALSE FOR UPDATE",
    )
    .bind(dlq_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to lock dead-letter item")?;

    let Some(item) = item else {
        return Ok(None);
    };

    let attempt_count = if reset_attempts { 0 } else { item.attempt_count };

    let (queue_id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO execution_queue (execution_id, priority, sla_class, attempt_count, \
                                      max_attempts, last_error) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING id",
    )
    .bind(item.execution_id)
    .bind(item.original_priority)
    .bind(item.original_sla_class)
    .bind(attempt_count)
    .bind(max_attempts)
    .bind(&item.failure_reason)
    .fetch_one(&mut *tx)
    .await
    .context("failed to reinsert queue row")?;

    sqlx::query(
        "UPDATE execution_dlq \
         SET requeued = TRUE, requeued_at = NOW() \
         WHERE id = $1",
    )
    .bind(dlq_id)
    .execute(&mut *tx)
    .await
    .context("failed to mark dead-letter item requeued")?;

    sqlx::query(
        "UPDATE executions \
         SET previous_status = status, \
             status = 'queued', \
             status_changed_at = NOW(), \
             completed_at = NULL, \
             error_message = NULL \
         WHERE id = $1",
    )
    .bind(item.execution_id)
    .execute(&mut *tx)
    .await
    .context("failed to reset execution status")?;

    tx.commit().await.context("failed to commit requeue")?;
    Ok(Some(queue_id))
}

/// Mark unarchived items older than the cutoff as archived.
/// Returns the number of items archived.
pub async fn archive_older_than(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_dlq \
         SET archived = TRUE, archived_at = NOW() \
         WHERE failed_at < $1 AND archived = FALSE",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to archive dead-letter items")?;

    Ok(result.rows_affected())
}

/// Aggregate DLQ statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DlqStats {
    pub total: i64,
    pub requeued: i64,
    pub archived: i64,
    pub last_24h: i64,
    pub last_7d: i64,
}

/// Counts over the whole dead-letter table.
pub async fn stats(pool: &PgPool) -> Result<DlqStats> {
    let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE requeued), \
                COUNT(*) FILTER (WHERE archived), \
                COUNT(*) FILTER (WHERE failed_at > NOW() - INTERVAL '24 hours'), \
                COUNT(*) FILTER (WHERE failed_at > NOW() - INTERVAL '7 days') \
         FROM execution_dlq",
    )
    .fetch_one(pool)
    .await
    .context("failed to aggregate dead-letter stats")?;

    Ok(DlqStats {
        total: row.0,
        requeued: row.1,
        archived: row.2,
        last_24h: row.3,
        last_7d: row.4,
    })
}

/// The most frequent failure reasons among unarchived items.
pub async fn failure_reasons(pool: &PgPool, limit: i64) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT failure_reason, COUNT(*) \
         FROM execution_dlq \
         WHERE archived = FALSE \
         GROUP BY failure_reason \
         ORDER BY COUNT(*) DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to aggregate failure reasons")?;

    Ok(rows)
}
