//! Database query functions for the `executions` table.
//!
//! Status changes use optimistic locking: the UPDATE's WHERE clause pins the
//! expected current status, so concurrent writers cannot race a row into an
//! inconsistent state and terminal statuses are never left.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Execution, ExecutionMode, ExecutionStatus, SlaClass};

/// Parameters for inserting a new execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub tenant_id: String,
    pub actor_id: String,
    pub idempotency_key: String,
    pub plan_snapshot: serde_json::Value,
    pub plan_hash: String,
    pub execution_mode: ExecutionMode,
    pub sla_class: SlaClass,
    pub approval_level: i32,
    pub status: ExecutionStatus,
    pub timeout_at: Option<DateTime<Utc>>,
    pub trace_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
    pub tags: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Insert a new execution row. Returns the inserted execution with
/// server-generated defaults (id, created_at, status_changed_at).
///
/// A unique violation on `(tenant_id, idempotency_key)` is surfaced as a
/// [`sqlx::Error::Database`] so callers can fall back to a duplicate lookup.
pub async fn insert_execution(
    pool: &PgPool,
    new: &NewExecution,
) -> Result<Execution, sqlx::Error> {
    sqlx::query_as::<_, Execution>(
        "INSERT INTO executions (tenant_id, actor_id, idempotency_key, plan_snapshot, \
                                 plan_hash, execution_mode, sla_class, approval_level, \
                                 status, timeout_at, trace_id, parent_execution_id, \
                                 tags, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         RETURNING *",
    )
    .bind(&new.tenant_id)
    .bind(&new.actor_id)
    .bind(&new.idempotency_key)
    .bind(&new.plan_snapshot)
    .bind(&new.plan_hash)
    .bind(new.execution_mode)
    .bind(new.sla_class)
    .bind(new.approval_level)
    .bind(new.status)
    .bind(new.timeout_at)
    .bind(new.trace_id)
    .bind(new.parent_execution_id)
    .bind(&new.tags)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
}

/// True when the error is a unique-constraint violation (Postgres 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution")?;

    Ok(execution)
}

/// Fetch an execution by its tenant-scoped idempotency key.
pub async fn get_by_idempotency_key(
    pool: &PgPool,
    tenant_id: &str,
    idempotency_key: &str,
) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE tenant_id = $1 AND idempotency_key = $2",
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch execution by idempotency key")?;

    Ok(execution)
}

/// List executions for a tenant, newest first, optionally filtered by status.
pub async fn list_executions(
    pool: &PgPool,
    tenant_id: &str,
    status: Option<ExecutionStatus>,
    limit: i64,
) -> Result<Vec<Execution>> {
    let executions = match status {
        Some(status) => {
            sqlx::query_as::<_, Execution>(
                "SELECT * FROM executions \
                 WHERE tenant_id = $1 AND status = $2 \
                 ORDER BY created_at DESC LIMIT $3",
            )
            .bind(tenant_id)
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Execution>(
                "SELECT * FROM executions \
                 WHERE tenant_id = $1 \
                 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list executions")?;

    Ok(executions)
}

/// Atomically transition an execution from one status to another.
///
/// Stamps `previous_status` and `status_changed_at`, sets `started_at` on
/// entry to `running` (first time only), and sets `completed_at` on entry to
/// a terminal status. Returns the number of rows affected (0 means the
/// current status did not match `from`).
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: ExecutionStatus,
    to: ExecutionStatus,
    error_message: Option<&str>,
) -> Result<u64> {
    let started_at = if to == ExecutionStatus::Running {
        Some(Utc::now())
    } else {
        None
    };
    let completed_at = if to.is_terminal() { Some(Utc::now()) } else { None };

    let result = sqlx::query(
        "UPDATE executions \
         SET status = $1, \
             previous_status = $2, \
             status_changed_at = NOW(), \
             started_at = COALESCE(started_at, $3), \
             completed_at = COALESCE($4, completed_at), \
             error_message = COALESCE($5, error_message) \
         WHERE id = $6 AND status = $7",
    )
    .bind(to)
    .bind(from.to_string())
    .bind(started_at)
    .bind(completed_at)
    .bind(error_message)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition execution status")?;

    Ok(result.rows_affected())
}

/// Move a non-terminal execution to a terminal status, whatever its current
/// non-terminal state. Used by cancellation and timeout paths where the
/// caller cannot know the exact current status.
///
/// Terminal rows are never touched, so terminal statuses stay monotonic.
/// Returns the number of rows affected (0 means the row was already
/// terminal or absent).
pub async fn finalize_status(
    pool: &PgPool,
    id: Uuid,
    to: ExecutionStatus,
    error_message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET previous_status = status, \
             status = $1, \
             status_changed_at = NOW(), \
             completed_at = NOW(), \
             error_message = COALESCE($2, error_message) \
         WHERE id = $3 \
           AND status IN ('pending_approval', 'approved', 'queued', 'running')",
    )
    .bind(to)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finalize execution status")?;

    Ok(result.rows_affected())
}

/// Store the aggregated result payload of an execution.
pub async fn update_result(
    pool: &PgPool,
    id: Uuid,
    result: &serde_json::Value,
    error_message: Option<&str>,
    error_details: Option<&serde_json::Value>,
) -> Result<()> {
    let outcome = sqlx::query(
        "UPDATE executions \
         SET result = $1, error_message = $2, error_details = $3 \
         WHERE id = $4",
    )
    .bind(result)
    .bind(error_message)
    .bind(error_details)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update execution result")?;

    if outcome.rows_affected() == 0 {
        anyhow::bail!("execution {id} not found");
    }

    Ok(())
}

/// Free an idempotency key held by a terminal execution by re-keying the old
/// row to a unique superseded form.
///
/// Called when a resubmission is legitimately *not* a duplicate (the prior
/// failed, was cancelled, timed out, or fell outside the deduplication
/// window) but its row still owns the key under the unique index. Only
/// terminal rows are re-keyed. Returns rows affected.
pub async fn supersede_idempotency_key(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET idempotency_key = idempotency_key || ':superseded:' || id::text \
         WHERE id = $1 \
           AND status IN ('completed', 'partial', 'failed', 'cancelled', 'timed_out') \
           AND idempotency_key NOT LIKE '%:superseded:%'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to supersede idempotency key")?;

    Ok(result.rows_affected())
}

/// Executions whose `timeout_at` has passed but which are still live.
/// The timeout sweeper cancels these.
pub async fn list_overdue(pool: &PgPool, limit: i64) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions \
         WHERE timeout_at IS NOT NULL \
           AND timeout_at < NOW() \
           AND status IN ('approved', 'queued', 'running') \
         ORDER BY timeout_at ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list overdue executions")?;

    Ok(executions)
}
