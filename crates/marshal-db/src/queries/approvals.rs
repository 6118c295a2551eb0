//! Database query functions for the `approvals` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Approval, ApprovalState};

/// Insert a new pending approval for an execution.
pub async fn insert_approval(
    pool: &PgPool,
    execution_id: Uuid,
    approval_level: i32,
    plan_hash: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<Approval> {
    let approval = sqlx::query_as::<_, Approval>(
        "INSERT INTO approvals (execution_id, approval_level, plan_hash, expires_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(approval_level)
    .bind(plan_hash)
    .bind(expires_at)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert approval for execution {execution_id}"))?;

    Ok(approval)
}

/// Fetch a single approval by ID.
pub async fn get_approval(pool: &PgPool, approval_id: Uuid) -> Result<Option<Approval>> {
    let approval = sqlx::query_as::<_, Approval>("SELECT * FROM approvals WHERE id = $1")
        .bind(approval_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch approval")?;

    Ok(approval)
}

/// Fetch the most recent approval for an execution, if any.
pub async fn get_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<Option<Approval>> {
    let approval = sqlx::query_as::<_, Approval>(
        "SELECT * FROM approvals \
         WHERE execution_id = $1 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch approval for execution")?;

    Ok(approval)
}

/// Record an approval response. Only a still-pending approval can be
/// responded to (optimistic check on state). Returns rows affected.
pub async fn respond(
    pool: &PgPool,
    approval_id: Uuid,
    state: ApprovalState,
    approver_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE approvals \
         SET state = $1, approver_id = $2, responded_at = NOW() \
         WHERE id = $3 AND state = 'pending'",
    )
    .bind(state)
    .bind(approver_id)
    .bind(approval_id)
    .execute(pool)
    .await
    .context("failed to record approval response")?;

    Ok(result.rows_affected())
}

/// Expire a pending approval whose deadline has passed. Returns rows
/// affected (0 when it was already responded to or not yet due).
pub async fn expire_if_overdue(pool: &PgPool, approval_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE approvals \
         SET state = 'expired', responded_at = NOW() \
         WHERE id = $1 AND state = 'pending' \
           AND expires_at IS NOT NULL AND expires_at < NOW()",
    )
    .bind(approval_id)
    .execute(pool)
    .await
    .context("failed to expire approval")?;

    Ok(result.rows_affected())
}
