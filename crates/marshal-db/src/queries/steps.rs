//! Database query functions for the `execution_steps` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionStep, StepStatus};

/// Parameters for inserting a new step row.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub execution_id: Uuid,
    pub step_index: i32,
    pub step_name: String,
    pub step_type: String,
    pub target_asset_id: Option<String>,
    pub target_hostname: Option<String>,
    pub input_data: serde_json::Value,
    pub max_retries: i32,
}

/// Insert a new step row. Returns the inserted step with server-generated
/// defaults (id, status, attempt).
pub async fn insert_step(pool: &PgPool, new: &NewStep) -> Result<ExecutionStep> {
    let step = sqlx::query_as::<_, ExecutionStep>(
        "INSERT INTO execution_steps (execution_id, step_index, step_name, step_type, \
                                      target_asset_id, target_hostname, input_data, max_retries) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.execution_id)
    .bind(new.step_index)
    .bind(&new.step_name)
    .bind(&new.step_type)
    .bind(&new.target_asset_id)
    .bind(&new.target_hostname)
    .bind(&new.input_data)
    .bind(new.max_retries)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert step {} for execution {}",
            new.step_index, new.execution_id
        )
    })?;

    Ok(step)
}

/// List all steps for an execution in `step_index` order.
pub async fn list_steps(pool: &PgPool, execution_id: Uuid) -> Result<Vec<ExecutionStep>> {
    let steps = sqlx::query_as::<_, ExecutionStep>(
        "SELECT * FROM execution_steps WHERE execution_id = $1 ORDER BY step_index ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list execution steps")?;

    Ok(steps)
}

/// Mark a step running: stamps `started_at` and increments the attempt
/// counter.
pub async fn mark_running(pool: &PgPool, step_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE execution_steps \
         SET status = 'running', \
             attempt = attempt + 1, \
             started_at = COALESCE(started_at, NOW()) \
         WHERE id = $1",
    )
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to mark step running")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("step {step_id} not found");
    }

    Ok(())
}

/// Record a step outcome: terminal status, output, error, and duration.
pub async fn record_outcome(
    pool: &PgPool,
    step_id: Uuid,
    status: StepStatus,
    output_data: Option<&serde_json::Value>,
    error_message: Option<&str>,
    duration_ms: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE execution_steps \
         SET status = $1, \
             output_data = $2, \
             error_message = $3, \
             duration_ms = $4, \
             completed_at = NOW() \
         WHERE id = $5",
    )
    .bind(status)
    .bind(output_data)
    .bind(error_message)
    .bind(duration_ms)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to record step outcome")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("step {step_id} not found");
    }

    Ok(())
}

/// Mark every still-pending step at or after `from_index` as skipped.
///
/// Used when a critical step fails and the remainder of the plan is
/// abandoned. Returns the number of steps skipped.
pub async fn skip_remaining(pool: &PgPool, execution_id: Uuid, from_index: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_steps \
         SET status = 'skipped', completed_at = NOW() \
         WHERE execution_id = $1 AND step_index >= $2 AND status = 'pending'",
    )
    .bind(execution_id)
    .bind(from_index)
    .execute(pool)
    .await
    .context("failed to skip remaining steps")?;

    Ok(result.rows_affected())
}

/// Return skipped steps to pending ahead of a fresh attempt, so steps
/// abandoned by a critical abort run if the retry gets past it.
pub async fn reset_skipped(pool: &PgPool, execution_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE execution_steps \
         SET status = 'pending', completed_at = NULL \
         WHERE execution_id = $1 AND status = 'skipped'",
    )
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to reset skipped steps")?;

    Ok(result.rows_affected())
}

/// Counts of steps per status for an execution.
#[derive(Debug, Clone, Default)]
pub struct StepCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total: i64,
}

/// Aggregate step counts by status for an execution.
pub async fn step_counts(pool: &PgPool, execution_id: Uuid) -> Result<StepCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) \
         FROM execution_steps \
         WHERE execution_id = $1 \
         GROUP BY status",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to aggregate step counts")?;

    let mut counts = StepCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "running" => counts.running = *count,
            "completed" => counts.completed = *count,
            "failed" => counts.failed = *count,
            "skipped" => counts.skipped = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
