//! Lookup for the migration-seeded `timeout_policies` matrix.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{ActionClass, SlaClass, TimeoutPolicy};

/// Fetch the timeout policy for one (SLA class, action class) cell.
///
/// The matrix is seeded at migration time and read-only at runtime; a
/// missing cell means the database was initialized incorrectly.
pub async fn get_timeout_policy(
    pool: &PgPool,
    sla_class: SlaClass,
    action_class: ActionClass,
) -> Result<Option<TimeoutPolicy>> {
    let policy = sqlx::query_as::<_, TimeoutPolicy>(
        "SELECT * FROM timeout_policies \
         WHERE sla_class = $1 AND action_class = $2",
    )
    .bind(sla_class)
    .bind(action_class)
    .fetch_optional(pool)
    .await
    .context("failed to fetch timeout policy")?;

    Ok(policy)
}

/// Fetch the whole policy matrix.
pub async fn list_policies(pool: &PgPool) -> Result<Vec<TimeoutPolicy>> {
    let policies = sqlx::query_as::<_, TimeoutPolicy>(
        "SELECT * FROM timeout_policies ORDER BY sla_class, action_class",
    )
    .fetch_all(pool)
    .await
    .context("failed to list timeout policies")?;

    Ok(policies)
}
