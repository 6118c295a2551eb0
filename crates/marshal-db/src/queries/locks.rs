//! Database query functions for the `asset_locks` table.
//!
//! The partial unique index on `(asset_id, tenant_id) WHERE is_active` makes
//! the INSERT itself the acquisition: at most one active row can exist per
//! asset and tenant, so a conflicting insert simply affects zero rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AssetLock;

/// Attempt to acquire the lock on an asset.
///
/// Returns the lock ID on success, or `None` when another execution holds an
/// active lock on the same (asset, tenant).
pub async fn try_acquire(
    pool: &PgPool,
    asset_id: &str,
    tenant_id: &str,
    execution_id: Uuid,
    owner_tag: &str,
    lease_duration_seconds: i64,
) -> Result<Option<Uuid>> {
    let expires_at: DateTime<Utc> = Utc::now() + Duration::seconds(lease_duration_seconds);

    let row: Option<(Uuid,)> = sqlx::query_as(
        "INSERT INTO asset_locks (asset_id, tenant_id, execution_id, owner_tag, expires_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (asset_id, tenant_id) WHERE is_active DO NOTHING \
         RETURNING id",
    )
    .bind(asset_id)
    .bind(tenant_id)
    .bind(execution_id)
    .bind(owner_tag)
    .bind(expires_at)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to acquire lock on asset {asset_id}"))?;

    Ok(row.map(|(id,)| id))
}

/// Release a lock, scoped by (asset, tenant, execution).
///
/// Releasing a lock that is already inactive (or was never held) affects
/// zero rows; double release is a no-op.
pub async fn release(
    pool: &PgPool,
    asset_id: &str,
    tenant_id: &str,
    execution_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE asset_locks \
         SET is_active = FALSE \
         WHERE asset_id = $1 AND tenant_id = $2 AND execution_id = $3 AND is_active",
    )
    .bind(asset_id)
    .bind(tenant_id)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to release lock")?;

    Ok(result.rows_affected())
}

/// Refresh a lock's heartbeat, extending the lease.
///
/// Returns `false` when the lock is no longer active (e.g. it was reaped),
/// which the holder must treat as loss of ownership.
pub async fn heartbeat(
    pool: &PgPool,
    lock_id: Uuid,
    lease_duration_seconds: i64,
) -> Result<bool> {
    let expires_at: DateTime<Utc> = Utc::now() + Duration::seconds(lease_duration_seconds);

    let result = sqlx::query(
        "UPDATE asset_locks \
         SET last_heartbeat_at = NOW(), expires_at = $1 \
         WHERE id = $2 AND is_active",
    )
    .bind(expires_at)
    .bind(lock_id)
    .execute(pool)
    .await
    .context("failed to heartbeat lock")?;

    Ok(result.rows_affected() > 0)
}

/// Deactivate stale locks: expired leases, or heartbeats older than the
/// threshold. Optionally scoped to a single asset. Returns the count reaped.
pub async fn reap_stale(
    pool: &PgPool,
    heartbeat_threshold_seconds: i64,
    asset_id: Option<&str>,
) -> Result<u64> {
    let threshold: DateTime<Utc> = Utc::now() - Duration::seconds(heartbeat_threshold_seconds);

    let result = match asset_id {
        Some(asset_id) => {
            sqlx::query(
                "UPDATE asset_locks \
                 SET is_active = FALSE \
                 WHERE is_active \
                   AND asset_id = $1 \
                   AND (expires_at < NOW() OR last_heartbeat_at < $2)",
            )
            .bind(asset_id)
            .bind(threshold)
            .execute(pool)
            .await
        }
        None => {
            sqlx::query(
                "UPDATE asset_locks \
                 SET is_active = FALSE \
                 WHERE is_active \
                   AND (expires_at < NOW() OR last_heartbeat_at < $1)",
            )
            .bind(threshold)
            .execute(pool)
            .await
        }
    }
    .context("failed to reap stale locks")?;

    Ok(result.rows_affected())
}

/// Fetch the active lock on an asset, if any.
pub async fn active_lock(
    pool: &PgPool,
    asset_id: &str,
    tenant_id: &str,
) -> Result<Option<AssetLock>> {
    let lock = sqlx::query_as::<_, AssetLock>(
        "SELECT * FROM asset_locks \
         WHERE asset_id = $1 AND tenant_id = $2 AND is_active",
    )
    .bind(asset_id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active lock")?;

    Ok(lock)
}

/// Release every active lock held by an execution. Returns the count.
pub async fn release_all_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE asset_locks \
         SET is_active = FALSE \
         WHERE execution_id = $1 AND is_active",
    )
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to release execution locks")?;

    Ok(result.rows_affected())
}
