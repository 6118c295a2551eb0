//! Per-asset mutual exclusion across the worker fleet.
//!
//! A lock is a row in `asset_locks`; the partial unique index makes the
//! insert the acquisition. Holders heartbeat on a background task at an
//! interval well under the lease duration; locks whose holder stops
//! heartbeating (crashed worker, partitioned process) become reapable by
//! anyone.

use std::time::Duration;

use sqlx::PgPool;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marshal_db::queries::locks;

/// Lock acquisition failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock unavailable for asset {asset_id} after {waited_ms}ms")]
    Unavailable { asset_id: String, waited_ms: u128 },
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Configuration for the mutex guard.
#[derive(Debug, Clone)]
pub struct MutexConfig {
    pub lease_duration_seconds: i64,
    pub heartbeat_interval: Duration,
    pub stale_threshold_seconds: i64,
    pub retry_interval: Duration,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            lease_duration_seconds: 300,
            heartbeat_interval: Duration::from_secs(30),
            stale_threshold_seconds: 600,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Acquires and maintains per-asset locks.
pub struct AssetMutex {
    pool: PgPool,
    config: MutexConfig,
    owner_tag: String,
}

/// A held lock. Release explicitly with [`HeldLock::release`]; dropping the
/// guard aborts the heartbeat task but leaves the row to the stale-lock
/// reaper, so explicit release is always preferred.
#[derive(Debug)]
pub struct HeldLock {
    pool: PgPool,
    pub asset_id: String,
    tenant_id: String,
    execution_id: Uuid,
    lock_id: Uuid,
    heartbeat: Option<JoinHandle<()>>,
}

impl HeldLock {
    /// Release the lock. Double release (here or via a concurrent reap) is
    /// a no-op at the row level.
    pub async fn release(mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        match locks::release(&self.pool, &self.asset_id, &self.tenant_id, self.execution_id).await
        {
            Ok(rows) => {
                debug!(
                    asset_id = %self.asset_id,
                    execution_id = %self.execution_id,
                    already_released = rows == 0,
                    "lock released"
                );
            }
            Err(e) => {
                error!(
                    asset_id = %self.asset_id,
                    execution_id = %self.execution_id,
                    error = %e,
                    "failed to release lock"
                );
            }
        }
    }

    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl AssetMutex {
    pub fn new(pool: PgPool, config: MutexConfig, owner_tag: impl Into<String>) -> Self {
        Self {
            pool,
            config,
            owner_tag: owner_tag.into(),
        }
    }

    /// Acquire the lock on one asset, retrying with stale-lock reaping until
    /// the deadline.
    pub async fn acquire(
        &self,
        asset_id: &str,
        tenant_id: &str,
        execution_id: Uuid,
        wait: Duration,
    ) -> Result<HeldLock, LockError> {
        let started = Instant::now();
        let deadline = started + wait;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let acquired = locks::try_acquire(
                &self.pool,
                asset_id,
                tenant_id,
                execution_id,
                &self.owner_tag,
                self.config.lease_duration_seconds,
            )
            .await?;

            if let Some(lock_id) = acquired {
                info!(
                    asset_id,
                    execution_id = %execution_id,
                    attempt,
                    "asset lock acquired"
                );
                let heartbeat = self.spawn_heartbeat(lock_id, asset_id.to_owned());
                return Ok(HeldLock {
                    pool: self.pool.clone(),
                    asset_id: asset_id.to_owned(),
                    tenant_id: tenant_id.to_owned(),
                    execution_id,
                    lock_id,
                    heartbeat: Some(heartbeat),
                });
            }

            // The holder may be dead: reap anything stale on this asset
            // before the next try.
            match locks::reap_stale(&self.pool, self.config.stale_threshold_seconds, Some(asset_id))
                .await
            {
                Ok(reaped) if reaped > 0 => {
                    warn!(asset_id, reaped, "reaped stale locks while waiting");
                }
                Ok(_) => {}
                Err(e) => warn!(asset_id, error = %e, "stale lock reaping failed"),
            }

            if Instant::now() + self.config.retry_interval > deadline {
                return Err(LockError::Unavailable {
                    asset_id: asset_id.to_owned(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Acquire locks on several assets.
    ///
    /// Asset IDs are sorted (and deduplicated) first so every caller takes
    /// locks in the same total order; cycles cannot form. On any failure the
    /// already-held locks are released in reverse order.
    pub async fn acquire_many(
        &self,
        asset_ids: &[String],
        tenant_id: &str,
        execution_id: Uuid,
        wait: Duration,
    ) -> Result<Vec<HeldLock>, LockError> {
        let mut sorted: Vec<&String> = asset_ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for asset_id in sorted {
            match self.acquire(asset_id, tenant_id, execution_id, wait).await {
                Ok(lock) => held.push(lock),
                Err(e) => {
                    for lock in held.into_iter().rev() {
                        lock.release().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Reap stale locks across all assets. Run periodically by the pool's
    /// maintenance loop; idempotent.
    pub async fn reap_all_stale(&self) -> anyhow::Result<u64> {
        let reaped =
            locks::reap_stale(&self.pool, self.config.stale_threshold_seconds, None).await?;
        if reaped > 0 {
            warn!(reaped, "reaped stale asset locks");
        }
        Ok(reaped)
    }

    fn spawn_heartbeat(&self, lock_id: Uuid, asset_id: String) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let interval = self.config.heartbeat_interval;
        let lease = self.config.lease_duration_seconds;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match locks::heartbeat(&pool, lock_id, lease).await {
                    Ok(true) => {
                        debug!(lock_id = %lock_id, asset_id, "lock heartbeat sent");
                    }
                    Ok(false) => {
                        error!(lock_id = %lock_id, asset_id, "lock heartbeat lost ownership");
                        break;
                    }
                    Err(e) => {
                        error!(lock_id = %lock_id, asset_id, error = %e, "lock heartbeat failed");
                        break;
                    }
                }
            }
        })
    }
}
