//! The queue manager: lease-based priority dispatch over the persistence
//! layer.

pub mod dlq;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use marshal_db::models::{QueueItem, SlaClass};
use marshal_db::queries::queue;

use crate::config::CoreConfig;

/// A claimed queue item plus the lease token proving ownership. Every
/// state-changing call for this item must present the token.
#[derive(Debug, Clone)]
pub struct LeasedItem {
    pub item: QueueItem,
    pub lease_token: Uuid,
}

/// Durable priority queue with lease semantics.
pub struct QueueManager {
    pool: PgPool,
    config: Arc<CoreConfig>,
}

impl QueueManager {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>) -> Self {
        Self { pool, config }
    }

    /// Enqueue an execution for background processing.
    ///
    /// Priority defaults from the SLA class (1 highest, 10 lowest) and
    /// `max_attempts` is derived from it (fast=2, medium=3, long=5).
    pub async fn enqueue(
        &self,
        execution_id: Uuid,
        priority: Option<i32>,
        sla_class: SlaClass,
        visibility_timeout: Option<i32>,
    ) -> Result<QueueItem> {
        let priority = priority.unwrap_or_else(|| self.config.priority(sla_class));
        let max_attempts = self.config.max_attempts(sla_class);
        let visibility = visibility_timeout.unwrap_or(self.config.visibility_timeout_seconds);

        let item = queue::enqueue(
            &self.pool,
            execution_id,
            priority,
            sla_class,
            max_attempts,
            visibility,
        )
        .await?;

        info!(
            execution_id = %execution_id,
            queue_id = %item.id,
            priority,
            %sla_class,
            "execution enqueued"
        );
        Ok(item)
    }

    /// Claim up to `batch` available items for a worker under one fresh
    /// lease token.
    pub async fn dequeue(&self, worker_id: &str, batch: i64) -> Result<Vec<LeasedItem>> {
        let lease_token = Uuid::new_v4();
        let items = queue::dequeue_batch(
            &self.pool,
            lease_token,
            self.config.lease_duration_seconds,
            batch,
        )
        .await?;

        if !items.is_empty() {
            info!(
                worker_id,
                count = items.len(),
                lease = %lease_token,
                "dequeued items"
            );
        }

        Ok(items
            .into_iter()
            .map(|item| LeasedItem { item, lease_token })
            .collect())
    }

    /// Extend the lease on a claimed item. `false` means ownership is gone.
    pub async fn renew_lease(&self, queue_id: Uuid, lease_token: Uuid) -> Result<bool> {
        let renewed = queue::renew_lease(
            &self.pool,
            queue_id,
            lease_token,
            self.config.lease_duration_seconds,
        )
        .await?;
        if !renewed {
            warn!(queue_id = %queue_id, "lease renewal refused");
        }
        Ok(renewed)
    }

    /// Complete an item. Fails when the lease token no longer matches: the
    /// caller cannot prove ownership, so the work may be re-dispatched.
    pub async fn complete(&self, queue_id: Uuid, lease_token: Uuid) -> Result<()> {
        let rows = queue::complete(&self.pool, queue_id, lease_token).await?;
        if rows == 0 {
            anyhow::bail!("queue item {queue_id} not completed: lease token no longer matches");
        }
        info!(queue_id = %queue_id, "queue item completed");
        Ok(())
    }

    /// Report a failed attempt. With retry allowed and attempts remaining
    /// the item returns to pending; otherwise it is terminally failed and
    /// copied to the dead-letter table. Returns whether a retry will happen.
    pub async fn fail(&self, queue_id: Uuid, error_message: &str, retry: bool) -> Result<bool> {
        let item = queue::get_item(&self.pool, queue_id)
            .await?
            .with_context(|| format!("queue item {queue_id} not found"))?;

        let will_retry = retry && item.attempt_count + 1 < item.max_attempts;

        if will_retry {
            queue::fail_retry(&self.pool, queue_id, error_message).await?;
            info!(
                queue_id = %queue_id,
                attempt = item.attempt_count + 1,
                max_attempts = item.max_attempts,
                "queue item will be retried"
            );
        } else {
            queue::fail_to_dlq(&self.pool, queue_id, error_message).await?;
            warn!(
                queue_id = %queue_id,
                attempts = item.attempt_count + 1,
                "queue item moved to dead-letter queue"
            );
        }

        Ok(will_retry)
    }

    /// Return expired processing items to pending. Idempotent; run
    /// periodically by pool maintenance.
    pub async fn reap_stale_leases(&self) -> Result<u64> {
        let reaped = queue::reap_stale_leases(&self.pool).await?;
        if reaped > 0 {
            warn!(reaped, "reaped stale queue leases");
        }
        Ok(reaped)
    }

    /// Per-status counts and average attempts.
    pub async fn stats(&self) -> Result<Vec<queue::QueueStatusStats>> {
        queue::stats(&self.pool).await
    }
}
