//! Dead-letter queue operations: inspection, requeue, and archival.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use marshal_db::models::DlqItem;
use marshal_db::queries::dlq;

use crate::config::CoreConfig;

/// Operator-facing handler for dead-lettered work.
pub struct DlqHandler {
    pool: PgPool,
    config: Arc<CoreConfig>,
}

impl DlqHandler {
    pub fn new(pool: PgPool, config: Arc<CoreConfig>) -> Self {
        Self { pool, config }
    }

    /// List items, newest failures first. `requeued` filters when set.
    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
        requeued: Option<bool>,
    ) -> Result<Vec<DlqItem>> {
        dlq::list_items(&self.pool, limit, offset, requeued).await
    }

    pub async fn get(&self, dlq_id: Uuid) -> Result<Option<DlqItem>> {
        dlq::get_item(&self.pool, dlq_id).await
    }

    /// Put a dead-lettered execution back on the queue.
    ///
    /// The fresh queue row keeps the original priority and SLA class; its
    /// attempt budget comes from the SLA class again. Returns the new queue
    /// ID, or `None` when the item was already requeued.
    pub async fn requeue(&self, dlq_id: Uuid, reset_attempts: bool) -> Result<Option<Uuid>> {
        let Some(item) = dlq::get_item(&self.pool, dlq_id).await? else {
            warn!(dlq_id = %dlq_id, "dead-letter item not found");
            return Ok(None);
        };

        let max_attempts = self.config.max_attempts(item.original_sla_class);
        let queue_id = dlq::requeue(&self.pool, dlq_id, max_attempts, reset_attempts).await?;

        match queue_id {
            Some(queue_id) => {
                info!(
                    dlq_id = %dlq_id,
                    execution_id = %item.execution_id,
                    queue_id = %queue_id,
                    "dead-letter item requeued"
                );
            }
            None => warn!(dlq_id = %dlq_id, "dead-letter item was already requeued"),
        }
        Ok(queue_id)
    }

    /// Archive items older than the configured retention. Returns the count.
    pub async fn archive_old(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.dlq_archive_after_days);
        let archived = dlq::archive_older_than(&self.pool, cutoff).await?;
        if archived > 0 {
            info!(archived, "archived old dead-letter items");
        }
        Ok(archived)
    }

    pub async fn stats(&self) -> Result<dlq::DlqStats> {
        dlq::stats(&self.pool).await
    }

    /// The most frequent failure reasons among unarchived items.
    pub async fn failure_reasons(&self, limit: i64) -> Result<Vec<(String, i64)>> {
        dlq::failure_reasons(&self.pool, limit).await
    }
}
