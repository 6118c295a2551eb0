//! Duplicate submission detection.
//!
//! The idempotency key is a stable hash of (canonical plan, tenant, actor);
//! see [`crate::plan::canonical`]. A prior execution with the same key is a
//! duplicate when it is inside the deduplication window and did not end in
//! failure -- a failed, cancelled, or timed-out prior is a legitimate retry.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use marshal_db::models::{Execution, ExecutionStatus};
use marshal_db::queries::executions;

use crate::plan::canonical::idempotency_key;
use crate::plan::Plan;

/// Outcome of an idempotency check.
#[derive(Debug)]
pub struct IdempotencyOutcome {
    /// Set when the submission is a duplicate of an existing execution.
    pub existing: Option<Execution>,
    /// The derived key, reused for the insert when not a duplicate.
    pub idempotency_key: String,
}

/// Collapses duplicate submissions within a configurable window.
pub struct IdempotencyGuard {
    pool: PgPool,
    window_hours: i64,
}

impl IdempotencyGuard {
    pub fn new(pool: PgPool, window_hours: i64) -> Self {
        Self { pool, window_hours }
    }

    /// Check a submission against prior executions.
    ///
    /// Duplicate detection is a normal outcome, not an error: callers return
    /// the existing execution unchanged.
    pub async fn check(
        &self,
        plan: &Plan,
        tenant_id: &str,
        actor_id: &str,
    ) -> anyhow::Result<IdempotencyOutcome> {
        let key = idempotency_key(plan, tenant_id, actor_id);
        debug!(tenant_id, key = %&key[..16], "checking idempotency");

        let existing = self.find_live_duplicate(tenant_id, &key).await?;
        if let Some(execution) = &existing {
            info!(
                execution_id = %execution.id,
                status = %execution.status,
                "duplicate submission collapsed onto existing execution"
            );
        }

        Ok(IdempotencyOutcome {
            existing,
            idempotency_key: key,
        })
    }

    /// Re-run the duplicate lookup after an insert hit the unique index.
    /// Covers the race where two identical submissions pass the check
    /// concurrently; exactly one insert wins and the loser resolves here.
    pub async fn find_after_conflict(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> anyhow::Result<Option<Execution>> {
        executions::get_by_idempotency_key(&self.pool, tenant_id, key).await
    }

    async fn find_live_duplicate(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> anyhow::Result<Option<Execution>> {
        let Some(existing) =
            executions::get_by_idempotency_key(&self.pool, tenant_id, key).await?
        else {
            return Ok(None);
        };

        let cutoff = Utc::now() - Duration::hours(self.window_hours);
        if existing.created_at < cutoff {
            debug!(
                execution_id = %existing.id,
                created_at = %existing.created_at,
                "prior execution is outside the deduplication window"
            );
            return Ok(None);
        }

        // Unsuccessful terminal states do not dedup: the resubmission is a
        // retry.
        if matches!(
            existing.status,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled | ExecutionStatus::TimedOut
        ) {
            debug!(
                execution_id = %existing.id,
                status = %existing.status,
                "prior execution ended unsuccessfully; treating submission as retry"
            );
            return Ok(None);
        }

        Ok(Some(existing))
    }
}
