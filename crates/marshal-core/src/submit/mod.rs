//! The front door: from a submitted plan to a routed execution.
//!
//! Submission order is fixed: validate, idempotency check, SLA and mode
//! classification, timeout policy lookup, execution record creation, then
//! either the approval gate or routing (inline for the fast class, queued
//! otherwise).

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use marshal_db::models::{
    ApprovalState, Execution, ExecutionMode, ExecutionStatus, SlaClass,
};
use marshal_db::queries::events::{self, NewEvent};
use marshal_db::queries::{approvals, executions, policies};

use crate::config::CoreConfig;
use crate::engine::Engine;
use crate::monitor::{self, EventBus, Progress};
use crate::plan::canonical::plan_hash;
use crate::plan::{Plan, PlanError};
use crate::queue::QueueManager;
use crate::safety::cancellation::{CancelReason, CancellationManager};
use crate::safety::idempotency::IdempotencyGuard;
use crate::safety::timeout::{plan_action_class, TimeoutEnforcer};

/// A submission as received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub plan: serde_json::Value,
    #[serde(default)]
    pub approval_level: i32,
    #[serde(default)]
    pub trace_id: Option<Uuid>,
    #[serde(default)]
    pub parent_execution_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Submission and approval failures surfaced to clients.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid plan: {0}")]
    Validation(#[from] PlanError),
    #[error("approval {0} not found")]
    ApprovalNotFound(Uuid),
    #[error("approval {0} was already resolved")]
    ApprovalResolved(Uuid),
    #[error("plan changed since approval was requested")]
    PlanHashMismatch,
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Execution plus derived step progress, the standard read-side view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionView {
    #[serde(flatten)]
    pub execution: Execution,
    pub progress: Progress,
}

/// Accepts plans and drives them to a runnable state.
pub struct Submitter {
    pool: PgPool,
    config: Arc<CoreConfig>,
    idempotency: IdempotencyGuard,
    engine: Arc<Engine>,
    queue: Arc<QueueManager>,
    cancellations: Arc<CancellationManager>,
    timeouts: Arc<TimeoutEnforcer>,
    bus: Arc<EventBus>,
}

impl Submitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        config: Arc<CoreConfig>,
        engine: Arc<Engine>,
        queue: Arc<QueueManager>,
        cancellations: Arc<CancellationManager>,
        timeouts: Arc<TimeoutEnforcer>,
        bus: Arc<EventBus>,
    ) -> Self {
        let idempotency = IdempotencyGuard::new(pool.clone(), config.deduplication_window_hours);
        Self {
            pool,
            config,
            idempotency,
            engine,
            queue,
            cancellations,
            timeouts,
            bus,
        }
    }

    /// Submit a plan. Returns the resulting execution -- fresh, or the
    /// existing one when the submission is a duplicate.
    pub async fn submit(
        &self,
        request: &SubmitRequest,
        tenant_id: &str,
        actor_id: &str,
    ) -> Result<Execution, SubmitError> {
        let plan = Plan::from_value(&request.plan)?;

        let outcome = self.idempotency.check(&plan, tenant_id, actor_id).await?;
        if let Some(existing) = outcome.existing {
            return Ok(existing);
        }

        // Classification: estimated duration -> SLA class -> mode.
        let estimate = plan.steps.len() as f64 * self.config.inline_step_estimate_seconds;
        let sla_class = self.config.sla_for_estimate(estimate);
        let execution_mode = if sla_class == SlaClass::Fast {
            ExecutionMode::Inline
        } else {
            ExecutionMode::Queued
        };

        let action_class = plan_action_class(&plan);
        let policy = policies::get_timeout_policy(&self.pool, sla_class, action_class)
            .await
            .map_err(SubmitError::Internal)?
            .with_context(|| format!("no timeout policy for ({sla_class}, {action_class})"))?;

        let budget = self
            .timeouts
            .execution_timeout(sla_class, &plan)
            .await
            .map_err(SubmitError::Internal)?;
        let timeout_at = Utc::now() + ChronoDuration::from_std(budget).unwrap_or_default();

        let initial_status = if request.approval_level == 0 {
            ExecutionStatus::Approved
        } else {
            ExecutionStatus::PendingApproval
        };

        let new = executions::NewExecution {
            tenant_id: tenant_id.to_owned(),
            actor_id: actor_id.to_owned(),
            idempotency_key: outcome.idempotency_key.clone(),
            plan_snapshot: serde_json::to_value(&plan)
                .context("plan re-serialization failed")
                .map_err(SubmitError::Internal)?,
            plan_hash: plan_hash(&plan),
            execution_mode,
            sla_class,
            approval_level: request.approval_level,
            status: initial_status,
            timeout_at: Some(timeout_at),
            trace_id: request.trace_id,
            parent_execution_id: request.parent_execution_id,
            tags: request.tags.clone().unwrap_or_else(|| serde_json::json!([])),
            metadata: request
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
        };

        let (execution, fresh) = self
            .insert_or_resolve_duplicate(&new, tenant_id, &outcome.idempotency_key)
            .await?;

        // A concurrent duplicate is returned as-is; only a fresh row is
        // driven further.
        if !fresh {
            return Ok(execution);
        }

        let event = NewEvent {
            execution_id: execution.id,
            event_type: "execution_created".to_owned(),
            to_status: Some(execution.status.to_string()),
            actor_id: Some(actor_id.to_owned()),
            actor_type: Some("user".to_owned()),
            details: serde_json::json!({
                "sla_class": sla_class,
                "execution_mode": execution_mode,
                "approval_level": request.approval_level,
                "estimated_seconds": estimate,
            }),
            trace_id: request.trace_id,
            ..NewEvent::default()
        };
        events::insert_event(&self.pool, &event)
            .await
            .map_err(SubmitError::Internal)?;

        info!(
            execution_id = %execution.id,
            tenant_id,
            %sla_class,
            mode = %execution_mode,
            approval_level = request.approval_level,
            "execution created"
        );

        if request.approval_level > 0 {
            let expires_at =
                Utc::now() + ChronoDuration::seconds(policy.approval_timeout_seconds as i64);
            let approval = approvals::insert_approval(
                &self.pool,
                execution.id,
                request.approval_level,
                &execution.plan_hash,
                Some(expires_at),
            )
            .await
            .map_err(SubmitError::Internal)?;
            info!(
                execution_id = %execution.id,
                approval_id = %approval.id,
                level = request.approval_level,
                "approval required"
            );
            return Ok(execution);
        }

        self.route(&execution).await?;
        self.refreshed(execution.id).await
    }

    /// Insert the execution; a unique-index conflict resolves to either the
    /// concurrent duplicate (`fresh = false`) or -- when the prior is not a
    /// live duplicate -- a re-key of the old row and one retry.
    async fn insert_or_resolve_duplicate(
        &self,
        new: &executions::NewExecution,
        tenant_id: &str,
        key: &str,
    ) -> Result<(Execution, bool), SubmitError> {
        match executions::insert_execution(&self.pool, new).await {
            Ok(execution) => Ok((execution, true)),
            Err(e) if executions::is_unique_violation(&e) => {
                let prior = self
                    .idempotency
                    .find_after_conflict(tenant_id, key)
                    .await?
                    .context("conflicting execution disappeared")?;

                // A live prior (non-terminal, or successfully terminal)
                // wins: this submission is the duplicate.
                if !matches!(
                    prior.status,
                    ExecutionStatus::Failed
                        | ExecutionStatus::Cancelled
                        | ExecutionStatus::TimedOut
                ) {
                    return Ok((prior, false));
                }

                // The prior failed (or the window lapsed): free the key and
                // try once more.
                executions::supersede_idempotency_key(&self.pool, prior.id)
                    .await
                    .map_err(SubmitError::Internal)?;
                let execution = executions::insert_execution(&self.pool, new)
                    .await
                    .context("insert retry after superseding failed prior")
                    .map_err(SubmitError::Internal)?;
                Ok((execution, true))
            }
            Err(e) => Err(SubmitError::Internal(
                anyhow::Error::new(e).context("failed to insert execution"),
            )),
        }
    }

    /// Route an approved execution: inline for the fast class, queued
    /// otherwise.
    async fn route(&self, execution: &Execution) -> Result<(), SubmitError> {
        match execution.execution_mode {
            ExecutionMode::Inline => {
                info!(execution_id = %execution.id, "routing inline");
                match self
                    .engine
                    .execute(execution, crate::engine::FailureDisposition::Finalize)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        let message = format!("inline execution failed: {e:#}");
                        warn!(execution_id = %execution.id, error = %message, "inline run errored");
                        executions::finalize_status(
                            &self.pool,
                            execution.id,
                            ExecutionStatus::Failed,
                            Some(&message),
                        )
                        .await
                        .map_err(SubmitError::Internal)?;
                        Ok(())
                    }
                }
            }
            ExecutionMode::Queued => {
                self.queue
                    .enqueue(execution.id, None, execution.sla_class, None)
                    .await
                    .map_err(SubmitError::Internal)?;
                monitor::record_transition(
                    &self.pool,
                    &self.bus,
                    &execution.tenant_id,
                    execution.id,
                    ExecutionStatus::Approved,
                    ExecutionStatus::Queued,
                    None,
                )
                .await
                .map_err(SubmitError::Internal)?;
                Ok(())
            }
        }
    }

    /// Approve or reject a pending approval.
    ///
    /// Approval is only honored when the execution's plan hash still equals
    /// the hash captured on the approval record, and only while the record
    /// has not expired.
    pub async fn respond_approval(
        &self,
        approval_id: Uuid,
        approve: bool,
        approver_id: &str,
    ) -> Result<Execution, SubmitError> {
        let approval = approvals::get_approval(&self.pool, approval_id)
            .await?
            .ok_or(SubmitError::ApprovalNotFound(approval_id))?;

        // Lazily expire overdue approvals at lookup time.
        if approvals::expire_if_overdue(&self.pool, approval_id).await? > 0 {
            warn!(approval_id = %approval_id, "approval expired before response");
            self.cancellations
                .cancel_execution(
                    approval.execution_id,
                    CancelReason::UserInitiated,
                    Some("approval expired"),
                    None,
                )
                .await?;
            return self.refreshed(approval.execution_id).await;
        }

        if approval.state != ApprovalState::Pending {
            return Err(SubmitError::ApprovalResolved(approval_id));
        }

        let execution = executions::get_execution(&self.pool, approval.execution_id)
            .await?
            .ok_or(SubmitError::ExecutionNotFound(approval.execution_id))?;

        if !approve {
            approvals::respond(&self.pool, approval_id, ApprovalState::Rejected, approver_id)
                .await?;
            self.cancellations
                .cancel_execution(
                    execution.id,
                    CancelReason::UserInitiated,
                    Some("approval rejected"),
                    Some(approver_id),
                )
                .await?;
            return self.refreshed(execution.id).await;
        }

        if execution.plan_hash != approval.plan_hash {
            warn!(
                execution_id = %execution.id,
                approval_id = %approval_id,
                "plan hash mismatch at approval time"
            );
            return Err(SubmitError::PlanHashMismatch);
        }

        let rows =
            approvals::respond(&self.pool, approval_id, ApprovalState::Approved, approver_id)
                .await?;
        if rows == 0 {
            return Err(SubmitError::ApprovalResolved(approval_id));
        }

        monitor::record_transition(
            &self.pool,
            &self.bus,
            &execution.tenant_id,
            execution.id,
            ExecutionStatus::PendingApproval,
            ExecutionStatus::Approved,
            None,
        )
        .await
        .map_err(SubmitError::Internal)?;

        let approved = self.refreshed(execution.id).await?;
        self.route(&approved).await?;
        self.refreshed(execution.id).await
    }

    /// User-initiated cancellation.
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        actor_id: &str,
        message: Option<&str>,
    ) -> Result<Execution, SubmitError> {
        executions::get_execution(&self.pool, execution_id)
            .await?
            .ok_or(SubmitError::ExecutionNotFound(execution_id))?;

        self.cancellations
            .cancel_execution(
                execution_id,
                CancelReason::UserInitiated,
                message,
                Some(actor_id),
            )
            .await?;
        self.refreshed(execution_id).await
    }

    /// The execution with derived step progress.
    pub async fn describe(&self, execution_id: Uuid) -> Result<ExecutionView, SubmitError> {
        let execution = executions::get_execution(&self.pool, execution_id)
            .await?
            .ok_or(SubmitError::ExecutionNotFound(execution_id))?;
        let progress = monitor::progress(&self.pool, execution_id).await?;
        Ok(ExecutionView {
            execution,
            progress,
        })
    }

    async fn refreshed(&self, execution_id: Uuid) -> Result<Execution, SubmitError> {
        executions::get_execution(&self.pool, execution_id)
            .await?
            .ok_or(SubmitError::ExecutionNotFound(execution_id))
    }
}
