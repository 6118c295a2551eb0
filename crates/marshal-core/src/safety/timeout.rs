//! SLA-driven timeout derivation and enforcement.
//!
//! Timeouts come from the (SLA class x action class) policy matrix seeded at
//! migration. A step's budget is its policy cell; an execution's budget is
//! the sum of its step budgets plus fractional headroom, floored per class.
//! Enforcement is a timer armed against the execution's `timeout_at` that
//! fires cancellation with reason `timeout`, plus a periodic sweep that
//! catches rows whose timer never ran (e.g. the worker died).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use marshal_db::models::{ActionClass, SlaClass};
use marshal_db::queries::{executions, policies};

use super::cancellation::{CancelReason, CancellationManager};
use crate::plan::{Plan, PlanStep, StepKind};

/// Deterministic action classification for a step.
///
/// An explicit `action` input is classified by keyword; otherwise the step
/// kind decides. The same step shape always classifies the same way.
pub fn action_class(step: &PlanStep) -> ActionClass {
    if let Some(action) = step.input.get("action").and_then(|v| v.as_str()) {
        let action = action.to_ascii_lowercase();
        if ["read", "get", "list", "describe", "status", "query"]
            .iter()
            .any(|k| action.contains(k))
        {
            return ActionClass::Read;
        }
        if ["deploy", "migrate", "backup", "restore", "install", "provision"]
            .iter()
            .any(|k| action.contains(k))
        {
            return ActionClass::Complex;
        }
        return ActionClass::Write;
    }

    match step.kind() {
        StepKind::AssetQuery | StepKind::Validation => ActionClass::Read,
        StepKind::Http | StepKind::LocalCommand => ActionClass::Write,
        StepKind::RemoteShell | StepKind::RemotePowershell | StepKind::FileOp => {
            // Remote mutation without a declared action; assume the worst
            // within the write/complex split by inspecting the script.
            let script = crate::plan::extract_script(&step.input).unwrap_or_default();
            let script = script.to_ascii_lowercase();
            if ["deploy", "migrate", "backup", "restore", "install"]
                .iter()
                .any(|k| script.contains(k))
            {
                ActionClass::Complex
            } else {
                ActionClass::Write
            }
        }
    }
}

/// The widest action class used by any step of the plan. Drives the
/// execution-level policy lookup.
pub fn plan_action_class(plan: &Plan) -> ActionClass {
    let mut widest = ActionClass::Read;
    for step in &plan.steps {
        widest = match (widest, action_class(step)) {
            (_, ActionClass::Complex) | (ActionClass::Complex, _) => ActionClass::Complex,
            (_, ActionClass::Write) | (ActionClass::Write, _) => ActionClass::Write,
            _ => ActionClass::Read,
        };
    }
    widest
}

/// Minimum execution budget per SLA class, applied after summing steps.
fn class_floor(sla_class: SlaClass) -> Duration {
    match sla_class {
        SlaClass::Fast => Duration::from_secs(10),
        SlaClass::Medium => Duration::from_secs(30),
        SlaClass::Long => Duration::from_secs(60),
    }
}

/// Derives and enforces execution deadlines.
pub struct TimeoutEnforcer {
    pool: PgPool,
    cancellations: Arc<CancellationManager>,
    buffer_fraction: f64,
}

/// Disarms the timeout timer when dropped or told to.
pub struct ArmedTimeout {
    task: Option<JoinHandle<()>>,
}

impl ArmedTimeout {
    /// Cancel enforcement; called on normal termination.
    pub fn disarm(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ArmedTimeout {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl TimeoutEnforcer {
    pub fn new(
        pool: PgPool,
        cancellations: Arc<CancellationManager>,
        buffer_fraction: f64,
    ) -> Self {
        Self {
            pool,
            cancellations,
            buffer_fraction,
        }
    }

    /// The policy-backed budget for one step.
    pub async fn step_timeout(&self, sla_class: SlaClass, step: &PlanStep) -> Result<Duration> {
        let action = action_class(step);
        let policy = policies::get_timeout_policy(&self.pool, sla_class, action)
            .await?
            .with_context(|| format!("no timeout policy for ({sla_class}, {action})"))?;
        Ok(Duration::from_secs(policy.step_timeout_seconds as u64))
    }

    /// The execution budget: sum of step budgets x (1 + buffer), floored per
    /// class. Computed once at submission; `timeout_at` is never extended.
    pub async fn execution_timeout(&self, sla_class: SlaClass, plan: &Plan) -> Result<Duration> {
        let mut total = Duration::ZERO;
        for step in &plan.steps {
            total += self.step_timeout(sla_class, step).await?;
        }
        let buffered = total.mul_f64(1.0 + self.buffer_fraction);
        let floored = buffered.max(class_floor(sla_class));
        debug!(
            %sla_class,
            steps = plan.steps.len(),
            budget_seconds = floored.as_secs(),
            "derived execution timeout"
        );
        Ok(floored)
    }

    /// Arm a timer against the execution's wall-clock deadline. When it
    /// fires and the execution is still live, cancellation runs with reason
    /// `timeout`. Disarm on normal termination.
    pub fn arm(&self, execution_id: Uuid, timeout_at: DateTime<Utc>) -> ArmedTimeout {
        let cancellations = self.cancellations.clone();
        let task = tokio::spawn(async move {
            let now = Utc::now();
            if let Ok(remaining) = (timeout_at - now).to_std() {
                tokio::time::sleep(remaining).await;
            }
            warn!(execution_id = %execution_id, "execution deadline reached");
            if let Err(e) = cancellations
                .cancel_execution(
                    execution_id,
                    CancelReason::Timeout,
                    Some("execution exceeded its deadline"),
                    None,
                )
                .await
            {
                error!(execution_id = %execution_id, error = %e, "timeout cancellation failed");
            }
        });
        ArmedTimeout { task: Some(task) }
    }

    /// Cancel every live execution whose `timeout_at` has passed. Run
    /// periodically from pool maintenance so deadlines hold even when the
    /// owning worker (and its armed timer) died. Returns the number swept.
    pub async fn sweep_overdue(&self) -> Result<u64> {
        let overdue = executions::list_overdue(&self.pool, 100).await?;
        let mut swept = 0;
        for execution in overdue {
            warn!(execution_id = %execution.id, "sweeping overdue execution");
            if let Err(e) = self
                .cancellations
                .cancel_execution(
                    execution.id,
                    CancelReason::Timeout,
                    Some("execution exceeded its deadline"),
                    None,
                )
                .await
            {
                error!(execution_id = %execution.id, error = %e, "overdue sweep failed");
                continue;
            }
            swept += 1;
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: serde_json::Value) -> PlanStep {
        serde_json::from_value(value).expect("test step should parse")
    }

    #[test]
    fn explicit_action_keywords_classify() {
        let read = step(json!({"type": "remote-shell", "input": {"command": "x", "action": "get-status"}}));
        assert_eq!(action_class(&read), ActionClass::Read);

        let complex = step(json!({"type": "remote-shell", "input": {"command": "x", "action": "deploy-app"}}));
        assert_eq!(action_class(&complex), ActionClass::Complex);

        let write = step(json!({"type": "remote-shell", "input": {"command": "x", "action": "rotate"}}));
        assert_eq!(action_class(&write), ActionClass::Write);
    }

    #[test]
    fn kind_fallback_classification() {
        let query = step(json!({"type": "asset-query", "input": {}}));
        assert_eq!(action_class(&query), ActionClass::Read);

        let shell = step(json!({"type": "remote-shell", "input": {"command": "systemctl restart nginx"}}));
        assert_eq!(action_class(&shell), ActionClass::Write);

        let deploy = step(json!({"type": "remote-shell", "input": {"command": "deploy --all"}}));
        assert_eq!(action_class(&deploy), ActionClass::Complex);
    }

    #[test]
    fn classification_is_deterministic() {
        let s = step(json!({"type": "http", "input": {"url": "https://x/api"}}));
        let first = action_class(&s);
        for _ in 0..10 {
            assert_eq!(action_class(&s), first);
        }
    }

    #[test]
    fn plan_action_class_is_widest() {
        let plan = crate::plan::Plan {
            name: "p".into(),
            order_independent: false,
            steps: vec![
                step(json!({"type": "asset-query", "input": {}})),
                step(json!({"type": "remote-shell", "target_asset_id": "a", "input": {"command": "backup now"}})),
            ],
        };
        assert_eq!(plan_action_class(&plan), ActionClass::Complex);
    }

    #[test]
    fn floors_per_class() {
        assert_eq!(class_floor(SlaClass::Fast), Duration::from_secs(10));
        assert_eq!(class_floor(SlaClass::Medium), Duration::from_secs(30));
        assert_eq!(class_floor(SlaClass::Long), Duration::from_secs(60));
    }
}
