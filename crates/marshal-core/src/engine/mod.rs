//! The execution engine: expands a plan into persisted steps and runs them
//! sequentially under the full safety layer.
//!
//! Per step: mark running, resolve the target asset, classify, take the
//! asset lock (sorted acquisition), resolve secrets, re-check RBAC, poll
//! cancellation, dispatch to the matching adapter under the step timeout,
//! apply validation rules, record the outcome, release the lock, and emit
//! progress. A failed step does not abort the plan unless it is marked
//! `critical`.

pub mod classify;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use marshal_db::models::{Execution, ExecutionStatus, ExecutionStep, SlaClass, StepStatus};
use marshal_db::queries::events::{self, NewEvent};
use marshal_db::queries::{executions, steps};

use crate::adapters::{
    Adapters, AdapterError, AssetRecord, CommandOutcome, HttpAuth, HttpRequest, LocalRequest,
    PowershellRequest, ShellRequest,
};
use crate::config::CoreConfig;
use crate::monitor::{self, EventBus, ExecutionNotice, MetricsRegistry, NoticeKind};
use crate::plan::{extract_script, Plan, PlanStep, StepKind};
use crate::safety::cancellation::CancellationManager;
use crate::safety::masking::LogMasker;
use crate::safety::mutex::{AssetMutex, LockError};
use crate::safety::rbac::RbacValidator;
use crate::safety::secrets::SecretResolver;
use crate::safety::timeout::TimeoutEnforcer;

/// Everything the engine needs, wired once at startup.
pub struct EngineDeps {
    pub pool: PgPool,
    pub config: Arc<CoreConfig>,
    pub adapters: Adapters,
    pub mutex: Arc<AssetMutex>,
    pub secrets: Arc<SecretResolver>,
    pub rbac: Arc<RbacValidator>,
    pub cancellations: Arc<CancellationManager>,
    pub timeouts: Arc<TimeoutEnforcer>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
    pub masker: Arc<LogMasker>,
}

/// What to do when an attempt ends with every step failed.
///
/// Inline runs finalize immediately. Queued runs defer: the queue decides
/// whether another dispatch happens, and only exhaustion (or the last
/// attempt's partial/complete outcome) terminates the execution -- so a
/// retried execution never has to leave a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Finalize,
    Defer,
}

/// Step-by-step plan executor.
pub struct Engine {
    deps: EngineDeps,
}

/// A step that did not complete. `output` carries whatever the adapter
/// produced before the failure, for the step record.
struct StepFailure {
    error: String,
    output: Option<serde_json::Value>,
}

impl StepFailure {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            output: None,
        }
    }

    fn with_output(error: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            error: error.into(),
            output: Some(output),
        }
    }
}

impl Engine {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    fn pool(&self) -> &PgPool {
        &self.deps.pool
    }

    /// Run one attempt of an execution.
    ///
    /// Returns the attempt's outcome status. `Completed` and `Partial`
    /// always finalize; a fully-failed attempt finalizes or stays `running`
    /// per `disposition`. Errors are reserved for infrastructure failures
    /// (persistence unavailable etc.).
    pub async fn execute(
        &self,
        execution: &Execution,
        disposition: FailureDisposition,
    ) -> Result<ExecutionStatus> {
        let execution_id = execution.id;
        let current = executions::get_execution(self.pool(), execution_id)
            .await?
            .with_context(|| format!("execution {execution_id} not found"))?;

        // A stale re-dispatch of finished work is a no-op.
        if current.status.is_terminal() {
            return Ok(current.status);
        }

        let plan = Plan::from_value(&execution.plan_snapshot)
            .context("stored plan snapshot no longer parses")?;

        // queued -> running (worker path) or approved -> running (inline
        // path). A re-dispatch after a stale lease finds the row already
        // running and proceeds.
        let mut moved = false;
        for from in [ExecutionStatus::Queued, ExecutionStatus::Approved] {
            if monitor::record_transition(
                self.pool(),
                &self.deps.bus,
                &execution.tenant_id,
                execution_id,
                from,
                ExecutionStatus::Running,
                None,
            )
            .await?
            {
                moved = true;
                break;
            }
        }
        if !moved && current.status != ExecutionStatus::Running {
            anyhow::bail!(
                "execution {execution_id} in status {} cannot start",
                current.status
            );
        }

        info!(
            execution_id = %execution_id,
            tenant_id = %execution.tenant_id,
            sla_class = %execution.sla_class,
            steps = plan.steps.len(),
            "execution started"
        );
        self.deps
            .metrics
            .record_started(&execution.tenant_id, execution.sla_class);

        let token = self.deps.cancellations.token(execution_id);
        let timer = execution
            .timeout_at
            .map(|at| self.deps.timeouts.arm(execution_id, at));
        let run_started = Instant::now();

        // Whole-plan RBAC before any side-effectful step.
        if let Err(denied) = self
            .deps
            .rbac
            .validate_plan(&plan, execution_id, &execution.tenant_id, &execution.actor_id)
            .await
        {
            let message = format!("rbac-denied: {denied}");
            self.finish(
                execution,
                ExecutionStatus::Failed,
                Some(&message),
                run_started,
            )
            .await?;
            if let Some(timer) = timer {
                timer.disarm();
            }
            self.deps.cancellations.remove(execution_id);
            return Ok(ExecutionStatus::Failed);
        }

        // Materialize step rows, or pick up the existing ones on a
        // re-dispatch. Steps skipped by a previous attempt's critical abort
        // go back to pending so a successful retry runs them.
        let mut step_rows = steps::list_steps(self.pool(), execution_id).await?;
        if step_rows.is_empty() {
            step_rows = self.create_steps(execution, &plan).await?;
        } else {
            let revived = steps::reset_skipped(self.pool(), execution_id).await?;
            if revived > 0 {
                step_rows = steps::list_steps(self.pool(), execution_id).await?;
            }
        }

        let mut critical_abort = false;
        for row in &step_rows {
            if token.is_cancelled() {
                break;
            }
            // Completed and skipped steps stay done across re-dispatches.
            if matches!(row.status, StepStatus::Completed | StepStatus::Skipped) {
                continue;
            }
            let plan_step = plan
                .steps
                .get(row.step_index as usize)
                .with_context(|| format!("plan has no step at index {}", row.step_index))?;

            let status = self.run_step(execution, plan_step, row, &token).await?;

            if status == StepStatus::Failed && plan_step.critical {
                let skipped =
                    steps::skip_remaining(self.pool(), execution_id, row.step_index + 1).await?;
                warn!(
                    execution_id = %execution_id,
                    step_index = row.step_index,
                    skipped,
                    "critical step failed; aborting remainder of plan"
                );
                critical_abort = true;
                break;
            }
        }

        if let Some(timer) = timer {
            timer.disarm();
        }

        if token.is_cancelled() {
            // The cancellation manager owns the terminal transition (cleanup
            // first, then finalize); wait it out rather than reporting a
            // stale non-terminal status.
            let grace =
                Duration::from_secs(self.deps.config.cleanup_timeout_seconds) + Duration::from_secs(5);
            let deadline = Instant::now() + grace;
            loop {
                let refreshed = executions::get_execution(self.pool(), execution_id)
                    .await?
                    .with_context(|| format!("execution {execution_id} vanished"))?;
                if refreshed.status.is_terminal() {
                    self.deps.metrics.record_terminal(
                        &execution.tenant_id,
                        execution.sla_class,
                        refreshed.status,
                        run_started.elapsed().as_millis() as u64,
                    );
                    return Ok(refreshed.status);
                }
                if Instant::now() >= deadline {
                    return Ok(refreshed.status);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let counts = steps::step_counts(self.pool(), execution_id).await?;
        let final_status = if critical_abort {
            ExecutionStatus::Failed
        } else if counts.failed == 0 {
            ExecutionStatus::Completed
        } else if counts.completed == 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        };

        let result = serde_json::json!({
            "total_steps": counts.total,
            "completed_steps": counts.completed,
            "failed_steps": counts.failed,
            "skipped_steps": counts.skipped,
        });
        executions::update_result(self.pool(), execution_id, &result, None, None).await?;

        if final_status == ExecutionStatus::Failed && disposition == FailureDisposition::Defer {
            // The queue owns the retry decision; the execution stays
            // `running` until the item retries or dead-letters.
            let event = NewEvent::of(
                execution_id,
                "attempt_failed",
                serde_json::json!({
                    "completed_steps": counts.completed,
                    "failed_steps": counts.failed,
                }),
            );
            if let Err(e) = events::insert_event(self.pool(), &event).await {
                error!(execution_id = %execution_id, error = %e, "failed to persist attempt event");
            }
            warn!(
                execution_id = %execution_id,
                failed = counts.failed,
                "attempt failed; deferring terminal status to the queue"
            );
            return Ok(ExecutionStatus::Failed);
        }

        self.finish(execution, final_status, None, run_started).await?;
        self.deps.cancellations.remove(execution_id);

        info!(
            execution_id = %execution_id,
            status = %final_status,
            completed = counts.completed,
            failed = counts.failed,
            "execution finished"
        );
        Ok(final_status)
    }

    /// Terminally fail an execution whose queue attempts are exhausted.
    pub async fn finalize_failed(
        &self,
        execution: &Execution,
        error_message: &str,
    ) -> Result<()> {
        let applied = monitor::record_transition(
            self.pool(),
            &self.deps.bus,
            &execution.tenant_id,
            execution.id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            Some(error_message),
        )
        .await?;
        if applied {
            self.deps.metrics.record_terminal(
                &execution.tenant_id,
                execution.sla_class,
                ExecutionStatus::Failed,
                0,
            );
        }
        self.deps.cancellations.remove(execution.id);
        Ok(())
    }

    /// Terminal bookkeeping: status transition, metrics, final notice.
    async fn finish(
        &self,
        execution: &Execution,
        status: ExecutionStatus,
        error_message: Option<&str>,
        run_started: Instant,
    ) -> Result<()> {
        let applied = monitor::record_transition(
            self.pool(),
            &self.deps.bus,
            &execution.tenant_id,
            execution.id,
            ExecutionStatus::Running,
            status,
            error_message,
        )
        .await?;
        if applied {
            self.deps.metrics.record_terminal(
                &execution.tenant_id,
                execution.sla_class,
                status,
                run_started.elapsed().as_millis() as u64,
            );
        }
        Ok(())
    }

    /// Persist the plan's steps in order.
    async fn create_steps(
        &self,
        execution: &Execution,
        plan: &Plan,
    ) -> Result<Vec<ExecutionStep>> {
        let mut rows = Vec::with_capacity(plan.steps.len());
        for (index, step) in plan.steps.iter().enumerate() {
            let row = steps::insert_step(
                self.pool(),
                &steps::NewStep {
                    execution_id: execution.id,
                    step_index: index as i32,
                    step_name: step.display_name(index),
                    step_type: step.kind().as_str().to_owned(),
                    target_asset_id: step.target_asset_id.clone(),
                    target_hostname: step.target_hostname.clone(),
                    input_data: step.input.clone(),
                    max_retries: step.max_retries,
                },
            )
            .await?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Run one step to a terminal step status.
    async fn run_step(
        &self,
        execution: &Execution,
        plan_step: &PlanStep,
        row: &ExecutionStep,
        token: &Arc<crate::safety::cancellation::ExecutionToken>,
    ) -> Result<StepStatus> {
        let started = Instant::now();
        steps::mark_running(self.pool(), row.id).await?;
        self.step_event(execution.id, "step_started", row, None).await;
        self.deps.bus.publish(ExecutionNotice::step(
            NoticeKind::StepStarted,
            &execution.tenant_id,
            execution.id,
            row.step_index,
            None,
        ));

        let outcome = self.try_step(execution, plan_step, row, token).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let status = match outcome {
            Ok(output) => {
                let masked = self.deps.masker.mask_value(&output);
                steps::record_outcome(
                    self.pool(),
                    row.id,
                    StepStatus::Completed,
                    Some(&masked),
                    None,
                    Some(duration_ms),
                )
                .await?;
                self.step_event(execution.id, "step_succeeded", row, None).await;
                StepStatus::Completed
            }
            Err(failure) => {
                let masked_error = self.deps.masker.mask(&failure.error);
                let masked_output = failure.output.map(|o| self.deps.masker.mask_value(&o));
                warn!(
                    execution_id = %execution.id,
                    step_index = row.step_index,
                    error = %masked_error,
                    "step failed"
                );
                steps::record_outcome(
                    self.pool(),
                    row.id,
                    StepStatus::Failed,
                    masked_output.as_ref(),
                    Some(&masked_error),
                    Some(duration_ms),
                )
                .await?;
                self.step_event(execution.id, "step_failed", row, Some(&masked_error))
                    .await;
                StepStatus::Failed
            }
        };

        let progress = monitor::progress(self.pool(), execution.id).await.ok();
        self.deps.bus.publish(ExecutionNotice::step(
            NoticeKind::StepFinished,
            &execution.tenant_id,
            execution.id,
            row.step_index,
            progress,
        ));

        Ok(status)
    }

    /// The step ladder: asset, classification, lock, secrets, RBAC,
    /// cancellation, dispatch with retries, validation.
    async fn try_step(
        &self,
        execution: &Execution,
        plan_step: &PlanStep,
        row: &ExecutionStep,
        token: &Arc<crate::safety::cancellation::ExecutionToken>,
    ) -> std::result::Result<serde_json::Value, StepFailure> {
        // Target resolution.
        let asset = self.resolve_asset(row).await?;

        let kind = classify::classify_step(&row.step_type, &row.input_data, asset.as_ref());

        // Per-asset mutual exclusion. Sorted multi-asset acquisition is
        // handled by the mutex; a single-target step is the common case.
        let lock = match &asset {
            Some(asset) => {
                let wait = Duration::from_secs(self.deps.config.lock_wait_seconds);
                match self
                    .deps
                    .mutex
                    .acquire(&asset.id, &execution.tenant_id, execution.id, wait)
                    .await
                {
                    Ok(lock) => Some(lock),
                    Err(LockError::Unavailable { asset_id, waited_ms }) => {
                        return Err(StepFailure::new(format!(
                            "lock-unavailable: asset {asset_id} still locked after {waited_ms}ms"
                        )));
                    }
                    Err(LockError::Db(e)) => {
                        return Err(StepFailure::new(format!("lock acquisition failed: {e}")));
                    }
                }
            }
            None => None,
        };

        let result = self
            .try_step_locked(execution, plan_step, row, kind, asset.as_ref(), token)
            .await;

        if let Some(lock) = lock {
            lock.release().await;
        }
        result
    }

    /// Remainder of the ladder, run while the asset lock is held.
    async fn try_step_locked(
        &self,
        execution: &Execution,
        plan_step: &PlanStep,
        row: &ExecutionStep,
        kind: StepKind,
        asset: Option<&AssetRecord>,
        token: &Arc<crate::safety::cancellation::ExecutionToken>,
    ) -> std::result::Result<serde_json::Value, StepFailure> {
        // Secrets resolve at use time; the resolved copy lives only on this
        // stack frame.
        let input = self
            .deps
            .secrets
            .resolve_all(&row.input_data, execution.id, &execution.tenant_id)
            .await
            .map_err(|e| StepFailure::new(format!("secret resolution failed: {e}")))?;

        // Per-step RBAC re-check (plan targets can be expanded late).
        if let Err(denied) = self
            .deps
            .rbac
            .validate_step(plan_step, execution.id, &execution.tenant_id, &execution.actor_id)
            .await
        {
            return Err(StepFailure::new(format!("rbac-denied: {denied}")));
        }

        if token.is_cancelled() {
            return Err(StepFailure::new("cancelled before dispatch"));
        }

        let step_timeout = self
            .deps
            .timeouts
            .step_timeout(execution.sla_class, plan_step)
            .await
            .map_err(|e| StepFailure::new(format!("timeout policy lookup failed: {e}")))?;

        // Adapter dispatch with bounded in-step retries. Retries apply to
        // transport failures; validation failures are final.
        let max_retries = row.max_retries.max(0);
        let mut attempt = 0;
        loop {
            match self
                .dispatch(kind, &input, asset, execution.sla_class, step_timeout, token)
                .await
            {
                Ok(output) => {
                    return validate_output(kind, &input, output);
                }
                Err(AdapterError::Cancelled) => {
                    return Err(StepFailure::new("cancelled during dispatch"));
                }
                Err(e) => {
                    if attempt >= max_retries {
                        return Err(StepFailure::new(format!(
                            "adapter failed after {} attempt(s): {e}",
                            attempt + 1
                        )));
                    }
                    attempt += 1;
                    let backoff = backoff_delay(attempt);
                    warn!(
                        execution_id = %execution.id,
                        step_index = row.step_index,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "step attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = token.raw().cancelled() => {
                            return Err(StepFailure::new("cancelled during backoff"));
                        }
                    }
                }
            }
        }
    }

    async fn resolve_asset(
        &self,
        row: &ExecutionStep,
    ) -> std::result::Result<Option<AssetRecord>, StepFailure> {
        if let Some(asset_id) = &row.target_asset_id {
            let asset = self
                .deps
                .adapters
                .assets
                .get_by_id(asset_id)
                .await
                .map_err(|e| StepFailure::new(format!("asset lookup failed: {e}")))?;
            return match asset {
                Some(asset) => Ok(Some(asset)),
                None => Err(StepFailure::new(format!("asset not found: {asset_id}"))),
            };
        }
        if let Some(hostname) = &row.target_hostname {
            let asset = self
                .deps
                .adapters
                .assets
                .get_by_hostname(hostname)
                .await
                .map_err(|e| StepFailure::new(format!("asset lookup failed: {e}")))?;
            return match asset {
                Some(asset) => Ok(Some(asset)),
                None => Err(StepFailure::new(format!("asset not found: {hostname}"))),
            };
        }
        Ok(None)
    }

    /// Build the adapter request for the classified kind and dispatch it.
    async fn dispatch(
        &self,
        kind: StepKind,
        input: &serde_json::Value,
        asset: Option<&AssetRecord>,
        sla_class: SlaClass,
        timeout: Duration,
        token: &Arc<crate::safety::cancellation::ExecutionToken>,
    ) -> std::result::Result<serde_json::Value, AdapterError> {
        let cancel = token.raw();
        match kind {
            StepKind::RemoteShell => {
                let request = build_shell_request(input, asset, timeout)?;
                let outcome = self.deps.adapters.remote_shell.run(&request, cancel).await?;
                Ok(command_output(&outcome))
            }
            StepKind::RemotePowershell => {
                let request = build_powershell_request(input, asset, timeout)?;
                let outcome = self.deps.adapters.powershell.run(&request, cancel).await?;
                Ok(command_output(&outcome))
            }
            StepKind::Http => {
                let request = build_http_request(input, asset, timeout)?;
                let outcome = self.deps.adapters.http.send(&request, cancel).await?;
                Ok(serde_json::json!({
                    "http_status": outcome.status,
                    "body": outcome.body,
                    "headers": outcome.headers,
                    "duration_ms": outcome.duration_ms,
                }))
            }
            StepKind::AssetQuery => self.asset_query(input).await,
            StepKind::LocalCommand | StepKind::Validation => {
                // A validation step with a command runs it like a local
                // command (or remotely when it targets an asset) and judges
                // the result in `validate_output`.
                if kind == StepKind::Validation && extract_script(input).is_none() {
                    return Ok(serde_json::json!({"validation_passed": true, "note": "no command"}));
                }
                match asset {
                    Some(asset) if kind == StepKind::Validation => {
                        let request = build_shell_request(input, Some(asset), timeout)?;
                        let outcome =
                            self.deps.adapters.remote_shell.run(&request, cancel).await?;
                        Ok(command_output(&outcome))
                    }
                    _ => {
                        let request = build_local_request(input, timeout)?;
                        let outcome = self.deps.adapters.local.run(&request, cancel).await?;
                        Ok(command_output(&outcome))
                    }
                }
            }
            StepKind::FileOp => {
                let request = build_file_op_request(input, asset, sla_class, timeout)?;
                let outcome = self.deps.adapters.local.run(&request, cancel).await?;
                Ok(command_output(&outcome))
            }
        }
    }

    /// Inventory queries with optional field projection.
    async fn asset_query(
        &self,
        input: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, AdapterError> {
        let assets = &self.deps.adapters.assets;
        let query_type = input
            .get("query_type")
            .and_then(|v| v.as_str())
            .unwrap_or("list_all");
        let limit = input
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;
        let fields: Vec<String> = input
            .get("fields")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|f| f.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let records = match query_type {
            "count" => {
                let count = assets.count().await?;
                return Ok(serde_json::json!({"query_type": "count", "count": count}));
            }
            "by_type" => {
                let asset_type = input
                    .pointer("/filters/type")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AdapterError::Unsupported("by_type query needs filters.type".to_owned())
                    })?;
                assets.list_by_type(asset_type, limit).await?
            }
            "by_id" => {
                let id = input
                    .pointer("/filters/id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AdapterError::Unsupported("by_id query needs filters.id".to_owned())
                    })?;
                assets.get_by_id(id).await?.into_iter().collect()
            }
            "by_hostname" => {
                let hostname = input
                    .pointer("/filters/hostname")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AdapterError::Unsupported(
                            "by_hostname query needs filters.hostname".to_owned(),
                        )
                    })?;
                assets.get_by_hostname(hostname).await?.into_iter().collect()
            }
            _ => assets.list_all(limit).await?,
        };

        let data: Vec<serde_json::Value> =
            records.iter().map(|r| r.project(&fields)).collect();
        Ok(serde_json::json!({
            "query_type": query_type,
            "count": data.len(),
            "data": data,
        }))
    }

    /// Best-effort step audit event.
    async fn step_event(
        &self,
        execution_id: Uuid,
        event_type: &str,
        row: &ExecutionStep,
        error_message: Option<&str>,
    ) {
        let event = NewEvent {
            execution_id,
            event_type: event_type.to_owned(),
            error_message: error_message.map(str::to_owned),
            details: serde_json::json!({
                "step_id": row.id,
                "step_index": row.step_index,
                "step_type": row.step_type,
            }),
            ..NewEvent::default()
        };
        if let Err(e) = events::insert_event(self.pool(), &event).await {
            error!(execution_id = %execution_id, error = %e, "failed to persist step event");
        }
    }
}

/// Exponential backoff with jitter for in-step retries.
fn backoff_delay(attempt: i32) -> Duration {
    let base_ms = 500u64.saturating_mul(1 << attempt.clamp(0, 6) as u64);
    let jitter = rand::rng().random_range(0..250);
    Duration::from_millis(base_ms + jitter)
}

fn command_output(outcome: &CommandOutcome) -> serde_json::Value {
    serde_json::json!({
        "exit_code": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "duration_ms": outcome.duration_ms,
        "attempts": outcome.attempts,
    })
}

fn str_input<'v>(input: &'v serde_json::Value, keys: &[&str]) -> Option<&'v str> {
    keys.iter().find_map(|k| input.get(*k).and_then(|v| v.as_str()))
}

fn build_shell_request(
    input: &serde_json::Value,
    asset: Option<&AssetRecord>,
    timeout: Duration,
) -> std::result::Result<ShellRequest, AdapterError> {
    let host = str_input(input, &["host", "target_host"])
        .map(str::to_owned)
        .or_else(|| asset.map(|a| a.address().to_owned()))
        .ok_or_else(|| AdapterError::Unsupported("remote step has no host".to_owned()))?;
    let script = extract_script(input)
        .ok_or_else(|| AdapterError::Unsupported("remote step has no command".to_owned()))?;

    Ok(ShellRequest {
        host,
        port: input.get("port").and_then(|v| v.as_u64()).unwrap_or(22) as u16,
        username: str_input(input, &["username", "user"]).unwrap_or("root").to_owned(),
        password: str_input(input, &["password"]).map(str::to_owned),
        private_key: str_input(input, &["private_key"]).map(str::to_owned),
        script: script.to_owned(),
        timeout,
    })
}

fn build_powershell_request(
    input: &serde_json::Value,
    asset: Option<&AssetRecord>,
    timeout: Duration,
) -> std::result::Result<PowershellRequest, AdapterError> {
    let host = str_input(input, &["host", "target_host"])
        .map(str::to_owned)
        .or_else(|| asset.map(|a| a.address().to_owned()))
        .ok_or_else(|| AdapterError::Unsupported("powershell step has no host".to_owned()))?;
    let script = extract_script(input)
        .ok_or_else(|| AdapterError::Unsupported("powershell step has no script".to_owned()))?;
    let use_tls = input.get("use_tls").and_then(|v| v.as_bool()).unwrap_or(false);

    Ok(PowershellRequest {
        host,
        port: input
            .get("port")
            .and_then(|v| v.as_u64())
            .unwrap_or(if use_tls { 5986 } else { 5985 }) as u16,
        username: str_input(input, &["username", "user"]).unwrap_or("Administrator").to_owned(),
        password: str_input(input, &["password"]).unwrap_or_default().to_owned(),
        use_tls,
        script: script.to_owned(),
        timeout,
    })
}

fn build_http_request(
    input: &serde_json::Value,
    asset: Option<&AssetRecord>,
    timeout: Duration,
) -> std::result::Result<HttpRequest, AdapterError> {
    let url = match str_input(input, &["url", "endpoint"]) {
        Some(url) => url.to_owned(),
        None => {
            // Assemble from host + protocol + port + path.
            let host = str_input(input, &["host", "target_host"])
                .map(str::to_owned)
                .or_else(|| asset.map(|a| a.address().to_owned()))
                .ok_or_else(|| {
                    AdapterError::Unsupported("http step has no url or host".to_owned())
                })?;
            let protocol = str_input(input, &["protocol"]).unwrap_or("http");
            let path = str_input(input, &["path"]).unwrap_or("");
            match input.get("port").and_then(|v| v.as_u64()) {
                Some(port) => format!("{protocol}://{host}:{port}{path}"),
                None => format!("{protocol}://{host}{path}"),
            }
        }
    };

    let to_string_map = |value: Option<&serde_json::Value>| -> BTreeMap<String, String> {
        value
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let rendered = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), rendered)
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let auth = match (
        str_input(input, &["username", "user"]),
        str_input(input, &["password"]),
        str_input(input, &["bearer_token"]),
    ) {
        (_, _, Some(bearer)) => Some(HttpAuth::Bearer {
            token: bearer.to_owned(),
        }),
        (Some(username), Some(password), _) => Some(HttpAuth::Basic {
            username: username.to_owned(),
            password: password.to_owned(),
        }),
        _ => None,
    };

    Ok(HttpRequest {
        method: str_input(input, &["method"]).unwrap_or("GET").to_owned(),
        url,
        headers: to_string_map(input.get("headers")),
        query: to_string_map(input.get("params").or_else(|| input.get("query"))),
        body: input.get("body").or_else(|| input.get("data")).cloned(),
        auth,
        verify_tls: input.get("verify_tls").and_then(|v| v.as_bool()).unwrap_or(false),
        timeout,
    })
}

fn build_local_request(
    input: &serde_json::Value,
    timeout: Duration,
) -> std::result::Result<LocalRequest, AdapterError> {
    let command = extract_script(input)
        .ok_or_else(|| AdapterError::Unsupported("command step has no command".to_owned()))?;
    let env = input
        .get("environment_vars")
        .or_else(|| input.get("env"))
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();

    Ok(LocalRequest {
        command: command.to_owned(),
        working_dir: str_input(input, &["working_directory", "working_dir"]).map(str::to_owned),
        env,
        timeout,
    })
}

/// File transfers ride the local runner as an scp invocation against the
/// target asset.
fn build_file_op_request(
    input: &serde_json::Value,
    asset: Option<&AssetRecord>,
    _sla_class: SlaClass,
    timeout: Duration,
) -> std::result::Result<LocalRequest, AdapterError> {
    let source = str_input(input, &["source"])
        .ok_or_else(|| AdapterError::Unsupported("file step has no source".to_owned()))?;
    let destination = str_input(input, &["destination"])
        .ok_or_else(|| AdapterError::Unsupported("file step has no destination".to_owned()))?;

    let command = match asset {
        Some(asset) => {
            let user = str_input(input, &["username", "user"]).unwrap_or("root");
            format!("scp {source} {user}@{}:{destination}", asset.address())
        }
        None => format!("cp {source} {destination}"),
    };

    Ok(LocalRequest {
        command,
        working_dir: None,
        env: BTreeMap::new(),
        timeout,
    })
}

/// Apply the step's validation rules to a successful adapter outcome.
///
/// Failing validation fails the step regardless of adapter success.
fn validate_output(
    kind: StepKind,
    input: &serde_json::Value,
    output: serde_json::Value,
) -> std::result::Result<serde_json::Value, StepFailure> {
    match kind {
        StepKind::Http => {
            let status = output
                .get("http_status")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u16;
            let ok = match input.get("expected_status").and_then(|v| v.as_u64()) {
                Some(expected) => status as u64 == expected,
                None => (200..300).contains(&status),
            };
            if ok {
                Ok(output)
            } else {
                Err(StepFailure::with_output(
                    format!("http request returned status {status}"),
                    output,
                ))
            }
        }
        StepKind::AssetQuery => Ok(output),
        _ => {
            let exit_code = output.get("exit_code").and_then(|v| v.as_i64());
            if let Some(exit_code) = exit_code {
                let expected = input
                    .get("expected_exit_code")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                if exit_code != expected {
                    return Err(StepFailure::with_output(
                        format!("exit code {exit_code} (expected {expected})"),
                        output,
                    ));
                }
            }
            if let Some(expected_output) = input.get("expected_output").and_then(|v| v.as_str()) {
                let stdout = output.get("stdout").and_then(|v| v.as_str()).unwrap_or("");
                if !stdout.contains(expected_output) {
                    return Err(StepFailure::with_output(
                        format!("output does not contain {expected_output:?}"),
                        output,
                    ));
                }
            }
            let mut output = output;
            if kind == StepKind::Validation {
                if let Some(map) = output.as_object_mut() {
                    map.insert("validation_passed".to_owned(), serde_json::json!(true));
                }
            }
            Ok(output)
        }
    }
}
