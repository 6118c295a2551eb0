//! Cooperative cancellation with compensating cleanup.
//!
//! Every execution gets a token; long operations poll it between I/O
//! boundaries and abort at the next suspension point. Cancelling is
//! idempotent -- the first cancel wins and records the reason. On cancel,
//! steps that made it to `running` or `completed` are walked in reverse and
//! their type-specific compensation hooks run under a bounded budget;
//! blowing that budget turns the final status into `failed`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use marshal_db::models::{ExecutionStatus, ExecutionStep, StepStatus};
use marshal_db::queries::events::{self, NewEvent};
use marshal_db::queries::{executions, steps};

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserInitiated,
    Timeout,
    SystemShutdown,
    ResourceLimit,
    Error,
    Duplicate,
}

impl CancelReason {
    /// The terminal status a cancellation resolves to.
    pub fn final_status(self) -> ExecutionStatus {
        match self {
            Self::Timeout => ExecutionStatus::TimedOut,
            _ => ExecutionStatus::Cancelled,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserInitiated => "user_initiated",
            Self::Timeout => "timeout",
            Self::SystemShutdown => "system_shutdown",
            Self::ResourceLimit => "resource_limit",
            Self::Error => "error",
            Self::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

impl FromStr for CancelReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_initiated" => Ok(Self::UserInitiated),
            "timeout" => Ok(Self::Timeout),
            "system_shutdown" => Ok(Self::SystemShutdown),
            "resource_limit" => Ok(Self::ResourceLimit),
            "error" => Ok(Self::Error),
            "duplicate" => Ok(Self::Duplicate),
            other => Err(format!("invalid cancel reason: {other:?}")),
        }
    }
}

/// Recorded cancellation cause.
#[derive(Debug, Clone)]
pub struct CancelState {
    pub reason: CancelReason,
    pub message: Option<String>,
}

type Callback = Box<dyn FnOnce() + Send>;

/// Per-execution cancellation token.
///
/// Wraps a [`CancellationToken`] (for `select!`-style suspension points)
/// with the reason/message record and one-shot callbacks.
pub struct ExecutionToken {
    raw: CancellationToken,
    state: Mutex<Option<CancelState>>,
    callbacks: Mutex<Vec<Callback>>,
}

impl ExecutionToken {
    fn new() -> Self {
        Self {
            raw: CancellationToken::new(),
            state: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Cheap, thread-safe cancellation check.
    pub fn is_cancelled(&self) -> bool {
        self.raw.is_cancelled()
    }

    /// The recorded cancellation cause, once cancelled.
    pub fn state(&self) -> Option<CancelState> {
        self.state.lock().expect("token lock poisoned").clone()
    }

    /// The underlying token, for `tokio::select!` against long operations.
    pub fn raw(&self) -> &CancellationToken {
        &self.raw
    }

    /// Register a callback fired on the first cancel. Best-effort: panics
    /// are caught and logged, never raised to the canceller.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks
            .lock()
            .expect("token lock poisoned")
            .push(Box::new(callback));
    }

    /// Cancel the token. First cancel wins and records the cause; later
    /// calls are no-ops. Returns whether this call was the first.
    pub fn cancel(&self, reason: CancelReason, message: Option<String>) -> bool {
        {
            let mut state = self.state.lock().expect("token lock poisoned");
            if state.is_some() {
                return false;
            }
            *state = Some(CancelState { reason, message });
        }
        self.raw.cancel();

        let callbacks: Vec<Callback> =
            std::mem::take(&mut *self.callbacks.lock().expect("token lock poisoned"));
        for callback in callbacks {
            if let Err(panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback))
            {
                error!(?panic, "cancellation callback panicked");
            }
        }
        true
    }
}

/// Step-type-specific compensation, run during cleanup for steps that made
/// it to `running` or `completed` (e.g. rollback a deploy, delete a created
/// resource).
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn compensate(&self, step: &ExecutionStep) -> anyhow::Result<()>;
}

/// Owns every live token and drives cancellation through to a terminal
/// status.
pub struct CancellationManager {
    pool: PgPool,
    tokens: Mutex<HashMap<Uuid, Arc<ExecutionToken>>>,
    hooks: HashMap<String, Arc<dyn CleanupHook>>,
    cleanup_timeout: Duration,
}

impl CancellationManager {
    pub fn new(pool: PgPool, cleanup_timeout: Duration) -> Self {
        Self {
            pool,
            tokens: Mutex::new(HashMap::new()),
            hooks: HashMap::new(),
            cleanup_timeout,
        }
    }

    /// Register a compensation hook for a step type (canonical kind name,
    /// e.g. "remote-shell"). Call during startup wiring, before the manager
    /// is shared.
    pub fn register_hook(&mut self, step_kind: &str, hook: Arc<dyn CleanupHook>) {
        self.hooks.insert(step_kind.to_owned(), hook);
    }

    /// Get or create the token for an execution.
    pub fn token(&self, execution_id: Uuid) -> Arc<ExecutionToken> {
        self.tokens
            .lock()
            .expect("token registry poisoned")
            .entry(execution_id)
            .or_insert_with(|| Arc::new(ExecutionToken::new()))
            .clone()
    }

    /// The token for an execution, if one is live.
    pub fn get(&self, execution_id: Uuid) -> Option<Arc<ExecutionToken>> {
        self.tokens
            .lock()
            .expect("token registry poisoned")
            .get(&execution_id)
            .cloned()
    }

    /// Drop the token after terminal handling.
    pub fn remove(&self, execution_id: Uuid) {
        self.tokens
            .lock()
            .expect("token registry poisoned")
            .remove(&execution_id);
    }

    /// Execution IDs with live tokens (the in-flight set at shutdown).
    pub fn live_executions(&self) -> Vec<Uuid> {
        self.tokens
            .lock()
            .expect("token registry poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Cancel an execution: flip the token, audit, run cleanup under its
    /// budget, then finalize the status.
    ///
    /// Cleanup runs *before* the terminal transition so a blown cleanup
    /// budget can still resolve the execution to `failed`; terminal statuses
    /// stay monotonic either way.
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        reason: CancelReason,
        message: Option<&str>,
        actor_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let token = self.token(execution_id);
        let first = token.cancel(reason, message.map(str::to_owned));
        if !first {
            // Already cancelled; first cancel wins.
            return Ok(());
        }

        info!(
            execution_id = %execution_id,
            %reason,
            message = message.unwrap_or(""),
            "cancelling execution"
        );

        let event = NewEvent {
            execution_id,
            event_type: "execution_cancelled".to_owned(),
            actor_id: actor_id.map(str::to_owned),
            actor_type: Some(if actor_id.is_some() { "user" } else { "system" }.to_owned()),
            details: serde_json::json!({"reason": reason.to_string(), "message": message}),
            ..NewEvent::default()
        };
        if let Err(e) = events::insert_event(&self.pool, &event).await {
            warn!(execution_id = %execution_id, error = %e, "failed to persist cancel event");
        }

        let error_message = match message {
            Some(msg) => format!("{reason}: {msg}"),
            None => reason.to_string(),
        };

        // Status before finalizing, for the transition audit event.
        let from_status = executions::get_execution(&self.pool, execution_id)
            .await?
            .map(|e| e.status);

        let cleanup = tokio::time::timeout(self.cleanup_timeout, self.run_cleanup(execution_id));
        match cleanup.await {
            Ok(()) => {
                let rows = executions::finalize_status(
                    &self.pool,
                    execution_id,
                    reason.final_status(),
                    Some(&error_message),
                )
                .await?;
                if rows > 0 {
                    self.record_status_event(execution_id, from_status, reason.final_status())
                        .await;
                }
            }
            Err(_elapsed) => {
                let timeout_message = format!(
                    "cleanup exceeded {}s after cancellation ({error_message})",
                    self.cleanup_timeout.as_secs()
                );
                error!(execution_id = %execution_id, "{timeout_message}");
                let event = NewEvent::of(
                    execution_id,
                    "cleanup_timeout",
                    serde_json::json!({"budget_seconds": self.cleanup_timeout.as_secs()}),
                );
                if let Err(e) = events::insert_event(&self.pool, &event).await {
                    warn!(execution_id = %execution_id, error = %e, "failed to persist cleanup event");
                }
                let rows = executions::finalize_status(
                    &self.pool,
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(&timeout_message),
                )
                .await?;
                if rows > 0 {
                    self.record_status_event(execution_id, from_status, ExecutionStatus::Failed)
                        .await;
                }
            }
        }

        self.remove(execution_id);
        Ok(())
    }

    /// Best-effort `status_change` audit event for a finalize.
    async fn record_status_event(
        &self,
        execution_id: Uuid,
        from: Option<ExecutionStatus>,
        to: ExecutionStatus,
    ) {
        let event = NewEvent {
            execution_id,
            event_type: "status_change".to_owned(),
            from_status: from.map(|s| s.to_string()),
            to_status: Some(to.to_string()),
            details: serde_json::json!({}),
            ..NewEvent::default()
        };
        if let Err(e) = events::insert_event(&self.pool, &event).await {
            warn!(execution_id = %execution_id, error = %e, "failed to persist status event");
        }
    }

    /// Cancel every live execution. Used during graceful shutdown.
    pub async fn cancel_all(&self, reason: CancelReason, message: &str) {
        for execution_id in self.live_executions() {
            if let Err(e) = self
                .cancel_execution(execution_id, reason, Some(message), None)
                .await
            {
                error!(execution_id = %execution_id, error = %e, "failed to cancel execution");
            }
        }
    }

    /// Walk steps in reverse order, compensating each one that reached
    /// `running` or `completed`. Hook errors are logged and do not stop the
    /// walk; each visited step leaves a `step_cleanup` event.
    async fn run_cleanup(&self, execution_id: Uuid) {
        let step_rows = match steps::list_steps(&self.pool, execution_id).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "cleanup could not load steps");
                return;
            }
        };

        for step in step_rows.iter().rev() {
            if !matches!(step.status, StepStatus::Running | StepStatus::Completed) {
                continue;
            }

            let hook_ran = match self.hooks.get(&step.step_type) {
                Some(hook) => match hook.compensate(step).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            execution_id = %execution_id,
                            step_index = step.step_index,
                            error = %e,
                            "compensation hook failed"
                        );
                        false
                    }
                },
                None => false,
            };

            let event = NewEvent::of(
                execution_id,
                "step_cleanup",
                serde_json::json!({
                    "step_id": step.id,
                    "step_index": step.step_index,
                    "step_type": step.step_type,
                    "hook_ran": hook_ran,
                }),
            );
            if let Err(e) = events::insert_event(&self.pool, &event).await {
                warn!(execution_id = %execution_id, error = %e, "failed to persist cleanup event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_cancel_wins() {
        let token = ExecutionToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel(CancelReason::Timeout, Some("too slow".into())));
        assert!(!token.cancel(CancelReason::UserInitiated, None));

        let state = token.state().expect("state should be recorded");
        assert_eq!(state.reason, CancelReason::Timeout);
        assert_eq!(state.message.as_deref(), Some("too slow"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn callbacks_fire_once_and_swallow_panics() {
        let token = ExecutionToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        token.on_cancel(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        token.on_cancel(|| panic!("bad callback"));

        token.cancel(CancelReason::Error, None);
        token.cancel(CancelReason::Error, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reason_maps_to_final_status() {
        assert_eq!(CancelReason::Timeout.final_status(), ExecutionStatus::TimedOut);
        assert_eq!(
            CancelReason::UserInitiated.final_status(),
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            CancelReason::SystemShutdown.final_status(),
            ExecutionStatus::Cancelled
        );
    }

    #[test]
    fn reason_roundtrip() {
        for reason in [
            CancelReason::UserInitiated,
            CancelReason::Timeout,
            CancelReason::SystemShutdown,
            CancelReason::ResourceLimit,
            CancelReason::Error,
            CancelReason::Duplicate,
        ] {
            let parsed: CancelReason = reason.to_string().parse().unwrap();
            assert_eq!(parsed, reason);
        }
        assert!("nope".parse::<CancelReason>().is_err());
    }
}
