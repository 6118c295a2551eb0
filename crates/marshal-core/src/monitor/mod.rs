//! Progress derivation, rolling metrics, and the live event bus.
//!
//! Progress is always derived from step rows on demand -- nothing
//! denormalized is persisted. Notices on the bus carry IDs, statuses,
//! counters, and timestamps only; step payloads and secrets never ride it.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use marshal_db::models::{ExecutionStatus, SlaClass};
use marshal_db::queries::steps;

/// Snapshot of an execution's step progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub total_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
    pub skipped_steps: i64,
    pub running_steps: i64,
    pub percent_complete: f64,
}

/// Derive progress from the step rows of an execution.
pub async fn progress(pool: &PgPool, execution_id: Uuid) -> Result<Progress> {
    let counts = steps::step_counts(pool, execution_id).await?;
    let finished = counts.completed + counts.failed + counts.skipped;
    let percent = if counts.total > 0 {
        (finished as f64 / counts.total as f64) * 100.0
    } else {
        0.0
    };
    Ok(Progress {
        total_steps: counts.total,
        completed_steps: counts.completed,
        failed_steps: counts.failed,
        skipped_steps: counts.skipped,
        running_steps: counts.running,
        percent_complete: percent,
    })
}

/// What a notice reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    StatusChanged,
    StepStarted,
    StepFinished,
    Progress,
}

/// A live update pushed to subscribers. IDs and counters only.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionNotice {
    pub kind: NoticeKind,
    pub tenant_id: String,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub at: DateTime<Utc>,
}

impl ExecutionNotice {
    pub fn status(tenant_id: &str, execution_id: Uuid, status: ExecutionStatus) -> Self {
        Self {
            kind: NoticeKind::StatusChanged,
            tenant_id: tenant_id.to_owned(),
            execution_id,
            status: Some(status),
            step_index: None,
            progress: None,
            at: Utc::now(),
        }
    }

    pub fn step(
        kind: NoticeKind,
        tenant_id: &str,
        execution_id: Uuid,
        step_index: i32,
        progress: Option<Progress>,
    ) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.to_owned(),
            execution_id,
            status: None,
            step_index: Some(step_index),
            progress,
            at: Utc::now(),
        }
    }
}

/// In-process publish/subscribe channel for execution notices.
///
/// Consumers (SSE handlers, WebSocket bridges) subscribe and filter by
/// (tenant, execution). Publishing never blocks; with no subscribers the
/// notice is dropped.
pub struct EventBus {
    tx: broadcast::Sender<ExecutionNotice>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionNotice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: ExecutionNotice) {
        // An Err here only means nobody is listening right now.
        let _ = self.tx.send(notice);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Apply an optimistic status transition, record the audit event, and push
/// a notice to the bus. Every status change in the system goes through this
/// (or through the cancellation manager, which does the same finalizing).
///
/// Returns `false` when the execution was not in `from` -- the caller lost a
/// race and must re-read.
pub async fn record_transition(
    pool: &PgPool,
    bus: &EventBus,
    tenant_id: &str,
    execution_id: Uuid,
    from: ExecutionStatus,
    to: ExecutionStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    if !from.can_transition_to(to) {
        anyhow::bail!("invalid state transition: {from} -> {to} for execution {execution_id}");
    }

    let rows =
        marshal_db::queries::executions::transition_status(pool, execution_id, from, to, error_message)
            .await?;
    if rows == 0 {
        return Ok(false);
    }

    let event = marshal_db::queries::events::NewEvent {
        execution_id,
        event_type: "status_change".to_owned(),
        from_status: Some(from.to_string()),
        to_status: Some(to.to_string()),
        error_message: error_message.map(str::to_owned),
        details: serde_json::json!({}),
        ..Default::default()
    };
    marshal_db::queries::events::insert_event(pool, &event).await?;

    bus.publish(ExecutionNotice::status(tenant_id, execution_id, to));
    Ok(true)
}

/// Rolling per-(tenant, SLA class) counters, updated on terminal
/// transitions.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsRow {
    pub tenant_id: String,
    pub sla_class: SlaClass,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Default)]
struct Counters {
    started: u64,
    completed: u64,
    failed: u64,
    total_duration_ms: u64,
}

/// In-process metrics registry.
pub struct MetricsRegistry {
    inner: Mutex<HashMap<(String, SlaClass), Counters>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_started(&self, tenant_id: &str, sla_class: SlaClass) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .entry((tenant_id.to_owned(), sla_class))
            .or_default()
            .started += 1;
    }

    /// Record a terminal transition. `partial` counts as completed for the
    /// success rate; `failed`, `cancelled`, and `timed_out` count as failed.
    pub fn record_terminal(
        &self,
        tenant_id: &str,
        sla_class: SlaClass,
        status: ExecutionStatus,
        duration_ms: u64,
    ) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let counters = inner.entry((tenant_id.to_owned(), sla_class)).or_default();
        match status {
            ExecutionStatus::Completed | ExecutionStatus::Partial => counters.completed += 1,
            _ => counters.failed += 1,
        }
        counters.total_duration_ms += duration_ms;
    }

    pub fn snapshot(&self) -> Vec<MetricsRow> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let mut rows: Vec<MetricsRow> = inner
            .iter()
            .map(|((tenant_id, sla_class), c)| {
                let terminal = c.completed + c.failed;
                MetricsRow {
                    tenant_id: tenant_id.clone(),
                    sla_class: *sla_class,
                    started: c.started,
                    completed: c.completed,
                    failed: c.failed,
                    total_duration_ms: c.total_duration_ms,
                    success_rate: if terminal > 0 {
                        c.completed as f64 / terminal as f64
                    } else {
                        0.0
                    },
                    avg_duration_ms: if terminal > 0 {
                        c.total_duration_ms as f64 / terminal as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        rows.sort_by(|a, b| (&a.tenant_id, a.sla_class as u8).cmp(&(&b.tenant_id, b.sla_class as u8)));
        rows
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
