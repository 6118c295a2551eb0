use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
///
/// `Completed`, `Partial`, `Failed`, `Cancelled`, and `TimedOut` are
/// terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    PendingApproval,
    Approved,
    Queued,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether `from -> to` is an edge of the execution state machine:
    ///
    /// ```text
    /// pending_approval -> approved | cancelled
    /// approved         -> queued | running | cancelled | timed_out
    /// queued           -> running | cancelled | failed | timed_out
    /// running          -> completed | partial | failed | cancelled | timed_out
    /// ```
    ///
    /// Terminal states have no outgoing edges.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::PendingApproval, Self::Approved)
                | (Self::PendingApproval, Self::Cancelled)
                | (Self::Approved, Self::Queued)
                | (Self::Approved, Self::Running)
                | (Self::Approved, Self::Cancelled)
                | (Self::Approved, Self::TimedOut)
                | (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::TimedOut)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Partial)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::TimedOut)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(StatusParseError("execution status", other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid status or class string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub &'static str, pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.0, self.1)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether this status is terminal for a step.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StatusParseError("step status", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// How an execution is run: synchronously in the submitting task, or through
/// the background queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Inline,
    Queued,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inline => "inline",
            Self::Queued => "queued",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionMode {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Self::Inline),
            "queued" => Ok(Self::Queued),
            other => Err(StatusParseError("execution mode", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Coarse time budget for an execution. Drives timeouts, retry bounds, and
/// queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SlaClass {
    Fast,
    Medium,
    Long,
}

impl fmt::Display for SlaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Long => "long",
        };
        f.write_str(s)
    }
}

impl FromStr for SlaClass {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "medium" => Ok(Self::Medium),
            "long" => Ok(Self::Long),
            other => Err(StatusParseError("sla class", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Coarse mutation profile of a step, used with [`SlaClass`] to look up a
/// timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Read,
    Write,
    Complex,
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Complex => "complex",
        };
        f.write_str(s)
    }
}

impl FromStr for ActionClass {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "complex" => Ok(Self::Complex),
            other => Err(StatusParseError("action class", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError("queue status", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// State of an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalState {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(StatusParseError("approval state", other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// The durable record of one plan invocation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub idempotency_key: String,
    pub plan_snapshot: serde_json::Value,
    pub plan_hash: String,
    pub execution_mode: ExecutionMode,
    pub sla_class: SlaClass,
    pub approval_level: i32,
    pub status: ExecutionStatus,
    pub previous_status: Option<String>,
    pub status_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub trace_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
    pub tags: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// One ordered unit inside an execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionStep {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_index: i32,
    pub step_name: String,
    pub step_type: String,
    pub target_asset_id: Option<String>,
    pub target_hostname: Option<String>,
    pub input_data: serde_json::Value,
    pub status: StepStatus,
    pub attempt: i32,
    pub max_retries: i32,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionEvent {
    pub id: i64,
    pub execution_id: Uuid,
    pub event_type: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub actor_id: Option<String>,
    pub actor_type: Option<String>,
    pub details: serde_json::Value,
    pub error_message: Option<String>,
    pub trace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The scheduling artifact: one row per background dispatch of an execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueItem {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub priority: i32,
    pub sla_class: SlaClass,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub visibility_timeout_seconds: i32,
    pub enqueued_at: DateTime<Utc>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Snapshot of a queue item that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DlqItem {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub original_queue_id: Uuid,
    pub failure_reason: String,
    pub attempt_count: i32,
    pub original_priority: i32,
    pub original_sla_class: SlaClass,
    pub failed_at: DateTime<Utc>,
    pub requeued: bool,
    pub requeued_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

/// Per-asset lease lock.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetLock {
    pub id: Uuid,
    pub asset_id: String,
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub owner_tag: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub is_active: bool,
}

/// One cell of the (SLA class x action class) timeout matrix.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimeoutPolicy {
    pub sla_class: SlaClass,
    pub action_class: ActionClass,
    pub step_timeout_seconds: i32,
    pub execution_timeout_seconds: i32,
    pub lease_timeout_seconds: i32,
    pub approval_timeout_seconds: i32,
    pub max_attempts: i32,
}

/// Approval gate for high-privilege plans.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Approval {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub approval_level: i32,
    pub plan_hash: String,
    pub state: ApprovalState,
    pub approver_id: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
