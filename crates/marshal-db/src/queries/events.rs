//! Database query functions for the append-only `execution_events` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ExecutionEvent;

/// Parameters for inserting a new event row.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub execution_id: Uuid,
    pub event_type: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub actor_id: Option<String>,
    pub actor_type: Option<String>,
    pub details: serde_json::Value,
    pub error_message: Option<String>,
    pub trace_id: Option<Uuid>,
}

impl NewEvent {
    /// Shorthand for an event with only a type and details payload.
    pub fn of(execution_id: Uuid, event_type: &str, details: serde_json::Value) -> Self {
        Self {
            execution_id,
            event_type: event_type.to_owned(),
            details,
            ..Self::default()
        }
    }
}

/// Insert a new event row. Returns the inserted row with server-generated
/// defaults (id, created_at).
pub async fn insert_event(pool: &PgPool, new: &NewEvent) -> Result<ExecutionEvent> {
    let event = sqlx::query_as::<_, ExecutionEvent>(
        "INSERT INTO execution_events (execution_id, event_type, from_status, to_status, \
                                       actor_id, actor_type, details, error_message, trace_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.execution_id)
    .bind(&new.event_type)
    .bind(&new.from_status)
    .bind(&new.to_status)
    .bind(&new.actor_id)
    .bind(&new.actor_type)
    .bind(&new.details)
    .bind(&new.error_message)
    .bind(new.trace_id)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert event {} for execution {}",
            new.event_type, new.execution_id
        )
    })?;

    Ok(event)
}

/// List events for an execution in `created_at` order, paginated.
pub async fn list_events(
    pool: &PgPool,
    execution_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<ExecutionEvent>> {
    let events = sqlx::query_as::<_, ExecutionEvent>(
        "SELECT * FROM execution_events \
         WHERE execution_id = $1 \
         ORDER BY created_at ASC, id ASC \
         LIMIT $2 OFFSET $3",
    )
    .bind(execution_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list execution events")?;

    Ok(events)
}

/// List events of one type for an execution.
pub async fn list_events_of_type(
    pool: &PgPool,
    execution_id: Uuid,
    event_type: &str,
) -> Result<Vec<ExecutionEvent>> {
    let events = sqlx::query_as::<_, ExecutionEvent>(
        "SELECT * FROM execution_events \
         WHERE execution_id = $1 AND event_type = $2 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(execution_id)
    .bind(event_type)
    .fetch_all(pool)
    .await
    .context("failed to list execution events by type")?;

    Ok(events)
}
