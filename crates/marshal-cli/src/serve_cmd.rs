use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use marshal_core::monitor::{EventBus, MetricsRegistry};
use marshal_core::queue::dlq::DlqHandler;
use marshal_core::queue::QueueManager;
use marshal_core::submit::{SubmitError, SubmitRequest, Submitter};
use marshal_db::queries::events;

use crate::wiring::Runtime;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Validation(e) => Self::bad_request(e.to_string()),
            SubmitError::ApprovalNotFound(_) | SubmitError::ExecutionNotFound(_) => {
                Self::not_found(err.to_string())
            }
            SubmitError::ApprovalResolved(_) | SubmitError::PlanHashMismatch => {
                Self::conflict(err.to_string())
            }
            SubmitError::Internal(e) => Self::internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::PgPool,
    pub submitter: Arc<Submitter>,
    pub queue: Arc<QueueManager>,
    pub dlq: Arc<DlqHandler>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/executions", post(submit_execution))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/events", get(list_execution_events))
        .route("/api/executions/{id}/stream", get(stream_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/approvals/{id}", post(respond_approval))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/dlq", get(list_dlq))
        .route("/api/metrics", get(metrics_snapshot))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(runtime: Runtime, bind: &str, port: u16) -> Result<()> {
    let state = AppState {
        pool: runtime.pool.clone(),
        submitter: runtime.submitter.clone(),
        queue: runtime.queue.clone(),
        dlq: runtime.dlq.clone(),
        bus: runtime.bus.clone(),
        metrics: runtime.metrics.clone(),
    };

    // The API process also supervises workers so a single-process deploy
    // works out of the box.
    runtime.worker_pool.start().await;

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("marshal serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.worker_pool.stop().await;
    tracing::info!("marshal serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Tenant and actor arrive as headers; both are required.
fn principal(headers: &HeaderMap) -> Result<(String, String), AppError> {
    let tenant = headers
        .get("x-marshal-tenant")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::bad_request("missing x-marshal-tenant header"))?;
    let actor = headers
        .get("x-marshal-actor")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::bad_request("missing x-marshal-actor header"))?;
    Ok((tenant.to_owned(), actor.to_owned()))
}

async fn submit_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Result<axum::response::Response, AppError> {
    let (tenant_id, actor_id) = principal(&headers)?;
    let execution = state
        .submitter
        .submit(&request, &tenant_id, &actor_id)
        .await?;
    let view = state.submitter.describe(execution.id).await?;
    Ok((StatusCode::ACCEPTED, Json(view)).into_response())
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let view = state.submitter.describe(id).await?;
    Ok(Json(view).into_response())
}

#[derive(Debug, Deserialize)]
struct EventPage {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_execution_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<EventPage>,
) -> Result<axum::response::Response, AppError> {
    // 404 for unknown executions, not an empty page.
    state.submitter.describe(id).await?;
    let events = events::list_events(&state.pool, id, page.limit.clamp(1, 1000), page.offset)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(events).into_response())
}

async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe before validating so no notice is lost in between.
    let rx = state.bus.subscribe();
    state.submitter.describe(id).await?;

    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let out = match result {
            Ok(notice) if notice.execution_id == id => Event::default()
                .json_data(&notice)
                .ok()
                .map(Ok::<_, Infallible>),
            // Lagged receivers and foreign executions are skipped.
            _ => None,
        };
        futures::future::ready(out)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(default)]
    message: Option<String>,
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<CancelBody>>,
) -> Result<axum::response::Response, AppError> {
    let (_tenant, actor_id) = principal(&headers)?;
    let message = body.and_then(|Json(b)| b.message);
    let execution = state
        .submitter
        .cancel(id, &actor_id, message.as_deref())
        .await?;
    Ok(Json(execution).into_response())
}

#[derive(Debug, Deserialize)]
struct ApprovalBody {
    approve: bool,
}

async fn respond_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ApprovalBody>,
) -> Result<axum::response::Response, AppError> {
    let (_tenant, actor_id) = principal(&headers)?;
    let execution = state
        .submitter
        .respond_approval(id, body.approve, &actor_id)
        .await?;
    Ok(Json(execution).into_response())
}

async fn queue_stats(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let stats = state.queue.stats().await.map_err(AppError::internal)?;
    Ok(Json(stats).into_response())
}

#[derive(Debug, Deserialize)]
struct DlqPage {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    requeued: Option<bool>,
}

async fn list_dlq(
    State(state): State<AppState>,
    Query(page): Query<DlqPage>,
) -> Result<axum::response::Response, AppError> {
    let items = state
        .dlq
        .list(page.limit.clamp(1, 1000), page.offset, page.requeued)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(items).into_response())
}

async fn metrics_snapshot(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    Ok(Json(state.metrics.snapshot()).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
