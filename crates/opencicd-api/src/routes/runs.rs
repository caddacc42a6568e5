//! Run endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use opencicd_core::audit::TransitionRecord;
use opencicd_core::lifecycle::RunState;
use opencicd_core::run::Run;
use opencicd_core::update::LogLine;
use opencicd_core::{AgentId, ResourceId};
use opencicd_db::RunFilter;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// Largest log page a single request may ask for.
const MAX_LOG_PAGE: usize = 5000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs))
        .route("/queue", get(queue))
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
        .route("/{id}/history", get(history))
        .route("/{id}/logs", get(logs))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    state: Option<RunState>,
    job_id: Option<ResourceId>,
    agent: Option<AgentId>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let filter = RunFilter {
        state: query.state,
        job_id: query.job_id,
        agent: query.agent,
    };
    Ok(Json(state.plane.list_runs(&filter).await?))
}

#[derive(Debug, Serialize)]
struct QueueResponse {
    runs: Vec<ResourceId>,
}

/// Pending runs in the order the scheduler will serve them.
async fn queue(State(state): State<AppState>) -> Json<QueueResponse> {
    Json(QueueResponse {
        runs: state.plane.queued(),
    })
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.plane.get_run(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Run>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    Ok(Json(state.plane.cancel_run(id, req.reason).await?))
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<Vec<TransitionRecord>>, ApiError> {
    Ok(Json(state.plane.run_history(id).await?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    step: Option<usize>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn logs(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogLine>>, ApiError> {
    let limit = query.limit.unwrap_or(1000).min(MAX_LOG_PAGE);
    Ok(Json(
        state
            .plane
            .run_logs(id, query.step, query.offset, limit)
            .await?,
    ))
}
