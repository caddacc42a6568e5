//! Agent endpoints: registration, heartbeats, assignment polling and reports.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use opencicd_core::agent::{Agent, AgentFilter, AgentRegistration};
use opencicd_core::audit::TransitionRecord;
use opencicd_core::lifecycle::AgentState;
use opencicd_core::report::{AgentReport, ReportKind};
use opencicd_core::run::Run;
use opencicd_core::{AgentId, ResourceId};
use serde::Deserialize;

use crate::AppState;
use crate::delivery::Mailbox;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents).post(register))
        .route("/{id}", get(get_agent))
        .route("/{id}/heartbeat", post(heartbeat))
        .route("/{id}/assignment", get(poll_assignment))
        .route("/{id}/reports", post(report))
        .route("/{id}/history", get(history))
}

pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<AgentRegistration>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = state.plane.register_agent(registration).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    state: Option<AgentState>,
    /// Comma-separated capability tags.
    capability: Option<String>,
}

impl From<ListAgentsQuery> for AgentFilter {
    fn from(query: ListAgentsQuery) -> Self {
        AgentFilter {
            state: query.state,
            capabilities: query
                .capability
                .iter()
                .flat_map(|c| c.split(','))
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect(),
        }
    }
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.plane.list_agents(query.into()).await?))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.plane.get_agent(&id).await?))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.plane.heartbeat(&id).await?))
}

/// A poll doubles as a heartbeat.
async fn poll_assignment(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Mailbox>, ApiError> {
    state.plane.heartbeat(&id).await?;
    Ok(Json(state.mailbox.take(&id)))
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    run_id: ResourceId,
    event: ReportKind,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

async fn report(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .plane
        .report(AgentReport {
            agent_id: id,
            run_id: req.run_id,
            event: req.event,
            at: req.at,
        })
        .await?;
    Ok(Json(run))
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> Result<Json<Vec<TransitionRecord>>, ApiError> {
    Ok(Json(state.plane.agent_history(&id).await?))
}
