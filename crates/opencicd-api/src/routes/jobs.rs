//! Job management endpoints.

use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use opencicd_config::parse_job;
use opencicd_core::ResourceId;
use opencicd_core::job::{Job, JobDefinition, StepDefinition};
use opencicd_core::run::{Run, RunRequest, TriggerKind};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job).put(update_steps).delete(delete_job))
        .route("/{id}/runs", post(create_run))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    include_deleted: bool,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.plane.list_jobs(query.include_deleted).await?))
}

/// Accepts a JSON job definition, or KDL when the body is sent as `application/kdl` or
/// `text/plain`.
pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let definition = parse_definition(&headers, &body)?;
    let job = state.plane.create_job(definition).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

fn parse_definition(headers: &HeaderMap, body: &str) -> Result<JobDefinition, ApiError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    if content_type.contains("kdl") || content_type.starts_with("text/") {
        Ok(parse_job(body)?)
    } else {
        serde_json::from_str(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid job definition: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct GetJobQuery {
    version: Option<u32>,
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<GetJobQuery>,
) -> Result<Json<Job>, ApiError> {
    let job = match query.version {
        Some(version) => state.plane.get_job_version(id, version).await?,
        None => state.plane.get_job(id).await?,
    };
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct UpdateStepsRequest {
    steps: Vec<StepDefinition>,
}

async fn update_steps(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(req): Json<UpdateStepsRequest>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.plane.update_job_steps(id, req.steps).await?))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.plane.delete_job(id).await?))
}

async fn create_run(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    if matches!(req.trigger, TriggerKind::Retry { .. }) {
        return Err(ApiError::BadRequest(
            "retry runs are created by the control plane".to_string(),
        ));
    }
    let run = state.plane.create_run(id, req).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const KDL: &str = r#"
job "build" {
    repository "https://example.com/app.git"
    step "test" { run "cargo test" }
}
"#;

    #[test]
    fn test_kdl_body_selected_by_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/kdl"));
        let definition = parse_definition(&headers, KDL).unwrap();
        assert_eq!(definition.name, "build");
        assert_eq!(definition.steps[0].command, "cargo test");
    }

    #[test]
    fn test_json_is_the_default() {
        let body = r#"{"name":"lint","repository":"r","steps":[{"name":"x","command":"true"}]}"#;
        let definition = parse_definition(&HeaderMap::new(), body).unwrap();
        assert_eq!(definition.name, "lint");
        assert!(parse_definition(&HeaderMap::new(), KDL).is_err());
    }
}
