//! API routes.

pub mod agents;
pub mod health;
pub mod jobs;
pub mod runs;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::{get, post};

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/register", post(agents::register))
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/runs", runs::router())
        .nest("/agents", agents::router())
}
