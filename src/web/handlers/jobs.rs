use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{events, job_failure};
use crate::schedule::types::ProcessingConfig;
use crate::utils::http::ok;
use crate::web::Pagination;
use crate::AppContext;

pub fn jobs_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", post(start_job).get(list_jobs))
        .route("/active", get(active_jobs))
        .route("/:job_id", get(get_job))
        .route("/:job_id/cancel", post(cancel_job))
        .route("/:job_id/restart", post(restart_job))
        .route("/:job_id/events", get(events::job_events))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub video_id: String,
    #[serde(default)]
    pub config: ProcessingConfig,
}

#[derive(Debug, Serialize)]
struct StartJobResponse {
    job_id: String,
}

// Start processing a video
async fn start_job(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<StartJobRequest>,
) -> impl IntoResponse {
    match ctx.job_manager.start(&req.video_id, req.config).await {
        Ok(job_id) => {
            info!(job_id = %job_id, video_id = %req.video_id, "Job accepted");
            ok(StatusCode::ACCEPTED, StartJobResponse { job_id })
        }
        Err(e) => job_failure(e),
    }
}

async fn list_jobs(
    State(ctx): State<Arc<AppContext>>,
    Query(pagination): Query<Pagination>,
) -> impl IntoResponse {
    match ctx.job_manager.list_jobs(&pagination.check()).await {
        Ok(jobs) => ok(StatusCode::OK, jobs),
        Err(e) => job_failure(e),
    }
}

async fn active_jobs(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    match ctx.job_manager.active_jobs().await {
        Ok(jobs) => ok(StatusCode::OK, jobs),
        Err(e) => job_failure(e),
    }
}

async fn get_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match ctx.job_manager.get_status(&job_id).await {
        Ok(job) => ok(StatusCode::OK, job),
        Err(e) => job_failure(e),
    }
}

async fn cancel_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match ctx.job_manager.cancel(&job_id).await {
        Ok(job) => ok(StatusCode::ACCEPTED, job),
        Err(e) => job_failure(e),
    }
}

async fn restart_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match ctx.job_manager.restart(&job_id).await {
        Ok(job) => ok(StatusCode::ACCEPTED, job),
        Err(e) => job_failure(e),
    }
}
