use axum::http::StatusCode;
use axum::Router;
use std::sync::Arc;
use tracing::error;

use crate::error::JobError;
use crate::utils::http::{fail, ApiResult};
use crate::AppContext;

pub mod events;
pub mod jobs;
pub mod models;
pub mod videos;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .nest("/jobs", jobs::jobs_router(ctx.clone()))
        .nest("/videos", videos::videos_router(ctx.clone()))
        .nest("/models", models::models_router(ctx))
}

pub(crate) fn job_error_status(err: &JobError) -> StatusCode {
    match err {
        JobError::AlreadyProcessing { .. } => StatusCode::CONFLICT,
        JobError::JobNotFound(_) | JobError::VideoNotFound(_) => StatusCode::NOT_FOUND,
        JobError::InvalidVideo { .. } | JobError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        JobError::InvalidState { .. } => StatusCode::CONFLICT,
        JobError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Maps a job API error onto the JSON envelope. Storage failures are logged
/// and reported without their internals.
pub(crate) fn job_failure<T: serde::Serialize>(err: JobError) -> ApiResult<T> {
    let status = job_error_status(&err);
    match err {
        JobError::Storage(e) => {
            error!("Storage failure: {:#}", e);
            fail(status, "Internal storage error")
        }
        e => fail(status, e),
    }
}
