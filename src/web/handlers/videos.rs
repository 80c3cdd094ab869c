use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use super::job_failure;
use crate::audio::probe_duration;
use crate::chapters::{export_chapters, Chapter, ExportFormat, ExportOptions};
use crate::storage::VideoInfo;
use crate::utils::http::{fail, ok, text};
use crate::AppContext;

pub fn videos_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", post(register_video))
        .route("/:video_id/estimate", get(estimate))
        .route("/:video_id/chapters", get(chapters))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
pub struct RegisterVideoRequest {
    pub id: String,
    pub source_path: PathBuf,
    /// Seconds; probed with ffprobe when omitted.
    pub duration: Option<f64>,
}

async fn register_video(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<RegisterVideoRequest>,
) -> Response {
    if req.id.trim().is_empty() {
        return fail::<()>(StatusCode::BAD_REQUEST, "Video id must not be empty").into_response();
    }
    let duration = match req.duration {
        Some(duration) => duration,
        None => match probe_duration(&req.source_path).await {
            Ok(duration) => duration,
            Err(e) => {
                error!("Failed to probe {:?}: {}", req.source_path, e);
                return fail::<()>(StatusCode::BAD_REQUEST, e).into_response();
            }
        },
    };
    if !duration.is_finite() || duration <= 0.0 {
        return fail::<()>(StatusCode::BAD_REQUEST, "Duration must be a positive number of seconds")
            .into_response();
    }

    let video = VideoInfo {
        id: req.id,
        duration,
        source_path: req.source_path,
    };
    match ctx.videos.register_video(&video).await {
        Ok(()) => {
            info!(video_id = %video.id, duration, "Video registered");
            ok(StatusCode::CREATED, video).into_response()
        }
        Err(e) => {
            error!("Failed to register video: {:#}", e);
            fail::<()>(StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error").into_response()
        }
    }
}

async fn estimate(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> impl IntoResponse {
    match ctx.job_manager.estimate(&video_id).await {
        Ok(estimate) => ok(StatusCode::OK, estimate),
        Err(e) => job_failure(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChapterQuery {
    format: Option<String>,
    include_timestamps: Option<bool>,
    include_confidence: Option<bool>,
}

impl ChapterQuery {
    fn options(&self) -> ExportOptions {
        let defaults = ExportOptions::default();
        ExportOptions {
            include_timestamps: self.include_timestamps.unwrap_or(defaults.include_timestamps),
            include_confidence: self.include_confidence.unwrap_or(defaults.include_confidence),
        }
    }
}

/// Stored chapters in the JSON envelope, or exported as a file when
/// `format` is given.
async fn chapters(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Query(query): Query<ChapterQuery>,
) -> Response {
    let chapters = match ctx.job_manager.get_chapters(&video_id).await {
        Ok(chapters) => chapters,
        Err(e) => return job_failure::<Vec<Chapter>>(e).into_response(),
    };

    let Some(format) = query.format.as_deref() else {
        return ok(StatusCode::OK, chapters).into_response();
    };
    let format: ExportFormat = match format.parse() {
        Ok(format) => format,
        Err(e) => return fail::<()>(StatusCode::BAD_REQUEST, e).into_response(),
    };
    match export_chapters(&chapters, format, query.options()) {
        Ok(body) => text(format.content_type(), body).into_response(),
        Err(e) => {
            error!(video_id = %video_id, "Chapter export failed: {:#}", e);
            fail::<()>(StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}
