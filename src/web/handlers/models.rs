use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::model::ModelKind;
use crate::utils::http::ok;
use crate::AppContext;

pub fn models_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(model_status))
        .route("/unload", post(unload_models))
        .with_state(ctx)
}

async fn model_status(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    ok(StatusCode::OK, ctx.models.status().await)
}

#[derive(Debug, Deserialize)]
struct UnloadQuery {
    kind: Option<ModelKind>,
}

/// Unloads one model, or every idle model when no kind is given. Models in
/// use by a running stage stay loaded.
async fn unload_models(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<UnloadQuery>,
) -> impl IntoResponse {
    let unloaded = match query.kind {
        Some(kind) => {
            if ctx.models.release(kind).await {
                vec![kind]
            } else {
                Vec::new()
            }
        }
        None => ctx.models.unload_idle().await,
    };
    info!("Unloaded models: {:?}", unloaded);
    ok(StatusCode::OK, unloaded)
}
