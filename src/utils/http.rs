use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

/// JSON envelope returned by every HTTP handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

pub type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

pub fn ok<T: Serialize>(status: StatusCode, data: T) -> ApiResult<T> {
    (status, Json(ApiResponse::success(data)))
}

pub fn fail<T: Serialize>(status: StatusCode, error: impl ToString) -> ApiResult<T> {
    (status, Json(ApiResponse::error(error.to_string())))
}

/// Plain-text body with an explicit content type, used for chapter exports.
pub fn text(content_type: &'static str, body: String) -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, content_type)], body)
}
