pub mod candles;
pub mod convert;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API failure surfaced to clients as `{"detail": <code>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    NotFound(&'static str),
    UnprocessableEntity(&'static str),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Self::UnprocessableEntity(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}
