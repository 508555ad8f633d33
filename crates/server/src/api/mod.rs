pub mod handlers;
pub mod pipelines;
pub mod pool;
pub mod routes;
pub mod tasks;
pub mod ws;

pub use routes::create_router;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// Error body shape shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) fn error_response(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}
