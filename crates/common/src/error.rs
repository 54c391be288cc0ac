use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy shared by the dispatch path and the delivery workers.
///
/// Workers do not branch on these variants; they classify failures into
/// delivery outcomes at the call site.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Down(String),

    #[error("Transient transport error: {0}")]
    TransportTransient(String),

    #[error("Permanent transport error: {0}")]
    TransportPermanent(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Down(_) => StatusCode::BAD_GATEWAY,
            AppError::TransportTransient(_) | AppError::TransportPermanent(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Persistence(_)
            | AppError::Crypto(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({ "errors": [self.to_string()] });
        (status, Json(body)).into_response()
    }
}
