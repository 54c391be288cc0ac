//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use herald_common::error::AppError;
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let queue_length = state.queue.len().await?;

    Ok(Json(json!({
        "status": "ok",
        "service": "herald",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_index": state.instance_index,
        "worker_count": state.worker_count,
        "queue_length": queue_length,
    })))
}
