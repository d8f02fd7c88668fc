//! Client-reported error log.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::readings::{window_start, ClearResponse};
use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::ErrorLogEntry;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/error", post(log_error))
        .route("/api/errors", get(list_errors))
        .route("/api/errors/clear", post(clear_errors))
}

#[derive(Debug, Deserialize)]
struct LogErrorRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorsQuery {
    #[serde(default = "default_error_hours")]
    hours: u32,
}

fn default_error_hours() -> u32 {
    24
}

async fn log_error(
    State(state): State<AppState>,
    Json(body): Json<LogErrorRequest>,
) -> ApiResult<Json<ErrorLogEntry>> {
    // ---
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let entry = state.errors.record(&body.message).await?;
    warn!(id = entry.id, message = %entry.message, "Error logged");
    Ok(Json(entry))
}

async fn list_errors(
    State(state): State<AppState>,
    Query(params): Query<ErrorsQuery>,
) -> ApiResult<Json<Vec<ErrorLogEntry>>> {
    Ok(Json(state.errors.since(window_start(params.hours)).await?))
}

async fn clear_errors(State(state): State<AppState>) -> ApiResult<Json<ClearResponse>> {
    // ---
    let deleted_records = state.errors.clear().await?;
    info!(deleted_records, "Cleared error logs");
    Ok(Json(ClearResponse {
        deleted_records,
        message: "Error logs cleared successfully",
    }))
}
