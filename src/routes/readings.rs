//! Reading history endpoints: latest value, time window, bulk clear.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::AppState;
use crate::error::ApiResult;
use crate::Reading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/current", get(current))
        .route("/api/history", get(history))
        .route("/api/clear", post(clear))
}

/// Latest reading, without the store id.
#[derive(Debug, Serialize)]
struct CurrentResponse {
    timestamp: DateTime<Utc>,
    avg_temp1: f64,
    avg_temp2: f64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_hours")]
    hours: u32,
}

fn default_history_hours() -> u32 {
    6
}

#[derive(Debug, Serialize)]
pub(super) struct ClearResponse {
    pub deleted_records: u64,
    pub message: &'static str,
}

/// Start of a window reaching `hours` back from now, clamped to the
/// earliest representable time.
pub(super) fn window_start(hours: u32) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(Duration::hours(i64::from(hours)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn current(State(state): State<AppState>) -> ApiResult<Json<CurrentResponse>> {
    // ---
    let response = match state.history.current().await? {
        Some(reading) => {
            info!(
                temperature_sensor1 = reading.avg_temp1,
                temperature_sensor2 = reading.avg_temp2,
                timestamp = %reading.timestamp,
                "Current temperature retrieved"
            );
            CurrentResponse {
                timestamp: reading.timestamp,
                avg_temp1: reading.avg_temp1,
                avg_temp2: reading.avg_temp2,
            }
        }
        None => {
            warn!("No temperature records found");
            CurrentResponse {
                timestamp: Utc::now(),
                avg_temp1: 0.0,
                avg_temp2: 0.0,
            }
        }
    };
    Ok(Json(response))
}

async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Reading>>> {
    // ---
    let readings = state.history.since(window_start(params.hours)).await?;
    info!(hours = params.hours, count = readings.len(), "History retrieved");
    Ok(Json(readings))
}

async fn clear(State(state): State<AppState>) -> ApiResult<Json<ClearResponse>> {
    // ---
    let deleted_records = state.history.clear().await?;
    info!(deleted_records, "Cleared temperature records");
    Ok(Json(ClearResponse {
        deleted_records,
        message: "Database cleared successfully",
    }))
}
