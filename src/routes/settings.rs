//! Temperature threshold settings.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{ApiError, ApiResult};

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/settings", get(get_settings).post(update_settings))
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsBody {
    temp_threshold: f64,
}

async fn get_settings(State(state): State<AppState>) -> Json<SettingsBody> {
    Json(SettingsBody {
        temp_threshold: state.settings.threshold(),
    })
}

async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<SettingsBody>,
) -> ApiResult<Json<SettingsBody>> {
    // ---
    // The store does blocking file I/O under its lock.
    let settings = state.settings.clone();
    let temp_threshold =
        tokio::task::spawn_blocking(move || settings.set_threshold(body.temp_threshold))
            .await
            .map_err(|e| ApiError::Internal(format!("settings update aborted: {e}")))??;
    Ok(Json(SettingsBody { temp_threshold }))
}
