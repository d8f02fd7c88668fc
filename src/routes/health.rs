// src/routes/health.rs
//! API health check endpoint for the thermoguard backend.
//!
//! This module defines the `/health` route used by container orchestrators
//! and CI pipelines to verify that the service is running and whether the
//! channel subscriber is currently listening. It is a sibling module in the
//! `routes` directory and follows the Explicit Module Boundary Pattern (EMBP):
//! - Internal to this file: endpoint handler(s) and related types
//! - Exports to the gateway (`mod.rs`): a subrouter containing the `/health` route

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::subscriber::SubscriberState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    subscriber: SubscriberState,
    subscriber_connected: bool,
}

/// Handle `GET /health`.
///
/// Always reports `"ok"` while the process is serving; the subscriber
/// fields show whether readings are currently being ingested. Does not
/// touch the database.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    // ---
    let subscriber = state.subscriber.state();
    Json(HealthResponse {
        status: "ok",
        subscriber,
        subscriber_connected: subscriber == SubscriberState::Listening,
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
