//! Public IP lookup, proxied through an external "what is my IP" service.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::AppState;

// ---

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router() -> Router<AppState> {
    Router::new().route("/api/ip", get(public_ip))
}

#[derive(Debug, Deserialize)]
struct IpifyResponse {
    ip: Option<String>,
}

async fn fetch_public_ip(client: &reqwest::Client, url: &str) -> Result<Option<String>, reqwest::Error> {
    // ---
    let body: IpifyResponse = client
        .get(url)
        .timeout(LOOKUP_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(body.ip.filter(|ip| !ip.is_empty()))
}

async fn public_ip(State(state): State<AppState>) -> impl IntoResponse {
    // ---
    match fetch_public_ip(&state.http, &state.public_ip_url).await {
        Ok(Some(ip)) => (StatusCode::OK, Json(json!({ "ip": ip }))),
        Ok(None) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "could not determine public IP" })),
        ),
        Err(e) => {
            error!(error = %e, url = %state.public_ip_url, "Error fetching public IP");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "failed to fetch public IP" })),
            )
        }
    }
}
