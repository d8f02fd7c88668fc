//! Route gateway (EMBP): every sibling module exports a subrouter and this
//! module merges them, attaches shared state and request tracing.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::settings::SettingsStore;
use crate::store::{ErrorLog, ReadingHistory};
use crate::subscriber::SubscriberStatus;

mod errors;
mod health;
mod ip;
mod readings;
mod settings;

// ---

/// Everything a handler may need, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub history: ReadingHistory,
    pub errors: ErrorLog,
    pub settings: Arc<SettingsStore>,
    pub subscriber: SubscriberStatus,
    pub http: reqwest::Client,
    pub public_ip_url: Arc<str>,
}

pub fn router(state: AppState, static_dir: &Path) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(settings::router())
        .merge(errors::router())
        .merge(ip::router())
        .merge(health::router())
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
