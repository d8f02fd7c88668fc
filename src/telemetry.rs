//! Optional log shipping to Grafana Loki.
//!
//! Enabled when `LOKI_URL` is set. Every event that passes the process log
//! filter is also queued for Loki, labelled with `application`,
//! `environment` and `version`. Shipping happens on a background task and
//! never blocks the caller; if Loki is unreachable the queued events are
//! dropped.

use anyhow::{Context, Result};
use tracing_loki::url::Url;

// ---

pub const DEFAULT_APPLICATION: &str = "thermoguard";
pub const DEFAULT_ENVIRONMENT: &str = "production";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LokiSettings {
    /// Base URL of the Loki server; the push path is appended.
    pub url: Url,
    pub application: String,
    pub environment: String,
    pub version: String,
}

impl LokiSettings {
    /// Read `LOKI_URL`, `SERVICE_NAME`, `ENVIRONMENT` and `SERVICE_VERSION`.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        // ---
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(raw_url) = get("LOKI_URL") else {
            return Ok(None);
        };
        let url = Url::parse(raw_url.trim())
            .with_context(|| format!("Invalid LOKI_URL: {raw_url}"))?;

        Ok(Some(Self {
            url,
            application: get("SERVICE_NAME").unwrap_or_else(|| DEFAULT_APPLICATION.into()),
            environment: get("ENVIRONMENT").unwrap_or_else(|| DEFAULT_ENVIRONMENT.into()),
            version: get("SERVICE_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").into()),
        }))
    }

    /// Build the tracing layer and the task that ships its batches.
    ///
    /// The task must be spawned on the runtime for anything to be sent.
    pub fn build(&self) -> Result<(tracing_loki::Layer, tracing_loki::BackgroundTask)> {
        // ---
        let (layer, task) = tracing_loki::builder()
            .label("application", self.application.as_str())?
            .label("environment", self.environment.as_str())?
            .label("version", self.version.as_str())?
            .extra_field("pid", std::process::id().to_string())?
            .build_url(self.url.clone())?;
        Ok((layer, task))
    }
}
