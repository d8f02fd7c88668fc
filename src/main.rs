//! Application entry point for the `thermoguard` service.
//!
//! This binary orchestrates the full startup sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the SQLite pool and creating the schema if it does not exist
//! - Loading the durable threshold settings
//! - Starting the channel subscriber (MQTT or Redis) that feeds the
//!   ingestion pipeline, retrying per the reconnect policy
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Serving until Ctrl-C / SIGTERM, then stopping the subscriber
//!
//! # Environment Variables
//! - `CHANNEL_KIND` (optional) – `mqtt` (default, needs `MQTT_HOST`) or `redis`
//! - `AXUM_LOG_LEVEL` / `LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `LOKI_URL` (optional) – also ship logs to Loki
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//! - see `config.rs` for the rest
use std::{env, sync::Arc};

use anyhow::Result;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use thermoguard::pipeline::Ingestor;
use thermoguard::routes::{self, AppState};
use thermoguard::settings::SettingsStore;
use thermoguard::store::{self, ErrorLog, ReadingHistory};
use thermoguard::subscriber::channel::ChannelTransport;
use thermoguard::subscriber::{Subscriber, SubscriberError};
use thermoguard::telemetry::LokiSettings;
use thermoguard::{config, schema};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing()?;

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Opening database: {}", cfg.database_path);

    let pool = store::open_pool(&cfg.database_path, cfg.db_pool_max)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database '{}': {}", cfg.database_path, e))?;

    schema::create_schema(&pool).await?;

    let history = ReadingHistory::new(pool.clone());
    let settings = Arc::new(SettingsStore::load(&cfg.settings_path, cfg.default_threshold));

    let subscriber = Arc::new(Subscriber::new(
        ChannelTransport::new(cfg.channel.clone()),
        cfg.subscriber_options(),
    ));
    subscriber.set_message_handler(Arc::new(Ingestor::new(history.clone(), cfg.filter)));

    // The HTTP surface stays up without a channel; /health reports it.
    tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        async move {
            match subscriber.start_with_retry().await {
                Ok(()) | Err(SubscriberError::Cancelled) => {}
                Err(e) => tracing::error!(error = %e, "Subscriber did not start"),
            }
        }
    });

    let state = AppState {
        history,
        errors: ErrorLog::new(pool.clone()),
        settings,
        subscriber: subscriber.status(),
        http: reqwest::Client::new(),
        public_ip_url: cfg.public_ip_url.as_str().into(),
    };
    let app = routes::router(state, &cfg.static_dir);

    tracing::info!("Listening on {}", cfg.bind_addr);

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Application shutting down");
    subscriber.stop().await;
    pool.close().await;
    tracing::info!("Application shutdown completed");

    Ok(())
}

// ---

/// Resolve on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, falling back to `AXUM_LOG_LEVEL`,
///   then `LOG_LEVEL`
/// - A Loki layer when `LOKI_URL` is set (see [`LokiSettings`]); its
///   shipping task is spawned here, so this must run inside the runtime
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() -> Result<()> {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let requested = env::var("AXUM_LOG_LEVEL")
            .or_else(|_| env::var("LOG_LEVEL"))
            .map(|v| v.to_ascii_lowercase())
            .ok();
        let level = match requested.as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") | Some("warning") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        // The Loki shipper's own HTTP traffic stays out of the stream.
        EnvFilter::new(format!(
            "{level},sqlx::query=warn,rumqttc=info,redis=info,hyper=info,hyper_util=info,reqwest=info"
        ))
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_ansi(use_color)
        .compact();

    let loki_layer = match LokiSettings::from_env()? {
        Some(settings) => {
            let (layer, task) = settings.build()?;
            tokio::spawn(task);
            Some((layer, settings))
        }
        None => None,
    };

    let (loki_layer, loki_settings) = loki_layer.unzip();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(loki_layer)
        .try_init()?;

    if let Some(settings) = loki_settings {
        tracing::info!(
            url = %settings.url,
            application = %settings.application,
            environment = %settings.environment,
            version = %settings.version,
            "Shipping logs to Loki"
        );
    }

    Ok(())
}
