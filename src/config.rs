//! Configuration loader for the `thermoguard` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::filter::{FilterParams, DEFAULT_MIN_TEMP, DEFAULT_THRESHOLD_PERCENT};
use crate::settings::DEFAULT_TEMP_THRESHOLD;
use crate::subscriber::channel::{ChannelKind, ChannelSettings};
use crate::subscriber::mqtt::MqttSettings;
use crate::subscriber::redis::RedisSettings;
use crate::subscriber::{BackoffConfig, ReconnectPolicy, SubscriberOptions};

/// Parse an optional environment variable of type `$ty` with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Read an optional string variable, treating empty as unset.
fn optional_env(var_name: &str) -> Option<String> {
    env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// SQLite database file.
    pub database_path: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen address.
    pub bind_addr: SocketAddr,

    /// Upstream channel (MQTT broker or Redis pub/sub) and its topic.
    pub channel: ChannelSettings,

    /// How long shutdown waits for the subscriber worker.
    pub stop_timeout: Duration,

    /// What the subscriber does when the broker connection drops.
    pub reconnect: ReconnectPolicy,

    /// JSON file holding the persisted threshold.
    pub settings_path: PathBuf,

    /// Threshold reported until one has been set.
    pub default_threshold: f64,

    /// Outlier filter tunables.
    pub filter: FilterParams,

    /// Directory served at `/` and `/static`.
    pub static_dir: PathBuf,

    /// Service queried by `/api/ip`.
    pub public_ip_url: String,
}

/// Load configuration from environment variables with defaults.
///
/// Channel selection:
/// - `CHANNEL_KIND` – `mqtt` or `redis` (default: `mqtt`)
/// - `MQTT_HOST` – broker host name, **required** when `CHANNEL_KIND=mqtt`
///
/// Optional:
/// - `DATABASE_PATH` – SQLite file (default: `./temperature.db`)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – HTTP listen address (default: `0.0.0.0:8000`)
/// - `MQTT_PORT` (1883), `MQTT_TOPIC` (`temps`, wildcards allowed),
///   `MQTT_CLIENT_ID` (`thermoguard-<uuid>`), `MQTT_USERNAME`,
///   `MQTT_PASSWORD`, `MQTT_KEEP_ALIVE_SECS` (30),
///   `MQTT_CONNECT_TIMEOUT_SECS` (10)
/// - `REDIS_HOST` (`localhost`), `REDIS_PORT` (6379), `REDIS_DB` (0),
///   `REDIS_PASSWORD`, `REDIS_CHANNEL` (`temps`),
///   `REDIS_CONNECT_TIMEOUT_SECS` (10)
/// - `SUBSCRIBER_STOP_TIMEOUT_SECS` – bounded join on shutdown (default: 5)
/// - `CHANNEL_RECONNECT` – `never` or `backoff` (default: `never`), with
///   `CHANNEL_RECONNECT_INITIAL_MS` (1000, must be > 0),
///   `CHANNEL_RECONNECT_MAX_MS` (30000),
///   `CHANNEL_RECONNECT_MAX_ATTEMPTS` (0 = unlimited)
/// - `SETTINGS_PATH` (`settings.json`), `DEFAULT_TEMP_THRESHOLD` (200.0)
/// - `OUTLIER_FILTER_ENABLED` (true), `OUTLIER_THRESHOLD_PERCENT` (0.25),
///   `OUTLIER_MIN_TEMP` (10.0)
/// - `STATIC_DIR` (`./static`), `PUBLIC_IP_URL`
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let kind = parse_env!("CHANNEL_KIND", ChannelKind, ChannelKind::Mqtt);

    let database_path = optional_env("DATABASE_PATH").unwrap_or_else(|| "./temperature.db".into());
    let db_pool_max = parse_env!("DB_POOL_MAX", u32, 5);
    let bind_addr = parse_env!("BIND_ADDR", SocketAddr, SocketAddr::from(([0, 0, 0, 0], 8000)));

    let channel = match kind {
        ChannelKind::Mqtt => ChannelSettings::Mqtt(load_mqtt_settings()?),
        ChannelKind::Redis => ChannelSettings::Redis(load_redis_settings()?),
    };

    let stop_timeout = Duration::from_secs(parse_env!("SUBSCRIBER_STOP_TIMEOUT_SECS", u64, 5));
    let reconnect = parse_reconnect_policy()?;

    let settings_path = optional_env("SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("settings.json"));
    let default_threshold = parse_env!("DEFAULT_TEMP_THRESHOLD", f64, DEFAULT_TEMP_THRESHOLD);
    if !default_threshold.is_finite() {
        bail!("DEFAULT_TEMP_THRESHOLD must be finite");
    }

    let filter = FilterParams {
        enabled: parse_env!("OUTLIER_FILTER_ENABLED", bool, true),
        threshold_percent: parse_env!("OUTLIER_THRESHOLD_PERCENT", f64, DEFAULT_THRESHOLD_PERCENT),
        min_temp: parse_env!("OUTLIER_MIN_TEMP", f64, DEFAULT_MIN_TEMP),
    };
    if !(0.0..=1.0).contains(&filter.threshold_percent) {
        bail!("OUTLIER_THRESHOLD_PERCENT must be between 0 and 1");
    }

    let static_dir = optional_env("STATIC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./static"));
    let public_ip_url = optional_env("PUBLIC_IP_URL")
        .unwrap_or_else(|| "https://api.ipify.org?format=json".into());

    Ok(Config {
        database_path,
        db_pool_max,
        bind_addr,
        channel,
        stop_timeout,
        reconnect,
        settings_path,
        default_threshold,
        filter,
        static_dir,
        public_ip_url,
    })
}

fn load_mqtt_settings() -> Result<MqttSettings> {
    // ---
    let mqtt = MqttSettings {
        host: require_env!("MQTT_HOST"),
        port: parse_env!("MQTT_PORT", u16, 1883),
        topic: optional_env("MQTT_TOPIC").unwrap_or_else(|| "temps".into()),
        client_id: optional_env("MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("thermoguard-{}", uuid::Uuid::new_v4().simple())),
        username: optional_env("MQTT_USERNAME"),
        password: optional_env("MQTT_PASSWORD"),
        keep_alive: Duration::from_secs(parse_env!("MQTT_KEEP_ALIVE_SECS", u64, 30)),
        connect_timeout: Duration::from_secs(parse_env!("MQTT_CONNECT_TIMEOUT_SECS", u64, 10)),
    };
    if !rumqttc::valid_filter(&mqtt.topic) {
        bail!("Invalid MQTT_TOPIC: {}", mqtt.topic);
    }
    if !mqtt.keep_alive.is_zero() && mqtt.keep_alive < Duration::from_secs(1) {
        bail!("MQTT_KEEP_ALIVE_SECS must be 0 or at least 1");
    }
    Ok(mqtt)
}

fn load_redis_settings() -> Result<RedisSettings> {
    // ---
    let redis = RedisSettings {
        host: optional_env("REDIS_HOST").unwrap_or_else(|| "localhost".into()),
        port: parse_env!("REDIS_PORT", u16, 6379),
        db: parse_env!("REDIS_DB", i64, 0),
        password: optional_env("REDIS_PASSWORD"),
        channel: optional_env("REDIS_CHANNEL").unwrap_or_else(|| "temps".into()),
        connect_timeout: Duration::from_secs(parse_env!("REDIS_CONNECT_TIMEOUT_SECS", u64, 10)),
    };
    if redis.db < 0 {
        bail!("REDIS_DB must not be negative");
    }
    Ok(redis)
}

fn parse_reconnect_policy() -> Result<ReconnectPolicy> {
    // ---
    let mode = optional_env("CHANNEL_RECONNECT").unwrap_or_else(|| "never".into());
    match mode.trim().to_ascii_lowercase().as_str() {
        "never" | "off" | "none" => Ok(ReconnectPolicy::Never),
        "backoff" | "exponential" => Ok(ReconnectPolicy::Backoff(backoff_config(
            parse_env!("CHANNEL_RECONNECT_INITIAL_MS", u64, 1000),
            parse_env!("CHANNEL_RECONNECT_MAX_MS", u64, 30_000),
            parse_env!("CHANNEL_RECONNECT_MAX_ATTEMPTS", u32, 0),
        )?)),
        other => bail!("Invalid CHANNEL_RECONNECT: {other} (expected never or backoff)"),
    }
}

/// Build the backoff parameters; `max_attempts == 0` means unlimited.
fn backoff_config(initial_ms: u64, max_ms: u64, max_attempts: u32) -> Result<BackoffConfig> {
    // ---
    if initial_ms == 0 {
        bail!("CHANNEL_RECONNECT_INITIAL_MS must be greater than 0");
    }
    if max_ms < initial_ms {
        bail!("CHANNEL_RECONNECT_MAX_MS must be at least CHANNEL_RECONNECT_INITIAL_MS");
    }
    Ok(BackoffConfig {
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        multiplier: 2.0,
        max_attempts: (max_attempts > 0).then_some(max_attempts),
    })
}

impl Config {
    // ---
    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            stop_timeout: self.stop_timeout,
            reconnect: self.reconnect.clone(),
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the broker password while showing all configuration values
    /// that were loaded.
    pub fn log_config(&self) {
        // ---

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_PATH          : {}", self.database_path);
        tracing::info!("  DB_POOL_MAX            : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR              : {}", self.bind_addr);
        tracing::info!("  CHANNEL_KIND           : {}", self.channel.kind());
        match &self.channel {
            ChannelSettings::Mqtt(mqtt) => {
                let masked_password = mqtt.password.as_ref().map(|_| "****");
                tracing::info!("  MQTT_HOST              : {}", mqtt.host);
                tracing::info!("  MQTT_PORT              : {}", mqtt.port);
                tracing::info!("  MQTT_TOPIC             : {}", mqtt.topic);
                tracing::info!("  MQTT_CLIENT_ID         : {}", mqtt.client_id);
                tracing::info!("  MQTT_USERNAME          : {:?}", mqtt.username);
                tracing::info!("  MQTT_PASSWORD          : {:?}", masked_password);
            }
            ChannelSettings::Redis(redis) => {
                let masked_password = redis.password.as_ref().map(|_| "****");
                tracing::info!("  REDIS_HOST             : {}", redis.host);
                tracing::info!("  REDIS_PORT             : {}", redis.port);
                tracing::info!("  REDIS_DB               : {}", redis.db);
                tracing::info!("  REDIS_CHANNEL          : {}", redis.channel);
                tracing::info!("  REDIS_PASSWORD         : {:?}", masked_password);
            }
        }
        tracing::info!("  CHANNEL_RECONNECT      : {:?}", self.reconnect);
        tracing::info!("  SUBSCRIBER_STOP_TIMEOUT: {:?}", self.stop_timeout);
        tracing::info!("  SETTINGS_PATH          : {}", self.settings_path.display());
        tracing::info!("  DEFAULT_TEMP_THRESHOLD : {}", self.default_threshold);
        tracing::info!("  OUTLIER_FILTER         : {:?}", self.filter);
        tracing::info!("  STATIC_DIR             : {}", self.static_dir.display());
        tracing::info!("  PUBLIC_IP_URL          : {}", self.public_ip_url);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_backoff_config_rejects_zero_initial_delay() {
        // ---
        assert!(backoff_config(0, 30_000, 0).is_err());
    }

    #[test]
    fn test_backoff_config_rejects_max_below_initial() {
        // ---
        assert!(backoff_config(5_000, 1_000, 0).is_err());
    }

    #[test]
    fn test_backoff_config_zero_attempts_means_unlimited() {
        // ---
        let config = backoff_config(250, 10_000, 0).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.max_attempts, None);
        assert_eq!(backoff_config(250, 10_000, 4).unwrap().max_attempts, Some(4));
    }
}
