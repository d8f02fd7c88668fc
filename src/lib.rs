//! `thermoguard`: two-sensor temperature ingestion with outlier filtering.
//!
//! Readings arrive on an MQTT topic or a Redis pub/sub channel, pass
//! through the outlier filter (`filter`), and are appended to a SQLite
//! history (`store`) by the ingestion pipeline (`pipeline`). The `subscriber` module owns the
//! background worker's connect/listen/stop lifecycle. An axum HTTP surface
//! (`routes`) exposes the history, the durable alert threshold (`settings`),
//! and a client error log.

pub mod config;
pub mod error;
pub mod filter;
mod models;
pub mod pipeline;
pub mod routes;
pub mod schema;
pub mod settings;
pub mod store;
pub mod subscriber;
pub mod telemetry;

pub use config::Config;

// Re-exported at the crate root so sibling modules depend on `crate::Reading`
// rather than on where the model happens to live.
pub use models::{ErrorLogEntry, RawMessage, Reading};
