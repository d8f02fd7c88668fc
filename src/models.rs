//! Simple data models for the temperature pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Raw message published on the sensor topic.
///
/// Only the two averaged temperatures are required; any other fields the
/// publisher adds are ignored. A payload that is missing either field or
/// carries a non-numeric value fails to decode and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RawMessage {
    // ---
    pub avg_temp1: f64,
    pub avg_temp2: f64,
}

impl RawMessage {
    // ---
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// One accepted, stored observation.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub avg_temp1: f64,
    pub avg_temp2: f64,
}

/// Free-form operational error reported by a client.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ErrorLogEntry {
    // ---
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}
