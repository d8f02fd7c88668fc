//! Message ingestion: decode → filter → append.
//!
//! [`Ingestor`] is the single processing entry point the subscriber worker
//! calls for every payload. It never fails in a way that should stop the
//! worker; decode and storage problems are logged and the message is dropped.

use std::future::Future;

use crate::filter::{filter_value, FilterParams, FilteredValue, SensorId};
use crate::store::ReadingHistory;
use crate::{RawMessage, Reading};

// ---

/// Processes one raw payload received from the channel.
///
/// Implementations must absorb their own errors: the subscriber worker keeps
/// running no matter what a single message does.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, payload: &[u8]) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("reading history unavailable: {0}")]
    Store(#[from] sqlx::Error),
}

/// Result of filtering one message against the recent history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredPair {
    pub sensor1: FilteredValue,
    pub sensor2: FilteredValue,
}

impl FilteredPair {
    pub fn any_substituted(&self) -> bool {
        self.sensor1.was_substituted() || self.sensor2.was_substituted()
    }
}

/// Filter both sensors of `raw` independently.
///
/// `recent` holds the last accepted readings, newest first; only the first
/// two are used.
pub fn filter_pair(raw: RawMessage, recent: &[Reading], params: &FilterParams) -> FilteredPair {
    // ---
    let prev = recent.first();
    let prev_prev = recent.get(1);

    let sensor1 = filter_value(
        SensorId::Sensor1,
        raw.avg_temp1,
        prev.map(|r| r.avg_temp1),
        prev_prev.map(|r| r.avg_temp1),
        params,
    );
    let sensor2 = filter_value(
        SensorId::Sensor2,
        raw.avg_temp2,
        prev.map(|r| r.avg_temp2),
        prev_prev.map(|r| r.avg_temp2),
        params,
    );

    FilteredPair { sensor1, sensor2 }
}

/// Turns channel payloads into stored [`Reading`]s.
#[derive(Debug, Clone)]
pub struct Ingestor {
    history: ReadingHistory,
    params: FilterParams,
}

impl Ingestor {
    // ---
    pub fn new(history: ReadingHistory, params: FilterParams) -> Self {
        Self { history, params }
    }

    /// Decode and ingest one payload.
    pub async fn process(&self, payload: &[u8]) -> Result<Reading, IngestError> {
        // ---
        let raw = RawMessage::decode(payload)?;
        self.ingest(raw).await
    }

    /// Filter `raw` against the last two accepted readings and store the
    /// result.
    pub async fn ingest(&self, raw: RawMessage) -> Result<Reading, IngestError> {
        // ---
        let recent = if self.params.enabled {
            self.history.latest(2).await?
        } else {
            Vec::new()
        };

        let pair = filter_pair(raw, &recent, &self.params);
        for value in [&pair.sensor1, &pair.sensor2] {
            if value.was_substituted() {
                tracing::warn!(
                    sensor = %value.sensor,
                    original = value.original,
                    substituted = value.stored,
                    previous = ?value.previous,
                    verdict = %value.verdict,
                    "Outlier rejected, keeping previous value"
                );
            }
        }

        let reading = self
            .history
            .append(pair.sensor1.stored, pair.sensor2.stored)
            .await?;

        tracing::info!(
            id = reading.id,
            temperature_sensor1 = reading.avg_temp1,
            temperature_sensor2 = reading.avg_temp2,
            original_temp1 = raw.avg_temp1,
            original_temp2 = raw.avg_temp2,
            outlier_filtered = pair.any_substituted(),
            "Temperature data saved"
        );
        Ok(reading)
    }
}

impl MessageHandler for Ingestor {
    async fn handle(&self, payload: &[u8]) {
        // ---
        match self.process(payload).await {
            Ok(_) => {}
            Err(IngestError::Decode(e)) => {
                tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Discarding malformed message"
                );
            }
            Err(IngestError::Store(e)) => {
                tracing::error!(error = %e, "Failed to persist reading, message lost");
            }
        }
    }
}
