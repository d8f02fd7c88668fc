//! Reconnection strategy for a dropped channel session.
//!
//! The default is [`ReconnectPolicy::Never`]: a transport failure ends the
//! session and the controller settles in `Idle` until someone calls
//! `start()` again. [`ReconnectPolicy::Backoff`] retries with exponential
//! backoff instead, optionally giving up after a fixed number of attempts.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::Transport;

// ---

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this many failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReconnectPolicy {
    #[default]
    Never,
    Backoff(BackoffConfig),
}

/// Calculate the next backoff delay, clamped to [`BackoffConfig::max_delay`].
///
/// Never returns less than 1 ms unless `max_delay` itself is smaller, so a
/// zero starting delay still backs off.
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms.max(1)).min(config.max_delay)
}

/// Try to open a fresh session according to `policy`.
///
/// Returns `None` when the policy forbids reconnecting, the attempts are
/// exhausted, or `cancel` fires first.
pub async fn reconnect_loop<T: Transport>(
    transport: &T,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> Option<T::Session> {
    // ---
    let config = match policy {
        ReconnectPolicy::Never => return None,
        ReconnectPolicy::Backoff(config) => config,
    };

    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        if config.max_attempts.is_some_and(|max| attempt >= max) {
            tracing::error!(attempts = attempt, "Giving up on reconnecting to channel");
            return None;
        }
        attempt += 1;

        // Wait before each attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to channel");

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Reconnect cancelled");
                return None;
            }
            result = transport.connect() => match result {
                Ok(session) => {
                    tracing::info!(attempt, "Reconnected to channel");
                    return Some(session);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt {attempt} failed");
                }
            }
        }

        delay = next_delay(delay, config);
    }
}
