//! Outlier filtering for the two temperature sensors.
//!
//! A new raw value is compared against the last one or two *accepted* values
//! of the same sensor. Values that jump outside a percentage band around the
//! previous reading are treated as transient glitches unless they continue a
//! trend that was already under way. Rejected values are replaced by the
//! previous accepted value before the reading is stored.
//!
//! Everything in here is pure: no I/O, no clocks, no shared state. The
//! ingestion pipeline (`pipeline.rs`) supplies the history.

use std::fmt;

// ---

/// Protocol-level "no valid measurement" marker published by the sensors.
pub const SENTINEL: f64 = -999.0;

/// Default relative band width (25%) around the previous accepted value.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 0.25;

/// Default hard floor in °C; anything below it is rejected outright.
pub const DEFAULT_MIN_TEMP: f64 = 10.0;

/// Which of the two sensors a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    Sensor1,
    Sensor2,
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorId::Sensor1 => write!(f, "sensor1"),
            SensorId::Sensor2 => write!(f, "sensor2"),
        }
    }
}

/// Tunables for [`evaluate`] / [`decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// When false, raw values are stored unchanged.
    pub enabled: bool,
    /// Relative half-width of the acceptance band, e.g. `0.25` for ±25%.
    pub threshold_percent: f64,
    /// Values strictly below this are rejected (unless they are the sentinel).
    pub min_temp: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            min_temp: DEFAULT_MIN_TEMP,
        }
    }
}

/// Outcome of evaluating one sensor value, naming the rule that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Filtering is switched off; the raw value is kept.
    Disabled,
    /// No usable previous value to compare against.
    NoReference,
    /// The new value is the sentinel and is passed through untouched.
    SentinelPassthrough,
    /// Inside the percentage band around the previous value.
    WithinBand,
    /// Outside the band but continuing the previous trend direction.
    SustainedTrend,
    /// Below the hard temperature floor.
    BelowFloor,
    /// Outside the band with no trend to justify it.
    OutsideBand,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            Verdict::Disabled
                | Verdict::NoReference
                | Verdict::SentinelPassthrough
                | Verdict::WithinBand
                | Verdict::SustainedTrend
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Disabled => "disabled",
            Verdict::NoReference => "no_reference",
            Verdict::SentinelPassthrough => "sentinel_passthrough",
            Verdict::WithinBand => "within_band",
            Verdict::SustainedTrend => "sustained_trend",
            Verdict::BelowFloor => "below_floor",
            Verdict::OutsideBand => "outside_band",
        };
        f.write_str(s)
    }
}

fn is_sentinel(value: f64) -> bool {
    value == SENTINEL
}

/// Apply the filter rules to a single sensor value.
///
/// Rules, first match wins:
/// 1. no previous value (or previous is the sentinel) → accept
/// 2. new value is the sentinel → accept
/// 3. below `min_temp` → reject
/// 4. within `prev * (1 ± threshold_percent)` → accept
/// 5. both `prev - prev_prev` and `new - prev` strictly positive, or both
///    strictly negative → accept
/// 6. otherwise reject
pub fn evaluate(
    new_value: f64,
    prev_value: Option<f64>,
    prev_prev_value: Option<f64>,
    params: &FilterParams,
) -> Verdict {
    // ---
    let prev = match prev_value {
        Some(p) if !is_sentinel(p) => p,
        _ => return Verdict::NoReference,
    };

    if is_sentinel(new_value) {
        return Verdict::SentinelPassthrough;
    }

    if new_value < params.min_temp {
        return Verdict::BelowFloor;
    }

    let lower = prev * (1.0 - params.threshold_percent);
    let upper = prev * (1.0 + params.threshold_percent);
    if (lower..=upper).contains(&new_value) {
        return Verdict::WithinBand;
    }

    if let Some(prev_prev) = prev_prev_value.filter(|v| !is_sentinel(*v)) {
        let prev_trend = prev - prev_prev;
        let current_trend = new_value - prev;
        let rising = prev_trend > 0.0 && current_trend > 0.0;
        let falling = prev_trend < 0.0 && current_trend < 0.0;
        if rising || falling {
            return Verdict::SustainedTrend;
        }
    }

    Verdict::OutsideBand
}

/// Boolean form of [`evaluate`]; `sensor` is only used for tracing.
pub fn decide(
    sensor: SensorId,
    new_value: f64,
    prev_value: Option<f64>,
    prev_prev_value: Option<f64>,
    params: &FilterParams,
) -> bool {
    // ---
    let verdict = evaluate(new_value, prev_value, prev_prev_value, params);
    tracing::trace!(%sensor, new_value, ?prev_value, ?prev_prev_value, %verdict, "outlier check");
    verdict.is_accepted()
}

/// The value that will be stored for one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredValue {
    pub sensor: SensorId,
    /// Raw value as received.
    pub original: f64,
    /// Value to persist: `original` when accepted, otherwise the previous
    /// accepted value.
    pub stored: f64,
    /// Previous accepted value used as the comparator, if any.
    pub previous: Option<f64>,
    pub verdict: Verdict,
}

impl FilteredValue {
    pub fn was_substituted(&self) -> bool {
        !self.verdict.is_accepted()
    }
}

/// Run the filter for one sensor and compute the value to store.
///
/// With filtering disabled the raw value is always kept.
pub fn filter_value(
    sensor: SensorId,
    new_value: f64,
    prev_value: Option<f64>,
    prev_prev_value: Option<f64>,
    params: &FilterParams,
) -> FilteredValue {
    // ---
    let verdict = if params.enabled {
        evaluate(new_value, prev_value, prev_prev_value, params)
    } else {
        Verdict::Disabled
    };

    // A rejection can only happen when `prev_value` is present (rule 1).
    let stored = match (verdict.is_accepted(), prev_value) {
        (false, Some(prev)) => prev,
        _ => new_value,
    };

    FilteredValue {
        sensor,
        original: new_value,
        stored,
        previous: prev_value,
        verdict,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn p() -> FilterParams {
        FilterParams::default()
    }

    fn accepts(new: f64, prev: Option<f64>, prev_prev: Option<f64>) -> bool {
        decide(SensorId::Sensor1, new, prev, prev_prev, &p())
    }

    #[test]
    fn accepts_values_inside_band() {
        // ---
        for prev in [10.5, 20.0, 55.5, 100.0, 480.0] {
            for ratio in [0.75, 0.8, 0.99, 1.0, 1.1, 1.25] {
                let new = prev * ratio;
                if new < DEFAULT_MIN_TEMP {
                    continue;
                }
                assert!(accepts(new, Some(prev), None), "prev={prev} new={new}");
            }
        }
    }

    #[test]
    fn floor_rejects_regardless_of_trend() {
        // ---
        assert!(!accepts(9.99, Some(10.5), None));
        assert!(!accepts(5.0, Some(20.0), Some(30.0)));
        assert!(!accepts(0.0, Some(12.0), Some(15.0)));
        assert!(!accepts(-20.0, Some(11.0), Some(11.5)));
        assert_eq!(
            evaluate(9.0, Some(11.0), Some(13.0), &p()),
            Verdict::BelowFloor
        );
    }

    #[test]
    fn floor_does_not_apply_to_sentinel() {
        // ---
        assert!(accepts(SENTINEL, Some(85.0), Some(80.0)));
    }

    #[test]
    fn falling_trend_is_allowed_past_band() {
        // ---
        assert_eq!(
            evaluate(60.0, Some(90.0), Some(100.0), &p()),
            Verdict::SustainedTrend
        );
    }

    #[test]
    fn reversal_outside_band_is_rejected() {
        // ---
        assert_eq!(
            evaluate(60.0, Some(110.0), Some(100.0), &p()),
            Verdict::OutsideBand
        );
    }

    #[test]
    fn flat_history_gives_no_trend() {
        // ---
        assert!(!accepts(200.0, Some(100.0), Some(100.0)));
    }

    #[test]
    fn sentinel_history_disables_trend_check() {
        // ---
        assert!(!accepts(60.0, Some(90.0), Some(SENTINEL)));
    }

    #[test]
    fn sentinel_passthrough() {
        // ---
        assert_eq!(
            evaluate(SENTINEL, Some(85.0), Some(80.0), &p()),
            Verdict::SentinelPassthrough
        );
        assert_eq!(
            evaluate(85.0, Some(SENTINEL), Some(80.0), &p()),
            Verdict::NoReference
        );
        assert!(accepts(3.0, None, None));
    }

    #[test]
    fn band_edges_are_inclusive() {
        // ---
        assert!(accepts(75.0, Some(100.0), None));
        assert!(accepts(125.0, Some(100.0), None));
        assert!(!accepts(125.01, Some(100.0), None));
    }

    #[test]
    fn rejection_substitutes_previous_value() {
        // ---
        let v = filter_value(SensorId::Sensor2, 5.0, Some(20.0), Some(20.0), &p());
        assert!(v.was_substituted());
        assert_eq!(v.stored, 20.0);
        assert_eq!(v.original, 5.0);
        assert_eq!(v.previous, Some(20.0));
    }

    #[test]
    fn sentinel_is_preserved_bit_for_bit() {
        // ---
        let v = filter_value(SensorId::Sensor1, SENTINEL, Some(30.0), None, &p());
        assert_eq!(v.stored.to_bits(), SENTINEL.to_bits());
    }

    #[test]
    fn disabled_filter_passes_raw_values() {
        // ---
        let params = FilterParams {
            enabled: false,
            ..FilterParams::default()
        };
        let v = filter_value(SensorId::Sensor1, 1.0, Some(50.0), Some(49.0), &params);
        assert!(!v.was_substituted());
        assert_eq!(v.stored, 1.0);
        assert_eq!(v.verdict, Verdict::Disabled);
        assert!(v.verdict.is_accepted());
        assert_eq!(v.verdict.to_string(), "disabled");
    }

    #[test]
    fn custom_parameters_are_honoured() {
        // ---
        let params = FilterParams {
            enabled: true,
            threshold_percent: 0.1,
            min_temp: 0.0,
        };
        assert!(decide(SensorId::Sensor1, 5.0, Some(5.4), None, &params));
        assert!(!decide(SensorId::Sensor1, 120.0, Some(100.0), None, &params));
    }
}
