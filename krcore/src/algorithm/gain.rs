use serde::{Deserialize, Serialize};

use crate::data::histogram::PadKey;

/// Sentinel written to the gain table for pads whose gain could not be
/// determined or falls outside the acceptable bounds.
pub const GAIN_SENTINEL: f64 = -1.0;

/// Outcome of the gain computation for one pad.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GainRecord {
    pub key: PadKey,
    /// Located peak position the gain was derived from.
    pub peak_position: f64,
    /// The computed gain with NaN/Inf coerced to 0. Kept for the audit
    /// table regardless of acceptability.
    pub gain: f64,
    pub acceptable: bool,
}

impl GainRecord {
    /// The value the gain table carries for this pad: the gain when
    /// acceptable, the sentinel otherwise.
    pub fn table_value(&self) -> f64 {
        if self.acceptable {
            self.gain
        } else {
            GAIN_SENTINEL
        }
    }
}

/// Derives a pad's gain from its located peak and the sector reference
/// average. With a prior gain (update mode) the prior is refined
/// multiplicatively; without one the gain is the plain ratio.
///
/// Numeric edge cases never escape: a zero or missing peak produces a
/// sanitized gain of 0 marked unacceptable, never NaN or Inf.
pub fn compute_gain(
    key: PadKey,
    sector_average: f64,
    pad_peak: f64,
    prior_gain: Option<f64>,
    min_acceptable: f64,
    max_acceptable: f64,
) -> GainRecord {
    let ratio = sector_average / pad_peak;
    let raw = match prior_gain {
        Some(prior) => prior * ratio,
        None => ratio,
    };

    let gain = if raw.is_finite() { raw } else { 0.0 };
    let acceptable = gain > min_acceptable && gain < max_acceptable;

    GainRecord {
        key,
        peak_position: pad_peak,
        gain,
        acceptable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PadKey {
        PadKey::new(1, 1, 1, 1)
    }

    #[test]
    fn test_base_case_ratio() {
        let record = compute_gain(key(), 100.0, 80.0, None, 0.5, 2.0);
        assert!((record.gain - 1.25).abs() < 1e-12);
        assert!(record.acceptable);
        assert_eq!(record.table_value(), record.gain);
    }

    #[test]
    fn test_update_case_scales_prior() {
        let record = compute_gain(key(), 100.0, 50.0, Some(2.0), 0.5, 8.0);
        assert!((record.gain - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_peak_sanitized_to_zero() {
        let record = compute_gain(key(), 100.0, 0.0, None, 0.5, 2.0);
        assert_eq!(record.gain, 0.0);
        assert!(!record.acceptable);
        assert_eq!(record.table_value(), GAIN_SENTINEL);
    }

    #[test]
    fn test_acceptability_bounds_are_strict() {
        // Exactly on the bound is excluded.
        let on_bound = compute_gain(key(), 50.0, 100.0, None, 0.5, 2.0);
        assert_eq!(on_bound.gain, 0.5);
        assert!(!on_bound.acceptable);

        // Just inside is included.
        let inside = compute_gain(key(), 50.0 + 1e-6, 100.0, None, 0.5, 2.0);
        assert!(inside.acceptable);
    }

    #[test]
    fn test_unacceptable_gain_preserved_for_audit() {
        let record = compute_gain(key(), 1000.0, 100.0, None, 0.5, 2.0);
        assert!((record.gain - 10.0).abs() < 1e-12);
        assert!(!record.acceptable);
        assert_eq!(record.table_value(), GAIN_SENTINEL);
    }
}
