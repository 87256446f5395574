//! Data Sanitization
//!
//! Numerical stability utilities shared by the processor and the analysis code.

use crate::types::{DEFAULT_SCORE, MAX_SCORE, MIN_SCORE};

/// Numerical stability epsilon
pub const EPSILON: f64 = 1e-10;

/// True if any value is NaN or infinite.
pub fn has_invalid_values(arr: &[f64]) -> bool {
    arr.iter().any(|&x| x.is_nan() || x.is_infinite())
}

/// Clamp into [0, 100]. NaN falls back to the default score.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return DEFAULT_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Replace non-finite values with `None`.
pub fn finite_or_none(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Round to a fixed number of decimals. Non-finite values pass through.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_invalid_values() {
        assert!(!has_invalid_values(&[1.0, 2.0]));
        assert!(has_invalid_values(&[1.0, f64::NAN]));
        assert!(has_invalid_values(&[f64::INFINITY]));
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(-3.0), 0.0);
        assert_eq!(clamp_score(104.2), 100.0);
        assert_eq!(clamp_score(42.5), 42.5);
        assert_eq!(clamp_score(f64::NAN), DEFAULT_SCORE);
        assert_eq!(clamp_score(f64::INFINITY), 100.0);
    }

    #[test]
    fn test_finite_helpers() {
        assert_eq!(finite_or_none(f64::NEG_INFINITY), None);
        assert_eq!(finite_or_none(2.0), Some(2.0));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert!(round_to(f64::NAN, 2).is_nan());
    }
}
