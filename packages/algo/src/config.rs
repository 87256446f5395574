//! Controller configuration.
//!
//! All tunables live in one immutable [`EbarsConfig`] that is handed to the
//! processor, mapper and assessment at construction time, so several parameter
//! sets can run side by side in the same process.

use serde::{Deserialize, Serialize};

use crate::error::{EbarsError, Result};
use crate::sanitize::has_invalid_values;
use crate::types::{
    ComplexityTier, ContentParameters, DifficultyLevel, Elaboration, Emoji, DEFAULT_SCORE,
    MAX_SCORE, MIN_SCORE,
};

/// Signed score adjustment per emoji.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmojiDeltaTable {
    pub strong_positive: f64,
    pub mild_positive: f64,
    pub neutral: f64,
    pub negative: f64,
}

impl Default for EmojiDeltaTable {
    fn default() -> Self {
        Self {
            strong_positive: 2.5,
            mild_positive: 1.8,
            neutral: 0.2,
            negative: -1.5,
        }
    }
}

impl EmojiDeltaTable {
    pub fn delta_for(&self, emoji: Emoji) -> f64 {
        match emoji {
            Emoji::StrongPositive => self.strong_positive,
            Emoji::MildPositive => self.mild_positive,
            Emoji::Neutral => self.neutral,
            Emoji::Negative => self.negative,
        }
    }

    /// Largest absolute adjustment before momentum.
    pub fn max_magnitude(&self) -> f64 {
        [
            self.strong_positive,
            self.mild_positive,
            self.neutral,
            self.negative,
        ]
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

/// Inclusive upper bound of each band except `excellent`, which runs to 100.
///
/// Defaults give very_struggling [0,30], struggling (30,45], normal (45,70],
/// good (70,84], excellent (84,100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandThresholds {
    pub very_struggling_max: f64,
    pub struggling_max: f64,
    pub normal_max: f64,
    pub good_max: f64,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            very_struggling_max: 30.0,
            struggling_max: 45.0,
            normal_max: 70.0,
            good_max: 84.0,
        }
    }
}

impl BandThresholds {
    pub fn uppers(&self) -> [f64; 4] {
        [
            self.very_struggling_max,
            self.struggling_max,
            self.normal_max,
            self.good_max,
        ]
    }

    /// Inclusive upper edge of a band.
    pub fn upper_of(&self, level: DifficultyLevel) -> f64 {
        self.uppers()
            .get(level.index())
            .copied()
            .unwrap_or(MAX_SCORE)
    }

    fn validate(&self) -> Result<()> {
        let uppers = self.uppers();
        if has_invalid_values(&uppers) {
            return Err(EbarsError::InvalidConfig(
                "band thresholds must be finite".to_string(),
            ));
        }
        if uppers[0] <= MIN_SCORE || uppers[3] >= MAX_SCORE {
            return Err(EbarsError::InvalidConfig(
                "band thresholds must lie strictly inside (0, 100)".to_string(),
            ));
        }
        if uppers.windows(2).any(|w| w[1] - w[0] < 1.0) {
            return Err(EbarsError::InvalidConfig(
                "band thresholds must increase by at least one point".to_string(),
            ));
        }
        Ok(())
    }
}

/// Knobs that keep the level from flipping near a boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    /// Events that must be processed since the last level change before another one
    pub min_turns_before_change: u32,
    /// Distance from a boundary inside which a crossing is held for one more event
    pub boundary_buffer: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            min_turns_before_change: 2,
            boundary_buffer: 2.0,
        }
    }
}

/// Amplification of positive deltas during a positive streak.
///
/// multiplier = 1 + min(boost_per_step * (streak - streak_threshold + 1), max_boost)
/// once `streak >= streak_threshold`, else 1. With `max_boost <= 1` a single
/// event moves the score by at most twice the largest table delta, and the
/// result is clamped to [0, 100] afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub enabled: bool,
    pub streak_threshold: u32,
    pub boost_per_step: f64,
    pub max_boost: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            streak_threshold: 3,
            boost_per_step: 0.1,
            max_boost: 0.5,
        }
    }
}

impl MomentumConfig {
    pub fn multiplier(&self, positive_streak: u32) -> f64 {
        if !self.enabled || self.streak_threshold == 0 || positive_streak < self.streak_threshold {
            return 1.0;
        }
        let steps = (positive_streak - self.streak_threshold + 1) as f64;
        1.0 + (self.boost_per_step * steps).min(self.max_boost)
    }
}

/// Content parameters per difficulty level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationTable {
    pub very_struggling: ContentParameters,
    pub struggling: ContentParameters,
    pub normal: ContentParameters,
    pub good: ContentParameters,
    pub excellent: ContentParameters,
}

impl Default for AdaptationTable {
    fn default() -> Self {
        Self {
            very_struggling: ContentParameters {
                complexity: ComplexityTier::Foundational,
                worked_examples: 3,
                elaboration: Elaboration::Extensive,
                step_by_step: true,
                check_understanding: true,
            },
            struggling: ContentParameters {
                complexity: ComplexityTier::Simplified,
                worked_examples: 2,
                elaboration: Elaboration::Detailed,
                step_by_step: true,
                check_understanding: true,
            },
            normal: ContentParameters {
                complexity: ComplexityTier::Standard,
                worked_examples: 1,
                elaboration: Elaboration::Balanced,
                step_by_step: false,
                check_understanding: false,
            },
            good: ContentParameters {
                complexity: ComplexityTier::Advanced,
                worked_examples: 1,
                elaboration: Elaboration::Concise,
                step_by_step: false,
                check_understanding: false,
            },
            excellent: ContentParameters {
                complexity: ComplexityTier::Expert,
                worked_examples: 0,
                elaboration: Elaboration::Minimal,
                step_by_step: false,
                check_understanding: false,
            },
        }
    }
}

impl AdaptationTable {
    pub fn for_level(&self, level: DifficultyLevel) -> &ContentParameters {
        match level {
            DifficultyLevel::VeryStruggling => &self.very_struggling,
            DifficultyLevel::Struggling => &self.struggling,
            DifficultyLevel::Normal => &self.normal,
            DifficultyLevel::Good => &self.good,
            DifficultyLevel::Excellent => &self.excellent,
        }
    }
}

/// Initial assessment scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Score assigned when every item is wrong
    pub min_score: f64,
    /// Score assigned when every item is right
    pub max_score: f64,
    /// Maximum shift from answer preferences, kept inside the unbiased band
    pub preference_bias: f64,
    pub easy_weight: f64,
    pub medium_weight: f64,
    pub hard_weight: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_score: 20.0,
            max_score: 90.0,
            preference_bias: 4.0,
            easy_weight: 1.0,
            medium_weight: 1.5,
            hard_weight: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EbarsConfig {
    /// Score of a state created without calibration
    pub initial_score: f64,
    pub deltas: EmojiDeltaTable,
    pub bands: BandThresholds,
    pub hysteresis: HysteresisConfig,
    pub momentum: MomentumConfig,
    pub adaptation: AdaptationTable,
    pub calibration: CalibrationConfig,
}

impl Default for EbarsConfig {
    fn default() -> Self {
        Self {
            initial_score: DEFAULT_SCORE,
            deltas: EmojiDeltaTable::default(),
            bands: BandThresholds::default(),
            hysteresis: HysteresisConfig::default(),
            momentum: MomentumConfig::default(),
            adaptation: AdaptationTable::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl EbarsConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.initial_score.is_finite()
            || self.initial_score < MIN_SCORE
            || self.initial_score > MAX_SCORE
        {
            return Err(EbarsError::InvalidConfig(format!(
                "initial_score {} is outside [0, 100]",
                self.initial_score
            )));
        }

        let deltas = [
            self.deltas.strong_positive,
            self.deltas.mild_positive,
            self.deltas.neutral,
            self.deltas.negative,
        ];
        if has_invalid_values(&deltas) {
            return Err(EbarsError::InvalidConfig(
                "emoji deltas must be finite".to_string(),
            ));
        }
        if !(self.deltas.strong_positive >= self.deltas.mild_positive
            && self.deltas.mild_positive >= self.deltas.neutral
            && self.deltas.neutral > self.deltas.negative)
        {
            return Err(EbarsError::InvalidConfig(
                "emoji deltas must be ordered strong >= mild >= neutral > negative".to_string(),
            ));
        }

        self.bands.validate()?;

        if !self.hysteresis.boundary_buffer.is_finite() || self.hysteresis.boundary_buffer < 0.0 {
            return Err(EbarsError::InvalidConfig(
                "boundary_buffer must be a non-negative number".to_string(),
            ));
        }

        let momentum = &self.momentum;
        if !momentum.boost_per_step.is_finite() || momentum.boost_per_step < 0.0 {
            return Err(EbarsError::InvalidConfig(
                "momentum boost_per_step must be non-negative".to_string(),
            ));
        }
        if !momentum.max_boost.is_finite() || !(0.0..=1.0).contains(&momentum.max_boost) {
            return Err(EbarsError::InvalidConfig(
                "momentum max_boost must lie in [0, 1]".to_string(),
            ));
        }

        let cal = &self.calibration;
        if !(MIN_SCORE <= cal.min_score && cal.min_score < cal.max_score && cal.max_score <= MAX_SCORE)
        {
            return Err(EbarsError::InvalidConfig(
                "calibration range must satisfy 0 <= min_score < max_score <= 100".to_string(),
            ));
        }
        if [cal.easy_weight, cal.medium_weight, cal.hard_weight]
            .iter()
            .any(|w| !w.is_finite() || *w <= 0.0)
        {
            return Err(EbarsError::InvalidConfig(
                "calibration weights must be positive".to_string(),
            ));
        }
        if !cal.preference_bias.is_finite() || cal.preference_bias < 0.0 {
            return Err(EbarsError::InvalidConfig(
                "preference_bias must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EbarsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_overlapping_bands() {
        let mut config = EbarsConfig::default();
        config.bands.normal_max = 45.5;
        assert!(matches!(
            config.validate(),
            Err(EbarsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_non_finite_thresholds_and_deltas() {
        let mut config = EbarsConfig::default();
        config.bands.good_max = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(EbarsError::InvalidConfig(msg)) if msg.contains("finite")
        ));

        let mut config = EbarsConfig::default();
        config.deltas.negative = f64::NEG_INFINITY;
        assert!(matches!(
            config.validate(),
            Err(EbarsError::InvalidConfig(msg)) if msg.contains("finite")
        ));
    }

    #[test]
    fn test_rejects_unbounded_momentum() {
        let mut config = EbarsConfig::default();
        config.momentum.max_boost = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_momentum_multiplier_is_capped() {
        let momentum = MomentumConfig::default();
        assert_eq!(momentum.multiplier(0), 1.0);
        assert_eq!(momentum.multiplier(2), 1.0);
        assert!((momentum.multiplier(3) - 1.1).abs() < 1e-12);
        assert!((momentum.multiplier(4) - 1.2).abs() < 1e-12);
        assert!((momentum.multiplier(100) - 1.5).abs() < 1e-12);

        let disabled = MomentumConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(disabled.multiplier(100), 1.0);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: EbarsConfig =
            serde_json::from_str(r#"{"hysteresis": {"boundary_buffer": 3.0}}"#).unwrap();
        assert_eq!(config.hysteresis.boundary_buffer, 3.0);
        assert_eq!(config.hysteresis.min_turns_before_change, 2);
        assert_eq!(config.deltas.negative, -1.5);
    }
}
