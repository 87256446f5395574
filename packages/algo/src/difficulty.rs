//! Difficulty Mapper
//!
//! Maps a comprehension score onto one of five ordered bands and looks up the
//! content parameters for a band. Both operations are pure table lookups.

use crate::config::{AdaptationTable, BandThresholds, EbarsConfig};
use crate::sanitize::clamp_score;
use crate::types::{AdaptationParameters, DifficultyLevel, MAX_SCORE, MIN_SCORE};

#[derive(Debug, Clone)]
pub struct DifficultyMapper {
    bands: BandThresholds,
    table: AdaptationTable,
}

impl DifficultyMapper {
    pub fn new(bands: BandThresholds, table: AdaptationTable) -> Self {
        Self { bands, table }
    }

    pub fn from_config(config: &EbarsConfig) -> Self {
        Self::new(config.bands.clone(), config.adaptation.clone())
    }

    pub fn bands(&self) -> &BandThresholds {
        &self.bands
    }

    /// Band whose range contains `score`. Out-of-range input is clamped first.
    pub fn level_for_score(&self, score: f64) -> DifficultyLevel {
        let score = clamp_score(score);
        let [very_struggling, struggling, normal, good] = self.bands.uppers();

        if score <= very_struggling {
            DifficultyLevel::VeryStruggling
        } else if score <= struggling {
            DifficultyLevel::Struggling
        } else if score <= normal {
            DifficultyLevel::Normal
        } else if score <= good {
            DifficultyLevel::Good
        } else {
            DifficultyLevel::Excellent
        }
    }

    pub fn parameters_for_level(&self, level: DifficultyLevel) -> AdaptationParameters {
        AdaptationParameters::new(level, self.table.for_level(level))
    }

    /// Threshold separating `from` from the neighbouring band in the direction of `to`.
    ///
    /// Returns `None` when the levels are equal.
    pub fn boundary_toward(&self, from: DifficultyLevel, to: DifficultyLevel) -> Option<f64> {
        if to > from {
            Some(self.bands.upper_of(from))
        } else if to < from {
            Some(self.bands.upper_of(from.easier()))
        } else {
            None
        }
    }

    /// Nominal integer range of a band, e.g. struggling = (31, 45).
    pub fn nominal_range(&self, level: DifficultyLevel) -> (f64, f64) {
        let upper = match level {
            DifficultyLevel::Excellent => MAX_SCORE,
            other => self.bands.upper_of(other),
        };
        let lower = match level {
            DifficultyLevel::VeryStruggling => MIN_SCORE,
            other => (self.bands.upper_of(other.easier()) + 1.0).min(upper),
        };
        (lower, upper)
    }
}

impl Default for DifficultyMapper {
    fn default() -> Self {
        Self::from_config(&EbarsConfig::default())
    }
}
