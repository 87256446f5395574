//! Agent profiles.
//!
//! A profile is data: where the simulated comprehension starts, how noisy the
//! agent is, how fast it learns, and which emojis it tends to send at a given
//! comprehension. New behaviours are new values of [`AgentProfile`].

use serde::{Deserialize, Serialize};

use crate::error::{EbarsError, Result};
use crate::types::{Emoji, MAX_SCORE, MIN_SCORE};

/// Relative emission weights for the four emojis. They need not sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmojiWeights {
    pub strong_positive: f64,
    pub mild_positive: f64,
    pub neutral: f64,
    pub negative: f64,
}

impl EmojiWeights {
    pub const fn new(strong_positive: f64, mild_positive: f64, neutral: f64, negative: f64) -> Self {
        Self {
            strong_positive,
            mild_positive,
            neutral,
            negative,
        }
    }

    /// Weights in [`Emoji::ALL`] order.
    pub fn as_array(&self) -> [f64; 4] {
        [
            self.strong_positive,
            self.mild_positive,
            self.neutral,
            self.negative,
        ]
    }

    pub fn weight_of(&self, emoji: Emoji) -> f64 {
        self.as_array()[emoji.index()]
    }

    /// Normalise and mix with the uniform distribution. `noise` of 0 keeps the
    /// weights, 1 makes every emoji equally likely.
    pub fn blended(&self, noise: f64) -> [f64; 4] {
        let raw = self.as_array();
        let total: f64 = raw.iter().sum();
        let noise = noise.clamp(0.0, 1.0);
        raw.map(|w| (1.0 - noise) * (w / total) + noise * 0.25)
    }

    fn validate(&self) -> Result<()> {
        let raw = self.as_array();
        if raw.iter().any(|w| !w.is_finite() || *w < 0.0) || raw.iter().sum::<f64>() <= 0.0 {
            return Err(EbarsError::InvalidConfig(
                "emission weights must be non-negative with a positive sum".to_string(),
            ));
        }
        Ok(())
    }
}

/// Emission weights that apply while simulated comprehension is at most `up_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionBand {
    pub up_to: f64,
    pub weights: EmojiWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    /// Inclusive range the starting comprehension is sampled from
    pub initial_range: (f64, f64),
    /// 0..=1; scales per-turn jitter and flattens the emission distribution
    pub noise_factor: f64,
    /// Comprehension gained per turn when the delivered level fits the learner
    pub momentum: f64,
    /// Amplitude in score points of a periodic swing in comprehension
    #[serde(default)]
    pub oscillation_amplitude: f64,
    #[serde(default)]
    pub oscillation_period: u32,
    /// Bands ordered by `up_to`; the last must reach 100
    pub emission: Vec<EmissionBand>,
}

impl AgentProfile {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.initial_range;
        if !(lo.is_finite() && hi.is_finite() && MIN_SCORE <= lo && lo <= hi && hi <= MAX_SCORE) {
            return Err(EbarsError::InvalidConfig(format!(
                "profile {}: initial range ({lo}, {hi}) must lie in [0, 100]",
                self.name
            )));
        }
        if !self.noise_factor.is_finite() || !(0.0..=1.0).contains(&self.noise_factor) {
            return Err(EbarsError::InvalidConfig(format!(
                "profile {}: noise_factor must lie in [0, 1]",
                self.name
            )));
        }
        if !self.momentum.is_finite() || !self.oscillation_amplitude.is_finite() {
            return Err(EbarsError::InvalidConfig(format!(
                "profile {}: momentum and oscillation must be finite",
                self.name
            )));
        }
        let Some(last) = self.emission.last() else {
            return Err(EbarsError::InvalidConfig(format!(
                "profile {}: no emission bands",
                self.name
            )));
        };
        if last.up_to < MAX_SCORE {
            return Err(EbarsError::InvalidConfig(format!(
                "profile {}: emission bands must cover scores up to 100",
                self.name
            )));
        }
        if self.emission.windows(2).any(|w| w[1].up_to <= w[0].up_to) {
            return Err(EbarsError::InvalidConfig(format!(
                "profile {}: emission bands must be strictly increasing",
                self.name
            )));
        }
        for band in &self.emission {
            band.weights.validate()?;
        }
        Ok(())
    }

    /// Emission weights for a simulated comprehension value.
    pub fn weights_for(&self, comprehension: f64) -> Option<&EmojiWeights> {
        self.emission
            .iter()
            .find(|band| comprehension <= band.up_to)
            .or_else(|| self.emission.last())
            .map(|band| &band.weights)
    }

    /// Mostly negative and neutral feedback, slow improvement.
    pub fn struggling() -> Self {
        Self {
            name: "struggling".to_string(),
            initial_range: (25.0, 40.0),
            noise_factor: 0.1,
            momentum: 0.3,
            oscillation_amplitude: 0.0,
            oscillation_period: 0,
            emission: vec![
                band(40.0, EmojiWeights::new(0.02, 0.08, 0.30, 0.60)),
                band(60.0, EmojiWeights::new(0.05, 0.20, 0.40, 0.35)),
                band(100.0, EmojiWeights::new(0.15, 0.35, 0.30, 0.20)),
            ],
        }
    }

    pub fn average() -> Self {
        Self {
            name: "average".to_string(),
            initial_range: (45.0, 55.0),
            noise_factor: 0.1,
            momentum: 0.6,
            oscillation_amplitude: 0.0,
            oscillation_period: 0,
            emission: vec![
                band(45.0, EmojiWeights::new(0.05, 0.25, 0.35, 0.35)),
                band(70.0, EmojiWeights::new(0.20, 0.35, 0.30, 0.15)),
                band(100.0, EmojiWeights::new(0.35, 0.35, 0.20, 0.10)),
            ],
        }
    }

    /// Mostly positive feedback, quick improvement.
    pub fn fast_learner() -> Self {
        Self {
            name: "fast_learner".to_string(),
            initial_range: (55.0, 70.0),
            noise_factor: 0.05,
            momentum: 1.5,
            oscillation_amplitude: 0.0,
            oscillation_period: 0,
            emission: vec![
                band(40.0, EmojiWeights::new(0.10, 0.30, 0.30, 0.30)),
                band(70.0, EmojiWeights::new(0.35, 0.40, 0.15, 0.10)),
                band(100.0, EmojiWeights::new(0.60, 0.30, 0.07, 0.03)),
            ],
        }
    }

    /// Near-uniform emission with a periodic swing in comprehension.
    pub fn variable() -> Self {
        Self {
            name: "variable".to_string(),
            initial_range: (40.0, 60.0),
            noise_factor: 0.3,
            momentum: 0.2,
            oscillation_amplitude: 15.0,
            oscillation_period: 6,
            emission: vec![
                band(50.0, EmojiWeights::new(0.20, 0.25, 0.25, 0.30)),
                band(100.0, EmojiWeights::new(0.30, 0.25, 0.25, 0.20)),
            ],
        }
    }

    pub fn builtins() -> Vec<Self> {
        vec![
            Self::struggling(),
            Self::average(),
            Self::fast_learner(),
            Self::variable(),
        ]
    }

    pub fn builtin(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase().replace('-', "_");
        Self::builtins().into_iter().find(|p| p.name == name)
    }
}

fn band(up_to: f64, weights: EmojiWeights) -> EmissionBand {
    EmissionBand { up_to, weights }
}
