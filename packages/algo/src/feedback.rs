//! Feedback Processor
//!
//! Pure transition function from (state, emoji) to (new state, event).
//!
//! Core rules:
//! - The emoji delta table decides direction and magnitude of the score change
//! - A positive streak may amplify a positive delta (bounded, see [`MomentumConfig`])
//! - The score is clamped to [0, 100] last
//! - A level change requires both hysteresis conditions:
//!   1. at least `min_turns_before_change` events since the last change
//!   2. the new score clears the crossed boundary by more than `boundary_buffer`,
//!      or the previous event already entered the same band
//!
//! [`MomentumConfig`]: crate::config::MomentumConfig

use chrono::{DateTime, Utc};

use crate::config::EbarsConfig;
use crate::difficulty::DifficultyMapper;
use crate::error::{EbarsError, Result};
use crate::sanitize::clamp_score;
use crate::types::{ComprehensionState, DifficultyLevel, Emoji, FeedbackEvent, StateKey};

/// Outcome of the hysteresis check for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelDecision {
    level: DifficultyLevel,
    pending: Option<DifficultyLevel>,
    changed: bool,
}

#[derive(Debug, Clone)]
pub struct FeedbackProcessor {
    config: EbarsConfig,
    mapper: DifficultyMapper,
}

impl FeedbackProcessor {
    pub fn new(config: EbarsConfig) -> Result<Self> {
        config.validate()?;
        let mapper = DifficultyMapper::from_config(&config);
        Ok(Self { config, mapper })
    }

    pub fn config(&self) -> &EbarsConfig {
        &self.config
    }

    pub fn mapper(&self) -> &DifficultyMapper {
        &self.mapper
    }

    /// Fresh state for a key that has seen no activity yet.
    pub fn new_state(&self, key: &StateKey, now: DateTime<Utc>) -> ComprehensionState {
        let score = self.config.initial_score;
        ComprehensionState {
            learner_id: key.learner_id.clone(),
            session_id: key.session_id.clone(),
            score,
            difficulty_level: self.mapper.level_for_score(score),
            consecutive_positive: 0,
            consecutive_negative: 0,
            feedback_since_level_change: 0,
            pending_level: None,
            total_feedback_count: 0,
            has_completed_initial_test: false,
            initial_test_score: None,
            initial_test_completed_at: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// Fresh state starting from an externally sampled score (used by the simulator).
    pub fn seeded_state(
        &self,
        key: &StateKey,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<ComprehensionState> {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(EbarsError::InvalidScore(score));
        }
        let mut state = self.new_state(key, now);
        state.score = score;
        state.difficulty_level = self.mapper.level_for_score(score);
        Ok(state)
    }

    /// Reset score, level and counters. Creation time and calibration history are kept.
    pub fn reset_state(&self, state: &ComprehensionState, now: DateTime<Utc>) -> ComprehensionState {
        let mut reset = self.new_state(&state.key(), state.created_at);
        reset.has_completed_initial_test = state.has_completed_initial_test;
        reset.initial_test_score = state.initial_test_score;
        reset.initial_test_completed_at = state.initial_test_completed_at;
        reset.last_updated = now.max(state.last_updated);
        reset
    }

    /// Apply feedback stamped with the current time.
    pub fn apply_feedback(
        &self,
        state: &ComprehensionState,
        emoji: Emoji,
    ) -> Result<(ComprehensionState, FeedbackEvent)> {
        self.apply_feedback_at(state, emoji, Utc::now())
    }

    /// Parse a raw symbol and apply it. Invalid symbols are rejected before any work.
    pub fn apply_symbol(
        &self,
        state: &ComprehensionState,
        symbol: &str,
    ) -> Result<(ComprehensionState, FeedbackEvent)> {
        let emoji = Emoji::parse(symbol)?;
        self.apply_feedback(state, emoji)
    }

    pub fn apply_feedback_at(
        &self,
        state: &ComprehensionState,
        emoji: Emoji,
        now: DateTime<Utc>,
    ) -> Result<(ComprehensionState, FeedbackEvent)> {
        state.validate()?;

        let (consecutive_positive, consecutive_negative) = match emoji.polarity() {
            1 => (state.consecutive_positive.saturating_add(1), 0),
            -1 => (0, state.consecutive_negative.saturating_add(1)),
            _ => (state.consecutive_positive, state.consecutive_negative),
        };

        let base_delta = self.config.deltas.delta_for(emoji);
        let score_delta = if emoji.is_positive() {
            base_delta * self.config.momentum.multiplier(consecutive_positive)
        } else {
            base_delta
        };
        let new_score = clamp_score(state.score + score_delta);

        let decision = self.decide_level(state, new_score);

        let new_state = ComprehensionState {
            score: new_score,
            difficulty_level: decision.level,
            consecutive_positive,
            consecutive_negative,
            feedback_since_level_change: if decision.changed {
                0
            } else {
                state.feedback_since_level_change.saturating_add(1)
            },
            pending_level: decision.pending,
            total_feedback_count: state.total_feedback_count.saturating_add(1),
            last_updated: now.max(state.last_updated),
            ..state.clone()
        };

        let event = FeedbackEvent {
            id: None,
            learner_id: state.learner_id.clone(),
            session_id: state.session_id.clone(),
            emoji,
            interaction_id: None,
            query_text: None,
            old_score: state.score,
            new_score,
            score_delta,
            old_level: state.difficulty_level,
            new_level: decision.level,
            level_changed: decision.changed,
            created_at: now,
        };

        Ok((new_state, event))
    }

    fn decide_level(&self, state: &ComprehensionState, new_score: f64) -> LevelDecision {
        let current = state.difficulty_level;
        let raw = self.mapper.level_for_score(new_score);

        let Some(boundary) = self.mapper.boundary_toward(current, raw) else {
            return LevelDecision {
                level: current,
                pending: None,
                changed: false,
            };
        };

        let hysteresis = &self.config.hysteresis;
        let turns_since_change = state.feedback_since_level_change.saturating_add(1);
        let waited_long_enough = turns_since_change >= hysteresis.min_turns_before_change;
        let clear_of_buffer = (new_score - boundary).abs() > hysteresis.boundary_buffer;
        let confirmed = state.pending_level == Some(raw);

        if waited_long_enough && (clear_of_buffer || confirmed) {
            LevelDecision {
                level: raw,
                pending: None,
                changed: true,
            }
        } else {
            LevelDecision {
                level: current,
                pending: Some(raw),
                changed: false,
            }
        }
    }
}

impl Default for FeedbackProcessor {
    fn default() -> Self {
        let config = EbarsConfig::default();
        let mapper = DifficultyMapper::from_config(&config);
        Self { config, mapper }
    }
}
