//! # ebars-algo - emoji-based adaptive response core
//!
//! Pure Rust building blocks for EBARS: a per-learner comprehension score in
//! `[0, 100]` nudged by emoji feedback, a five-band difficulty mapping with
//! hysteresis, a one-time calibration test, a seeded learner simulator and the
//! statistical analysis of its output.
//!
//! ## Modules
//!
//! - [`feedback`] - emoji deltas, momentum, clamping and hysteresis-gated level changes
//! - [`difficulty`] - score bands and the content parameters of each band
//! - [`assessment`] - five-question calibration test, generated and scored once
//! - [`simulation`] - synthetic learner profiles, interaction logs and CSV/JSONL interchange
//! - [`analysis`] - five-stage validation with estimates, intervals and readings
//! - [`config`] - tunable tables with validated defaults
//! - [`sanitize`] - numeric guards
//! - [`types`] - shared types and constants
//!
//! ## Example
//!
//! ```rust
//! use ebars_algo::{Emoji, FeedbackProcessor, StateKey};
//!
//! let processor = FeedbackProcessor::default();
//! let key = StateKey::new("learner-1", "session-1").unwrap();
//! let state = processor.new_state(&key, chrono::Utc::now());
//! let (state, event) = processor.apply_feedback(&state, Emoji::StrongPositive).unwrap();
//! assert_eq!(state.score, 52.5);
//! assert!(!event.level_changed);
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod analysis;
pub mod assessment;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod feedback;
pub mod sanitize;
pub mod simulation;
pub mod types;

// ============================================================================
// Re-exports
// ============================================================================

pub use types::*;

pub use error::{EbarsError, Result};

pub use config::{
    AdaptationTable, BandThresholds, CalibrationConfig, EbarsConfig, EmojiDeltaTable,
    HysteresisConfig, MomentumConfig,
};

pub use difficulty::DifficultyMapper;

pub use feedback::FeedbackProcessor;

pub use assessment::{
    AnswerPreference, AssessmentQuestion, AssessmentResponse, AssessmentResult,
    ClozeQuestionSource, InitialAssessment, InitialTest, QuestionDifficulty, QuestionSource,
};

pub use simulation::{
    AgentProfile, AgentSpec, EmojiWeights, InteractionRecord, SimulationConfig, SimulationEngine,
};

pub use analysis::{
    AnalysisConfig, AnalysisEngine, AnalysisReport, AnalysisStage, CorrectionMethod,
};
