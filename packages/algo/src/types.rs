//! Common Types and Constants
//!
//! Shared data structures used across all EBARS modules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EbarsError, Result};

// ==================== Constants ====================

/// Lower bound of the comprehension score
pub const MIN_SCORE: f64 = 0.0;

/// Upper bound of the comprehension score
pub const MAX_SCORE: f64 = 100.0;

/// Score given to a state created without calibration
pub const DEFAULT_SCORE: f64 = 50.0;

/// Number of items in an initial assessment
pub const INITIAL_TEST_QUESTIONS: usize = 5;

// ==================== Feedback ====================

/// Emoji feedback signal.
///
/// The alphabet is closed: anything other than these four symbols is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Emoji {
    /// 👍 understood completely
    StrongPositive,
    /// 😊 mostly understood
    MildPositive,
    /// 😐 partially understood
    Neutral,
    /// ❌ did not understand
    Negative,
}

impl Emoji {
    pub const ALL: [Emoji; 4] = [
        Emoji::StrongPositive,
        Emoji::MildPositive,
        Emoji::Neutral,
        Emoji::Negative,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::StrongPositive => "👍",
            Self::MildPositive => "😊",
            Self::Neutral => "😐",
            Self::Negative => "❌",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongPositive => "strong_positive",
            Self::MildPositive => "mild_positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    /// Parse a feedback symbol. Surrounding whitespace is ignored.
    pub fn parse(symbol: &str) -> Result<Self> {
        match symbol.trim() {
            "👍" => Ok(Self::StrongPositive),
            "😊" => Ok(Self::MildPositive),
            "😐" => Ok(Self::Neutral),
            "❌" => Ok(Self::Negative),
            other => Err(EbarsError::InvalidEmoji(other.to_string())),
        }
    }

    /// +1 for positive feedback, -1 for negative, 0 for neutral
    pub fn polarity(&self) -> i8 {
        match self {
            Self::StrongPositive | Self::MildPositive => 1,
            Self::Neutral => 0,
            Self::Negative => -1,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.polarity() > 0
    }

    pub fn is_negative(&self) -> bool {
        self.polarity() < 0
    }

    /// Position in [`Emoji::ALL`]
    pub fn index(&self) -> usize {
        match self {
            Self::StrongPositive => 0,
            Self::MildPositive => 1,
            Self::Neutral => 2,
            Self::Negative => 3,
        }
    }
}

impl fmt::Display for Emoji {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Emoji {
    type Err = EbarsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Emoji {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl<'de> Deserialize<'de> for Emoji {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Emoji::parse(&raw).map_err(de::Error::custom)
    }
}

// ==================== Difficulty ====================

/// Five ordered difficulty bands derived from the comprehension score.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyLevel {
    VeryStruggling,
    Struggling,
    #[default]
    Normal,
    Good,
    Excellent,
}

impl DifficultyLevel {
    pub const ALL: [DifficultyLevel; 5] = [
        DifficultyLevel::VeryStruggling,
        DifficultyLevel::Struggling,
        DifficultyLevel::Normal,
        DifficultyLevel::Good,
        DifficultyLevel::Excellent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VeryStruggling => "very_struggling",
            Self::Struggling => "struggling",
            Self::Normal => "normal",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "very_struggling" => Ok(Self::VeryStruggling),
            "struggling" => Ok(Self::Struggling),
            "normal" => Ok(Self::Normal),
            "good" => Ok(Self::Good),
            "excellent" => Ok(Self::Excellent),
            other => Err(EbarsError::Interchange(format!(
                "unknown difficulty level {other:?}"
            ))),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::VeryStruggling => 0,
            Self::Struggling => 1,
            Self::Normal => 2,
            Self::Good => 3,
            Self::Excellent => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn harder(&self) -> Self {
        Self::from_index(self.index() + 1).unwrap_or(Self::Excellent)
    }

    pub fn easier(&self) -> Self {
        self.index()
            .checked_sub(1)
            .and_then(Self::from_index)
            .unwrap_or(Self::VeryStruggling)
    }
}

impl fmt::Display for DifficultyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DifficultyLevel {
    type Err = EbarsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A change of difficulty level, rendered as `from->to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelTransition {
    pub from: DifficultyLevel,
    pub to: DifficultyLevel,
}

impl LevelTransition {
    pub fn is_upward(&self) -> bool {
        self.to > self.from
    }

    /// True when `other` undoes this transition.
    pub fn is_reversed_by(&self, other: &LevelTransition) -> bool {
        self.from == other.to && self.to == other.from
    }
}

impl fmt::Display for LevelTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

impl FromStr for LevelTransition {
    type Err = EbarsError;

    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once("->")
            .ok_or_else(|| EbarsError::Interchange(format!("malformed level transition {s:?}")))?;
        Ok(Self {
            from: DifficultyLevel::parse(from)?,
            to: DifficultyLevel::parse(to)?,
        })
    }
}

// ==================== Adaptation Parameters ====================

/// How conceptually demanding generated content should be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Foundational,
    Simplified,
    Standard,
    Advanced,
    Expert,
}

/// How much explanation surrounds the core answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Elaboration {
    Extensive,
    Detailed,
    Balanced,
    Concise,
    Minimal,
}

/// Content parameters for one difficulty level, before the level is attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentParameters {
    pub complexity: ComplexityTier,
    /// Number of worked examples to include
    pub worked_examples: u8,
    pub elaboration: Elaboration,
    /// Break explanations into explicit numbered steps
    pub step_by_step: bool,
    /// Close with a short comprehension check question
    pub check_understanding: bool,
}

/// Parameter bundle handed to the content generator for its next response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationParameters {
    pub difficulty_level: DifficultyLevel,
    pub complexity: ComplexityTier,
    pub worked_examples: u8,
    pub elaboration: Elaboration,
    pub step_by_step: bool,
    pub check_understanding: bool,
}

impl AdaptationParameters {
    pub fn new(level: DifficultyLevel, content: &ContentParameters) -> Self {
        Self {
            difficulty_level: level,
            complexity: content.complexity,
            worked_examples: content.worked_examples,
            elaboration: content.elaboration,
            step_by_step: content.step_by_step,
            check_understanding: content.check_understanding,
        }
    }
}

// ==================== State ====================

/// Identifies one learner within one session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub learner_id: String,
    pub session_id: String,
}

impl StateKey {
    pub fn new(learner_id: impl Into<String>, session_id: impl Into<String>) -> Result<Self> {
        let learner_id = learner_id.into().trim().to_string();
        let session_id = session_id.into().trim().to_string();
        if learner_id.is_empty() {
            return Err(EbarsError::InvalidKey("learner_id is empty".to_string()));
        }
        if session_id.is_empty() {
            return Err(EbarsError::InvalidKey("session_id is empty".to_string()));
        }
        Ok(Self {
            learner_id,
            session_id,
        })
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.learner_id, self.session_id)
    }
}

/// Per learner×session comprehension state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComprehensionState {
    pub learner_id: String,
    pub session_id: String,
    /// Comprehension score in [0, 100]
    pub score: f64,
    /// Always a band that the hysteresis rules allowed the score to reach
    pub difficulty_level: DifficultyLevel,
    pub consecutive_positive: u32,
    pub consecutive_negative: u32,
    /// Feedback events processed since the last level change (or creation, calibration, reset)
    pub feedback_since_level_change: u32,
    /// Band the score entered on the previous event but was held out of
    pub pending_level: Option<DifficultyLevel>,
    pub total_feedback_count: u64,
    pub has_completed_initial_test: bool,
    pub initial_test_score: Option<f64>,
    pub initial_test_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ComprehensionState {
    pub fn key(&self) -> StateKey {
        StateKey {
            learner_id: self.learner_id.clone(),
            session_id: self.session_id.clone(),
        }
    }

    /// Check the score invariant.
    pub fn validate(&self) -> Result<()> {
        if !self.score.is_finite() || self.score < MIN_SCORE || self.score > MAX_SCORE {
            return Err(EbarsError::InvalidScore(self.score));
        }
        Ok(())
    }
}

/// Append-only record of one processed feedback submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// Assigned by the store on insert
    pub id: Option<i64>,
    pub learner_id: String,
    pub session_id: String,
    pub emoji: Emoji,
    pub interaction_id: Option<String>,
    pub query_text: Option<String>,
    pub old_score: f64,
    pub new_score: f64,
    /// Applied adjustment; `new_score == clamp(old_score + score_delta, 0, 100)`
    pub score_delta: f64,
    pub old_level: DifficultyLevel,
    pub new_level: DifficultyLevel,
    pub level_changed: bool,
    pub created_at: DateTime<Utc>,
}

impl FeedbackEvent {
    pub fn transition(&self) -> Option<LevelTransition> {
        self.level_changed.then_some(LevelTransition {
            from: self.old_level,
            to: self.new_level,
        })
    }

    /// Attach caller-supplied traceability fields.
    pub fn with_trace(mut self, interaction_id: Option<String>, query_text: Option<String>) -> Self {
        self.interaction_id = interaction_id.filter(|s| !s.trim().is_empty());
        self.query_text = query_text.filter(|s| !s.trim().is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emoji_parse_accepts_only_alphabet() {
        for emoji in Emoji::ALL {
            assert_eq!(Emoji::parse(emoji.symbol()).unwrap(), emoji);
        }
        assert_eq!(Emoji::parse(" 👍 ").unwrap(), Emoji::StrongPositive);
        assert!(matches!(
            Emoji::parse("🙂"),
            Err(EbarsError::InvalidEmoji(_))
        ));
        assert!(Emoji::parse("positive").is_err());
        assert!(Emoji::parse("").is_err());
    }

    #[test]
    fn test_emoji_serde_uses_symbol() {
        let json = serde_json::to_string(&Emoji::Negative).unwrap();
        assert_eq!(json, "\"❌\"");
        let parsed: Emoji = serde_json::from_str("\"😊\"").unwrap();
        assert_eq!(parsed, Emoji::MildPositive);
        assert!(serde_json::from_str::<Emoji>("\"x\"").is_err());
    }

    #[test]
    fn test_difficulty_ordering() {
        assert!(DifficultyLevel::VeryStruggling < DifficultyLevel::Struggling);
        assert!(DifficultyLevel::Good < DifficultyLevel::Excellent);
        assert_eq!(DifficultyLevel::Excellent.harder(), DifficultyLevel::Excellent);
        assert_eq!(DifficultyLevel::VeryStruggling.easier(), DifficultyLevel::VeryStruggling);
        assert_eq!(DifficultyLevel::Normal.easier(), DifficultyLevel::Struggling);
    }

    #[test]
    fn test_level_transition_round_trip_text() {
        let t = LevelTransition {
            from: DifficultyLevel::Normal,
            to: DifficultyLevel::Good,
        };
        assert_eq!(t.to_string(), "normal->good");
        assert_eq!("normal->good".parse::<LevelTransition>().unwrap(), t);
        assert!("normal".parse::<LevelTransition>().is_err());
        assert!(t.is_upward());
        let back = LevelTransition { from: t.to, to: t.from };
        assert!(!back.is_upward());
        assert!(t.is_reversed_by(&back));
    }

    #[test]
    fn test_state_key_rejects_blank_ids() {
        assert!(StateKey::new("  ", "s1").is_err());
        assert!(StateKey::new("u1", "").is_err());
        let key = StateKey::new(" u1 ", "s1").unwrap();
        assert_eq!(key.learner_id, "u1");
    }
}
