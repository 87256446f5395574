//! Initial Assessment
//!
//! One-time calibration that replaces the default starting score with one
//! derived from a short five-item quiz over the session content.
//!
//! - Question generation is pluggable through [`QuestionSource`]; the built-in
//!   [`ClozeQuestionSource`] blanks a keyword from a sentence of the content.
//! - Scoring weighs items by difficulty and maps the weighted ratio into the
//!   calibration range. Answer preferences nudge the result, but never across
//!   a band edge.
//! - Completion happens at most once per learner×session.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CalibrationConfig, EbarsConfig};
use crate::difficulty::DifficultyMapper;
use crate::error::{EbarsError, Result};
use crate::sanitize::clamp_score;
use crate::types::{ComprehensionState, DifficultyLevel, StateKey, INITIAL_TEST_QUESTIONS};

/// Blank marker inserted into cloze prompts
pub const BLANK: &str = "_____";

const OPTIONS_PER_QUESTION: usize = 4;
const MIN_KEYWORD_CHARS: usize = 4;
/// One more than a question needs, so dropping a match with the answer still fills it.
const FALLBACK_DISTRACTORS: [&str; OPTIONS_PER_QUESTION] = [
    "None of the above",
    "All of the above",
    "Not stated in the material",
    "Cannot be determined",
];
const DIFFICULTY_RAMP: [QuestionDifficulty; INITIAL_TEST_QUESTIONS] = [
    QuestionDifficulty::Easy,
    QuestionDifficulty::Easy,
    QuestionDifficulty::Medium,
    QuestionDifficulty::Medium,
    QuestionDifficulty::Hard,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionDifficulty {
    Easy,
    Medium,
    Hard,
}

impl QuestionDifficulty {
    pub fn weight(&self, calibration: &CalibrationConfig) -> f64 {
        match self {
            Self::Easy => calibration.easy_weight,
            Self::Medium => calibration.medium_weight,
            Self::Hard => calibration.hard_weight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentQuestion {
    pub index: usize,
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_option: usize,
    pub difficulty: QuestionDifficulty,
}

/// How the learner would like the next explanation pitched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerPreference {
    Simpler,
    Balanced,
    Deeper,
}

impl AnswerPreference {
    fn direction(&self) -> f64 {
        match self {
            Self::Simpler => -1.0,
            Self::Balanced => 0.0,
            Self::Deeper => 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentResponse {
    pub question_index: usize,
    pub selected_option: usize,
    #[serde(default)]
    pub preference: Option<AnswerPreference>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentResult {
    pub item_correct: Vec<bool>,
    /// Weighted percentage of correct items, 0..=100
    pub total_score: f64,
    pub initial_score: f64,
    pub initial_level: DifficultyLevel,
    /// Net preference in [-1, 1]; negative leans simpler
    pub preference_balance: f64,
}

/// A generated test, pending until `completed_at` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialTest {
    pub learner_id: String,
    pub session_id: String,
    pub questions: Vec<AssessmentQuestion>,
    pub item_correct: Vec<bool>,
    pub total_score: Option<f64>,
    pub answer_preferences: Vec<Option<AnswerPreference>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InitialTest {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn key(&self) -> StateKey {
        StateKey {
            learner_id: self.learner_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Produces the five calibration questions for a piece of session content.
pub trait QuestionSource: Send + Sync {
    fn generate(&self, content: &str) -> Result<Vec<AssessmentQuestion>>;
}

/// Deterministic fill-in-the-blank generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClozeQuestionSource;

struct Sentence {
    text: String,
    words: Vec<String>,
}

fn keyword_candidates(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .filter(|word| word.chars().all(|c| c.is_alphabetic() || c == '-' || c == '\''))
        .map(str::to_string)
        .collect()
}

fn split_sentences(content: &str) -> Vec<Sentence> {
    content
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let words = keyword_candidates(s);
            (!words.is_empty()).then(|| Sentence {
                text: s.to_string(),
                words,
            })
        })
        .collect()
}

/// Replace the first whole-word occurrence of `word`, never a match inside a longer word.
fn blank_word(text: &str, word: &str) -> String {
    let found = text.match_indices(word).find(|(start, _)| {
        let before = text[..*start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    });
    match found {
        Some((start, _)) => {
            format!("{}{BLANK}{}", &text[..start], &text[start + word.len()..])
        }
        None => text.to_string(),
    }
}

fn longest<'a>(words: impl Iterator<Item = &'a String>) -> Option<&'a String> {
    // first occurrence wins ties
    let mut best: Option<&'a String> = None;
    for word in words {
        if best.map_or(true, |b| word.chars().count() > b.chars().count()) {
            best = Some(word);
        }
    }
    best
}

impl ClozeQuestionSource {
    fn distractors(answer: &str, sentence: &Sentence, vocabulary: &[String]) -> Vec<String> {
        let answer_lower = answer.to_lowercase();
        let answer_len = answer.chars().count() as i64;
        let in_sentence: HashSet<String> =
            sentence.words.iter().map(|w| w.to_lowercase()).collect();

        let mut seen = HashSet::new();
        let mut others = Vec::new();
        let mut same = Vec::new();
        for word in vocabulary {
            let lower = word.to_lowercase();
            if lower == answer_lower || !seen.insert(lower.clone()) {
                continue;
            }
            if in_sentence.contains(&lower) {
                same.push(word.clone());
            } else {
                others.push(word.clone());
            }
        }

        let rank = |words: &mut Vec<String>| {
            words.sort_by(|a, b| {
                let da = (a.chars().count() as i64 - answer_len).abs();
                let db = (b.chars().count() as i64 - answer_len).abs();
                da.cmp(&db).then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
            });
        };
        rank(&mut others);
        rank(&mut same);

        others
            .into_iter()
            .chain(same)
            .chain(
                FALLBACK_DISTRACTORS
                    .iter()
                    .filter(|s| s.to_lowercase() != answer_lower)
                    .map(|s| s.to_string()),
            )
            .take(OPTIONS_PER_QUESTION - 1)
            .collect()
    }
}

impl QuestionSource for ClozeQuestionSource {
    fn generate(&self, content: &str) -> Result<Vec<AssessmentQuestion>> {
        if content.trim().is_empty() {
            return Err(EbarsError::EmptyContent);
        }
        let sentences = split_sentences(content);
        if sentences.is_empty() {
            return Err(EbarsError::EmptyContent);
        }
        let vocabulary: Vec<String> = sentences.iter().flat_map(|s| s.words.clone()).collect();

        let mut used: HashSet<String> = HashSet::new();
        let mut questions = Vec::with_capacity(INITIAL_TEST_QUESTIONS);

        for (index, difficulty) in DIFFICULTY_RAMP.iter().enumerate() {
            let sentence = &sentences[index * sentences.len() / INITIAL_TEST_QUESTIONS];
            let fresh = longest(
                sentence
                    .words
                    .iter()
                    .filter(|w| !used.contains(&w.to_lowercase())),
            );
            let Some(answer) = fresh.or_else(|| longest(sentence.words.iter())) else {
                return Err(EbarsError::EmptyContent);
            };
            used.insert(answer.to_lowercase());

            let mut options = Self::distractors(answer, sentence, &vocabulary);
            let correct_option = (index * 7 + answer.chars().count()) % OPTIONS_PER_QUESTION;
            options.insert(correct_option, answer.clone());

            questions.push(AssessmentQuestion {
                index,
                prompt: format!(
                    "Fill in the blank: {}",
                    blank_word(&sentence.text, answer)
                ),
                options,
                correct_option,
                difficulty: *difficulty,
            });
        }

        Ok(questions)
    }
}

#[derive(Clone)]
pub struct InitialAssessment {
    calibration: CalibrationConfig,
    mapper: DifficultyMapper,
    source: Arc<dyn QuestionSource>,
}

impl InitialAssessment {
    pub fn new(config: &EbarsConfig) -> Self {
        Self::with_source(config, Arc::new(ClozeQuestionSource))
    }

    pub fn with_source(config: &EbarsConfig, source: Arc<dyn QuestionSource>) -> Self {
        Self {
            calibration: config.calibration.clone(),
            mapper: DifficultyMapper::from_config(config),
            source,
        }
    }

    pub fn generate(&self, content: &str) -> Result<Vec<AssessmentQuestion>> {
        let questions = self.source.generate(content)?;
        if questions.len() != INITIAL_TEST_QUESTIONS {
            return Err(EbarsError::MalformedSubmission(format!(
                "question source produced {} questions, expected {}",
                questions.len(),
                INITIAL_TEST_QUESTIONS
            )));
        }
        Ok(questions)
    }

    /// Generate questions and wrap them in a pending test.
    pub fn start(&self, key: &StateKey, content: &str, now: DateTime<Utc>) -> Result<InitialTest> {
        Ok(InitialTest {
            learner_id: key.learner_id.clone(),
            session_id: key.session_id.clone(),
            questions: self.generate(content)?,
            item_correct: Vec::new(),
            total_score: None,
            answer_preferences: Vec::new(),
            started_at: now,
            completed_at: None,
        })
    }

    /// Score a full set of responses. Exactly one in-range response per question is required.
    pub fn score(
        &self,
        questions: &[AssessmentQuestion],
        responses: &[AssessmentResponse],
    ) -> Result<AssessmentResult> {
        let ordered = Self::order_responses(questions, responses)?;

        let mut earned = 0.0;
        let mut possible = 0.0;
        let mut item_correct = Vec::with_capacity(questions.len());
        for (question, response) in questions.iter().zip(&ordered) {
            let weight = question.difficulty.weight(&self.calibration);
            let correct = response.selected_option == question.correct_option;
            possible += weight;
            if correct {
                earned += weight;
            }
            item_correct.push(correct);
        }

        let ratio = if possible > 0.0 { earned / possible } else { 0.0 };
        let cal = &self.calibration;
        let unbiased = clamp_score(cal.min_score + ratio * (cal.max_score - cal.min_score));
        let level = self.mapper.level_for_score(unbiased);

        let preference_balance = ordered
            .iter()
            .map(|r| r.preference.map(|p| p.direction()).unwrap_or(0.0))
            .sum::<f64>()
            / ordered.len().max(1) as f64;

        let (lo, hi) = self.mapper.nominal_range(level);
        let initial_score = (unbiased + preference_balance * cal.preference_bias)
            .clamp(lo.min(unbiased), hi.max(unbiased));

        Ok(AssessmentResult {
            item_correct,
            total_score: ratio * 100.0,
            initial_score,
            initial_level: self.mapper.level_for_score(initial_score),
            preference_balance,
        })
    }

    /// Apply a scored submission to the state. Fails without side effects when
    /// either the state or the test is already completed.
    pub fn complete(
        &self,
        state: &ComprehensionState,
        test: &InitialTest,
        responses: &[AssessmentResponse],
        now: DateTime<Utc>,
    ) -> Result<(ComprehensionState, InitialTest, AssessmentResult)> {
        if state.has_completed_initial_test || test.is_completed() {
            return Err(EbarsError::AlreadyCompleted);
        }
        if test.key() != state.key() {
            return Err(EbarsError::MalformedSubmission(
                "test belongs to a different learner or session".to_string(),
            ));
        }

        let result = self.score(&test.questions, responses)?;
        let ordered = Self::order_responses(&test.questions, responses)?;

        let new_state = ComprehensionState {
            score: result.initial_score,
            difficulty_level: result.initial_level,
            consecutive_positive: 0,
            consecutive_negative: 0,
            feedback_since_level_change: 0,
            pending_level: None,
            has_completed_initial_test: true,
            initial_test_score: Some(result.initial_score),
            initial_test_completed_at: Some(now),
            last_updated: now.max(state.last_updated),
            ..state.clone()
        };

        let completed = InitialTest {
            item_correct: result.item_correct.clone(),
            total_score: Some(result.total_score),
            answer_preferences: ordered.iter().map(|r| r.preference).collect(),
            completed_at: Some(now),
            ..test.clone()
        };

        Ok((new_state, completed, result))
    }

    fn order_responses<'a>(
        questions: &[AssessmentQuestion],
        responses: &'a [AssessmentResponse],
    ) -> Result<Vec<&'a AssessmentResponse>> {
        if responses.len() != questions.len() {
            return Err(EbarsError::MalformedSubmission(format!(
                "expected {} responses, got {}",
                questions.len(),
                responses.len()
            )));
        }

        let mut slots: Vec<Option<&AssessmentResponse>> = vec![None; questions.len()];
        for response in responses {
            let question = questions.get(response.question_index).ok_or_else(|| {
                EbarsError::MalformedSubmission(format!(
                    "unknown question index {}",
                    response.question_index
                ))
            })?;
            if response.selected_option >= question.options.len() {
                return Err(EbarsError::MalformedSubmission(format!(
                    "option {} out of range for question {}",
                    response.selected_option, response.question_index
                )));
            }
            let slot = &mut slots[response.question_index];
            if slot.is_some() {
                return Err(EbarsError::MalformedSubmission(format!(
                    "duplicate response for question {}",
                    response.question_index
                )));
            }
            *slot = Some(response);
        }

        // every slot is filled: same count, no duplicates, all indices in range
        Ok(slots.into_iter().flatten().collect())
    }
}

impl Default for InitialAssessment {
    fn default() -> Self {
        Self::new(&EbarsConfig::default())
    }
}
