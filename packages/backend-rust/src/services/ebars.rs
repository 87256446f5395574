//! Learner-facing EBARS operations over a [`ScoreStore`].
//!
//! Every read-modify-write of a key's state runs under that key's async lock,
//! so concurrent submissions for one learner and session are applied one after
//! another. Different keys never contend. Writers outside this process are
//! caught by the store's compare-and-set; a stale write is recomputed from a
//! fresh read a bounded number of times.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use ebars_algo::analysis::stats::linear_regression;
use ebars_algo::{
    AdaptationParameters, AssessmentResponse, AssessmentResult, ComprehensionState,
    DifficultyLevel, EbarsConfig, EbarsError, Emoji, FeedbackEvent, FeedbackProcessor,
    InitialAssessment, InitialTest, StateKey,
};

use crate::store::{FeedbackTotals, ScoreStore, StoreError};

/// Events considered by the score trend.
const TREND_WINDOW: usize = 10;
/// Slope in points per event below which the trend reads as stable.
const TREND_FLAT_SLOPE: f64 = 0.25;
pub const MAX_HISTORY_LIMIT: usize = 500;
/// Idle lock entries are dropped once the table grows past this.
const LOCK_TABLE_PRUNE_AT: usize = 1024;
/// Attempts at a state write before a stale snapshot is reported.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] EbarsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no pending initial test for this learner and session")]
    NoPendingTest,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackOutcome {
    pub event_id: i64,
    pub new_score: f64,
    pub new_difficulty: DifficultyLevel,
    pub score_delta: f64,
    pub difficulty_changed: bool,
    pub previous_difficulty: DifficultyLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreTrend {
    pub direction: TrendDirection,
    /// Points per event over the most recent events
    pub slope: f64,
    pub window: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackStatistics {
    pub total_feedback: u64,
    pub positive_count: u64,
    pub neutral_count: u64,
    pub negative_count: u64,
    pub level_changes: u64,
    pub mean_delta: Option<f64>,
    pub trend: Option<ScoreTrend>,
}

impl FeedbackStatistics {
    fn from_totals(totals: &FeedbackTotals, recent: &[FeedbackEvent]) -> Self {
        Self {
            total_feedback: totals.total,
            positive_count: totals.positive,
            neutral_count: totals.neutral,
            negative_count: totals.negative,
            level_changes: totals.level_changes,
            mean_delta: totals.mean_delta(),
            trend: score_trend(recent),
        }
    }
}

/// Trend of `new_score` across `recent` (newest first).
fn score_trend(recent: &[FeedbackEvent]) -> Option<ScoreTrend> {
    let scores: Vec<f64> = recent.iter().rev().map(|e| e.new_score).collect();
    let steps: Vec<f64> = (0..scores.len()).map(|i| i as f64).collect();
    let fit = linear_regression(&steps, &scores)?;
    let direction = if fit.slope > TREND_FLAT_SLOPE {
        TrendDirection::Improving
    } else if fit.slope < -TREND_FLAT_SLOPE {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    };
    Some(ScoreTrend {
        direction,
        slope: fit.slope,
        window: scores.len(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub learner_id: String,
    pub session_id: String,
    /// False until the first write for this key; the values are then defaults
    pub initialized: bool,
    pub comprehension_score: f64,
    pub difficulty_level: DifficultyLevel,
    pub adaptation_parameters: AdaptationParameters,
    pub statistics: FeedbackStatistics,
    pub has_completed_initial_test: bool,
    pub initial_test_score: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialTestOutcome {
    pub result: AssessmentResult,
    pub comprehension_score: f64,
    pub difficulty_level: DifficultyLevel,
}

/// Per-key async locks.
#[derive(Default)]
struct KeyLocks {
    table: Mutex<HashMap<StateKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &StateKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock();
            if table.len() >= LOCK_TABLE_PRUNE_AT {
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(table.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct EbarsService {
    store: Arc<dyn ScoreStore>,
    processor: FeedbackProcessor,
    assessment: InitialAssessment,
    locks: KeyLocks,
}

impl EbarsService {
    pub fn new(store: Arc<dyn ScoreStore>, config: EbarsConfig) -> ServiceResult<Self> {
        let assessment = InitialAssessment::new(&config);
        let processor = FeedbackProcessor::new(config)?;
        Ok(Self::with_parts(store, processor, assessment))
    }

    pub fn with_parts(
        store: Arc<dyn ScoreStore>,
        processor: FeedbackProcessor,
        assessment: InitialAssessment,
    ) -> Self {
        Self {
            store,
            processor,
            assessment,
            locks: KeyLocks::default(),
        }
    }

    pub fn processor(&self) -> &FeedbackProcessor {
        &self.processor
    }

    /// The stored snapshot (for the write's compare-and-set) and the state to work from.
    async fn load_snapshot(
        &self,
        key: &StateKey,
        now: DateTime<Utc>,
    ) -> ServiceResult<(Option<ComprehensionState>, ComprehensionState)> {
        let stored = self.store.load_state(key).await?;
        let state = stored
            .clone()
            .unwrap_or_else(|| self.processor.new_state(key, now));
        Ok((stored, state))
    }

    pub async fn submit_feedback(
        &self,
        learner_id: &str,
        session_id: &str,
        emoji: &str,
        interaction_id: Option<String>,
        query_text: Option<String>,
    ) -> ServiceResult<FeedbackOutcome> {
        let key = StateKey::new(learner_id, session_id)?;
        let emoji = Emoji::parse(emoji)?;

        let _guard = self.locks.acquire(&key).await;
        let mut attempt = 1;
        let (event_id, event) = loop {
            let now = Utc::now();
            let (stored, state) = self.load_snapshot(&key, now).await?;
            let (next, event) = self.processor.apply_feedback_at(&state, emoji, now)?;
            let event = event.with_trace(interaction_id.clone(), query_text.clone());

            match self.store.commit_feedback(stored.as_ref(), &next, &event).await {
                Ok(event_id) => break (event_id, event),
                Err(StoreError::Stale(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::warn!(
                        key = %key,
                        attempt,
                        %reason,
                        "feedback computed on stale state, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "failed to persist feedback");
                    return Err(err.into());
                }
            }
        };

        tracing::debug!(
            learner_id = %key.learner_id,
            session_id = %key.session_id,
            emoji = %emoji,
            old_score = event.old_score,
            new_score = event.new_score,
            "feedback applied"
        );
        if let Some(transition) = event.transition() {
            tracing::info!(
                learner_id = %key.learner_id,
                session_id = %key.session_id,
                from = %transition.from,
                to = %transition.to,
                direction = if transition.is_upward() { "up" } else { "down" },
                "difficulty level changed"
            );
        }

        Ok(FeedbackOutcome {
            event_id,
            new_score: event.new_score,
            new_difficulty: event.new_level,
            score_delta: event.score_delta,
            difficulty_changed: event.level_changed,
            previous_difficulty: event.old_level,
        })
    }

    /// Current state with statistics. Reading an unknown key creates nothing.
    pub async fn get_state(&self, learner_id: &str, session_id: &str) -> ServiceResult<StateView> {
        let key = StateKey::new(learner_id, session_id)?;
        let stored = self.store.load_state(&key).await?;
        let initialized = stored.is_some();
        let state = stored.unwrap_or_else(|| self.processor.new_state(&key, Utc::now()));

        let statistics = if initialized {
            let totals = self.store.feedback_totals(&key).await?;
            let recent = self.store.recent_events(&key, TREND_WINDOW).await?;
            FeedbackStatistics::from_totals(&totals, &recent)
        } else {
            FeedbackStatistics::from_totals(&FeedbackTotals::default(), &[])
        };

        Ok(self.view(state, initialized, statistics))
    }

    fn view(
        &self,
        state: ComprehensionState,
        initialized: bool,
        statistics: FeedbackStatistics,
    ) -> StateView {
        StateView {
            adaptation_parameters: self
                .processor
                .mapper()
                .parameters_for_level(state.difficulty_level),
            learner_id: state.learner_id,
            session_id: state.session_id,
            initialized,
            comprehension_score: state.score,
            difficulty_level: state.difficulty_level,
            statistics,
            has_completed_initial_test: state.has_completed_initial_test,
            initial_test_score: state.initial_test_score,
            last_updated: state.last_updated,
        }
    }

    /// Back to the default score and level. Calibration and the feedback log are kept.
    pub async fn reset_state(&self, learner_id: &str, session_id: &str) -> ServiceResult<StateView> {
        let key = StateKey::new(learner_id, session_id)?;
        let _guard = self.locks.acquire(&key).await;
        let mut attempt = 1;
        let (previous, reset) = loop {
            let now = Utc::now();
            let (stored, state) = self.load_snapshot(&key, now).await?;
            let reset = self.processor.reset_state(&state, now);
            match self.store.save_state(stored.as_ref(), &reset).await {
                Ok(()) => break (state, reset),
                Err(StoreError::Stale(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::warn!(
                        key = %key,
                        attempt,
                        %reason,
                        "reset computed on stale state, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        tracing::info!(key = %key, previous_score = previous.score, "state reset");

        let totals = self.store.feedback_totals(&key).await?;
        let recent = self.store.recent_events(&key, TREND_WINDOW).await?;
        Ok(self.view(reset, true, FeedbackStatistics::from_totals(&totals, &recent)))
    }

    pub async fn needs_initial_test(&self, learner_id: &str, session_id: &str) -> ServiceResult<bool> {
        let key = StateKey::new(learner_id, session_id)?;
        let state_done = self
            .store
            .load_state(&key)
            .await?
            .is_some_and(|s| s.has_completed_initial_test);
        if state_done {
            return Ok(false);
        }
        let test_done = self
            .store
            .load_initial_test(&key)
            .await?
            .is_some_and(|t| t.is_completed());
        Ok(!test_done)
    }

    /// Create the pending test for a key, or return the one already pending.
    pub async fn generate_initial_test(
        &self,
        learner_id: &str,
        session_id: &str,
        content: &str,
    ) -> ServiceResult<InitialTest> {
        let key = StateKey::new(learner_id, session_id)?;
        let _guard = self.locks.acquire(&key).await;

        if let Some(existing) = self.store.load_initial_test(&key).await? {
            if existing.is_completed() {
                return Err(EbarsError::AlreadyCompleted.into());
            }
            return Ok(existing);
        }
        if let Some(state) = self.store.load_state(&key).await? {
            if state.has_completed_initial_test {
                return Err(EbarsError::AlreadyCompleted.into());
            }
        }

        let test = self.assessment.start(&key, content, Utc::now())?;
        self.store.insert_initial_test(&test).await?;
        tracing::info!(key = %key, questions = test.questions.len(), "initial test generated");
        Ok(test)
    }

    pub async fn submit_initial_test(
        &self,
        learner_id: &str,
        session_id: &str,
        responses: &[AssessmentResponse],
    ) -> ServiceResult<InitialTestOutcome> {
        let key = StateKey::new(learner_id, session_id)?;
        let _guard = self.locks.acquire(&key).await;

        let test = self
            .store
            .load_initial_test(&key)
            .await?
            .ok_or(ServiceError::NoPendingTest)?;
        let mut attempt = 1;
        let (calibrated, result) = loop {
            let now = Utc::now();
            let (stored, state) = self.load_snapshot(&key, now).await?;
            let (calibrated, completed, result) =
                self.assessment.complete(&state, &test, responses, now)?;

            match self
                .store
                .complete_initial_test(&completed, stored.as_ref(), &calibrated)
                .await
            {
                Ok(()) => break (calibrated, result),
                Err(StoreError::Conflict(_)) => {
                    return Err(ServiceError::Core(EbarsError::AlreadyCompleted))
                }
                Err(StoreError::Stale(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::warn!(
                        key = %key,
                        attempt,
                        %reason,
                        "calibration computed on stale state, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        tracing::info!(
            key = %key,
            total_score = result.total_score,
            initial_score = result.initial_score,
            level = %result.initial_level,
            "initial test completed"
        );
        Ok(InitialTestOutcome {
            comprehension_score: calibrated.score,
            difficulty_level: calibrated.difficulty_level,
            result,
        })
    }

    /// Most recent events first; `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
    pub async fn feedback_history(
        &self,
        learner_id: &str,
        session_id: &str,
        limit: usize,
    ) -> ServiceResult<Vec<FeedbackEvent>> {
        let key = StateKey::new(learner_id, session_id)?;
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.recent_events(&key, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::store::{MemoryScoreStore, Result as StoreResult};
    use ebars_algo::INITIAL_TEST_QUESTIONS;

    const CONTENT: &str = "Photosynthesis converts sunlight into chemical energy. \
        Chlorophyll absorbs mostly blue and red light. \
        Plants release oxygen as a byproduct of this process. \
        Glucose produced by plants fuels cellular respiration. \
        Stomata regulate the exchange of gases through leaves. \
        Water moves upward through xylem vessels.";

    fn service() -> EbarsService {
        EbarsService::new(Arc::new(MemoryScoreStore::new()), EbarsConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_feedback_sequence_scenario() {
        let svc = service();
        let mut last = None;
        for _ in 0..3 {
            let outcome = svc.submit_feedback("l", "s", "❌", None, None).await.unwrap();
            assert!(!outcome.difficulty_changed);
            last = Some(outcome);
        }
        let last = last.unwrap();
        assert!((last.new_score - 45.5).abs() < 1e-9);
        assert_eq!(last.new_difficulty, DifficultyLevel::Normal);

        let view = svc.get_state("l", "s").await.unwrap();
        assert!(view.initialized);
        assert_eq!(view.statistics.total_feedback, 3);
        assert_eq!(view.statistics.negative_count, 3);
        assert_eq!(
            view.statistics.trend.as_ref().unwrap().direction,
            TrendDirection::Declining
        );
    }

    #[tokio::test]
    async fn test_invalid_emoji_mutates_nothing() {
        let svc = service();
        let err = svc.submit_feedback("l", "s", "🔥", None, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Core(EbarsError::InvalidEmoji(_))));
        let view = svc.get_state("l", "s").await.unwrap();
        assert!(!view.initialized);
        assert_eq!(view.comprehension_score, 50.0);
    }

    #[tokio::test]
    async fn test_reset_keeps_history() {
        let svc = service();
        for _ in 0..4 {
            svc.submit_feedback("l", "s", "👍", Some("i-1".into()), None)
                .await
                .unwrap();
        }
        let view = svc.reset_state("l", "s").await.unwrap();
        assert_eq!(view.comprehension_score, 50.0);
        assert_eq!(view.difficulty_level, DifficultyLevel::Normal);
        assert_eq!(view.statistics.total_feedback, 4);

        let history = svc.feedback_history("l", "s", 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].interaction_id.as_deref(), Some("i-1"));
    }

    #[tokio::test]
    async fn test_blank_trace_fields_dropped() {
        let svc = service();
        svc.submit_feedback("l", "s", "😊", Some("  ".into()), Some("what is xylem?".into()))
            .await
            .unwrap();
        let history = svc.feedback_history("l", "s", 10).await.unwrap();
        assert_eq!(history[0].interaction_id, None);
        assert_eq!(history[0].query_text.as_deref(), Some("what is xylem?"));
    }

    #[tokio::test]
    async fn test_initial_test_once() {
        let svc = service();
        assert!(svc.needs_initial_test("l", "s").await.unwrap());

        let first = svc.generate_initial_test("l", "s", CONTENT).await.unwrap();
        let again = svc.generate_initial_test("l", "s", CONTENT).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.questions.len(), INITIAL_TEST_QUESTIONS);

        let responses: Vec<AssessmentResponse> = first
            .questions
            .iter()
            .map(|q| AssessmentResponse {
                question_index: q.index,
                selected_option: q.correct_option,
                preference: None,
            })
            .collect();
        let outcome = svc.submit_initial_test("l", "s", &responses).await.unwrap();
        assert!((outcome.comprehension_score - 90.0).abs() < 1e-9);
        assert_eq!(outcome.difficulty_level, DifficultyLevel::Excellent);
        assert!(!svc.needs_initial_test("l", "s").await.unwrap());

        let err = svc.submit_initial_test("l", "s", &responses).await.unwrap_err();
        assert!(matches!(err, ServiceError::Core(EbarsError::AlreadyCompleted)));
        let view = svc.get_state("l", "s").await.unwrap();
        assert_eq!(view.initial_test_score, Some(90.0));

        let err = svc.generate_initial_test("l", "s", CONTENT).await.unwrap_err();
        assert!(matches!(err, ServiceError::Core(EbarsError::AlreadyCompleted)));
    }

    #[tokio::test]
    async fn test_submit_without_test() {
        let svc = service();
        let err = svc.submit_initial_test("l", "s", &[]).await.unwrap_err();
        assert!(matches!(err, ServiceError::NoPendingTest));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_feedback_loses_nothing() {
        let svc = Arc::new(service());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let svc = Arc::clone(&svc);
            handles.push(tokio::spawn(async move {
                svc.submit_feedback("l", "s", "😐", None, None).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let view = svc.get_state("l", "s").await.unwrap();
        assert_eq!(view.statistics.total_feedback, 20);
        assert!((view.comprehension_score - (50.0 + 20.0 * 0.2)).abs() < 1e-9);
    }

    /// Memory store where another writer lands one feedback just before the
    /// first commit goes through.
    struct InterleavedStore {
        inner: MemoryScoreStore,
        pending_writer: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ScoreStore for InterleavedStore {
        async fn load_state(&self, key: &StateKey) -> StoreResult<Option<ComprehensionState>> {
            self.inner.load_state(key).await
        }

        async fn save_state(
            &self,
            expected: Option<&ComprehensionState>,
            state: &ComprehensionState,
        ) -> StoreResult<()> {
            self.inner.save_state(expected, state).await
        }

        async fn commit_feedback(
            &self,
            expected: Option<&ComprehensionState>,
            state: &ComprehensionState,
            event: &FeedbackEvent,
        ) -> StoreResult<i64> {
            if self.pending_writer.swap(false, Ordering::SeqCst) {
                let processor = FeedbackProcessor::default();
                let base = expected
                    .cloned()
                    .unwrap_or_else(|| processor.new_state(&state.key(), state.created_at));
                let (other, other_event) = processor
                    .apply_feedback_at(&base, Emoji::Neutral, base.last_updated)
                    .unwrap();
                self.inner.commit_feedback(expected, &other, &other_event).await?;
            }
            self.inner.commit_feedback(expected, state, event).await
        }

        async fn recent_events(
            &self,
            key: &StateKey,
            limit: usize,
        ) -> StoreResult<Vec<FeedbackEvent>> {
            self.inner.recent_events(key, limit).await
        }

        async fn feedback_totals(&self, key: &StateKey) -> StoreResult<FeedbackTotals> {
            self.inner.feedback_totals(key).await
        }

        async fn load_initial_test(&self, key: &StateKey) -> StoreResult<Option<InitialTest>> {
            self.inner.load_initial_test(key).await
        }

        async fn insert_initial_test(&self, test: &InitialTest) -> StoreResult<()> {
            self.inner.insert_initial_test(test).await
        }

        async fn complete_initial_test(
            &self,
            test: &InitialTest,
            expected: Option<&ComprehensionState>,
            state: &ComprehensionState,
        ) -> StoreResult<()> {
            self.inner.complete_initial_test(test, expected, state).await
        }
    }

    #[tokio::test]
    async fn test_stale_commit_recomputed() {
        let store = Arc::new(InterleavedStore {
            inner: MemoryScoreStore::new(),
            pending_writer: AtomicBool::new(true),
        });
        let svc = EbarsService::new(store, EbarsConfig::default()).unwrap();

        let outcome = svc.submit_feedback("l", "s", "😐", None, None).await.unwrap();
        assert!((outcome.new_score - 50.4).abs() < 1e-9);

        let view = svc.get_state("l", "s").await.unwrap();
        assert_eq!(view.statistics.total_feedback, 2);
        assert!((view.comprehension_score - 50.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_write() {
        let store = MemoryScoreStore::new();
        let processor = FeedbackProcessor::default();
        let key = StateKey::new("l", "s").unwrap();
        let now = Utc::now();

        let state = processor.new_state(&key, now);
        let (first, event) = processor.apply_feedback_at(&state, Emoji::Neutral, now).unwrap();
        store.commit_feedback(None, &first, &event).await.unwrap();
        let (second, event) = processor.apply_feedback_at(&first, Emoji::Neutral, now).unwrap();
        store.commit_feedback(Some(&first), &second, &event).await.unwrap();

        let (lost, event) = processor.apply_feedback_at(&first, Emoji::Negative, now).unwrap();
        let err = store.commit_feedback(Some(&first), &lost, &event).await.unwrap_err();
        assert!(matches!(err, StoreError::Stale(_)));
        let reset = processor.reset_state(&first, now);
        let err = store.save_state(Some(&first), &reset).await.unwrap_err();
        assert!(matches!(err, StoreError::Stale(_)));

        let stored = store.load_state(&key).await.unwrap().unwrap();
        assert_eq!(stored, second);
        assert_eq!(store.feedback_totals(&key).await.unwrap().negative, 0);
    }
}
