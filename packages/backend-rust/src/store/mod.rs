//! Persistence of comprehension state, the feedback log and initial tests.
//!
//! - [`SqliteScoreStore`] - durable, each write is one transaction
//! - [`MemoryScoreStore`] - process-local, used by tests and the `memory` store mode
//!
//! Every state write is a compare-and-set against the snapshot the caller read
//! (`expected`, `None` when no row existed). A write over a state that changed
//! in between fails with [`StoreError::Stale`], so a second process on the same
//! database cannot silently overwrite an update.

mod memory;
mod sqlite;

pub use memory::MemoryScoreStore;
pub use sqlite::SqliteScoreStore;

use async_trait::async_trait;
use serde::Serialize;

use ebars_algo::{ComprehensionState, FeedbackEvent, InitialTest, StateKey};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A stored row no longer decodes into the domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// Unique key taken or an initial test is not in the expected phase.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The stored state is no longer the snapshot the write was computed from.
    #[error("stale state: {0}")]
    Stale(String),
}

/// Fields compared to decide whether a stored state is still the caller's snapshot.
pub(crate) fn same_snapshot(
    stored: Option<&ComprehensionState>,
    expected: Option<&ComprehensionState>,
) -> bool {
    match (stored, expected) {
        (None, None) => true,
        (Some(stored), Some(expected)) => {
            stored.total_feedback_count == expected.total_feedback_count
                && stored.score == expected.score
                && stored.last_updated == expected.last_updated
                && stored.has_completed_initial_test == expected.has_completed_initial_test
        }
        _ => false,
    }
}

/// Aggregates over the whole feedback log of one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackTotals {
    pub total: u64,
    pub positive: u64,
    pub neutral: u64,
    pub negative: u64,
    pub level_changes: u64,
    pub delta_sum: f64,
}

impl FeedbackTotals {
    pub fn mean_delta(&self) -> Option<f64> {
        (self.total > 0).then(|| self.delta_sum / self.total as f64)
    }

    pub(crate) fn add(&mut self, event: &FeedbackEvent) {
        self.total += 1;
        if event.emoji.is_positive() {
            self.positive += 1;
        } else if event.emoji.is_negative() {
            self.negative += 1;
        } else {
            self.neutral += 1;
        }
        if event.level_changed {
            self.level_changes += 1;
        }
        self.delta_sum += event.score_delta;
    }
}

#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn load_state(&self, key: &StateKey) -> Result<Option<ComprehensionState>>;

    /// Replace the state row read as `expected`.
    async fn save_state(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()>;

    /// Persist the state produced by `event` and append the event, all or nothing.
    /// Returns the event id.
    async fn commit_feedback(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
        event: &FeedbackEvent,
    ) -> Result<i64>;

    /// Most recent events first.
    async fn recent_events(&self, key: &StateKey, limit: usize) -> Result<Vec<FeedbackEvent>>;

    async fn feedback_totals(&self, key: &StateKey) -> Result<FeedbackTotals>;

    async fn load_initial_test(&self, key: &StateKey) -> Result<Option<InitialTest>>;

    /// Store a freshly generated test. Fails with `Conflict` if one exists for the key.
    async fn insert_initial_test(&self, test: &InitialTest) -> Result<()>;

    /// Mark a pending test completed and save the calibrated state, all or nothing.
    /// Fails with `Conflict` if the test is missing or already completed.
    async fn complete_initial_test(
        &self,
        test: &InitialTest,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()>;
}
