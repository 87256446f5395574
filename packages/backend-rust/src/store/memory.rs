use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use ebars_algo::{ComprehensionState, FeedbackEvent, InitialTest, StateKey};

use super::{same_snapshot, FeedbackTotals, Result, ScoreStore, StoreError};

#[derive(Default)]
struct Inner {
    states: HashMap<StateKey, ComprehensionState>,
    events: HashMap<StateKey, Vec<FeedbackEvent>>,
    tests: HashMap<StateKey, InitialTest>,
    next_event_id: i64,
}

/// Everything behind one lock, so multi-part writes are atomic.
#[derive(Default)]
pub struct MemoryScoreStore {
    inner: RwLock<Inner>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn check_current(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()> {
        let key = state.key();
        if same_snapshot(self.states.get(&key), expected) {
            Ok(())
        } else {
            Err(StoreError::Stale(format!(
                "state for {key} changed since it was read"
            )))
        }
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn load_state(&self, key: &StateKey) -> Result<Option<ComprehensionState>> {
        Ok(self.inner.read().states.get(key).cloned())
    }

    async fn save_state(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_current(expected, state)?;
        inner.states.insert(state.key(), state.clone());
        Ok(())
    }

    async fn commit_feedback(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
        event: &FeedbackEvent,
    ) -> Result<i64> {
        let mut inner = self.inner.write();
        inner.check_current(expected, state)?;
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        let key = state.key();
        inner.states.insert(key.clone(), state.clone());
        inner.events.entry(key).or_default().push(FeedbackEvent {
            id: Some(id),
            ..event.clone()
        });
        Ok(id)
    }

    async fn recent_events(&self, key: &StateKey, limit: usize) -> Result<Vec<FeedbackEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(key)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn feedback_totals(&self, key: &StateKey) -> Result<FeedbackTotals> {
        let inner = self.inner.read();
        let mut totals = FeedbackTotals::default();
        for event in inner.events.get(key).into_iter().flatten() {
            totals.add(event);
        }
        Ok(totals)
    }

    async fn load_initial_test(&self, key: &StateKey) -> Result<Option<InitialTest>> {
        Ok(self.inner.read().tests.get(key).cloned())
    }

    async fn insert_initial_test(&self, test: &InitialTest) -> Result<()> {
        let mut inner = self.inner.write();
        let key = test.key();
        if inner.tests.contains_key(&key) {
            return Err(StoreError::Conflict(format!("initial test exists for {key}")));
        }
        inner.tests.insert(key, test.clone());
        Ok(())
    }

    async fn complete_initial_test(
        &self,
        test: &InitialTest,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let key = test.key();
        match inner.tests.get(&key) {
            Some(existing) if !existing.is_completed() => {}
            Some(_) => {
                return Err(StoreError::Conflict(format!(
                    "initial test already completed for {key}"
                )))
            }
            None => return Err(StoreError::Conflict(format!("no initial test for {key}"))),
        }
        inner.check_current(expected, state)?;
        inner.tests.insert(key.clone(), test.clone());
        inner.states.insert(key, state.clone());
        Ok(())
    }
}
