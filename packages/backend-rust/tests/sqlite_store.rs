use std::sync::Arc;

use chrono::Utc;

use ebars_algo::{
    AssessmentResponse, DifficultyLevel, EbarsError, Emoji, FeedbackProcessor, InitialAssessment,
    EbarsConfig, StateKey,
};
use ebars_backend::services::ebars::ServiceError;
use ebars_backend::store::{ScoreStore, SqliteScoreStore, StoreError};

mod common;

use common::{sqlite_pool, sqlite_service, SESSION_CONTENT};

fn key() -> StateKey {
    StateKey::new("learner-1", "session-1").unwrap()
}

#[tokio::test]
async fn test_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScoreStore::new(sqlite_pool(dir.path()).await);
    let processor = FeedbackProcessor::default();
    let now = Utc::now();

    assert!(store.load_state(&key()).await.unwrap().is_none());

    let state = processor.new_state(&key(), now);
    let (next, event) = processor
        .apply_feedback_at(&state, Emoji::StrongPositive, now)
        .unwrap();
    let id = store.commit_feedback(None, &next, &event).await.unwrap();
    assert!(id > 0);

    let loaded = store.load_state(&key()).await.unwrap().unwrap();
    assert_eq!(loaded.score, next.score);
    assert_eq!(loaded.difficulty_level, next.difficulty_level);
    assert_eq!(loaded.consecutive_positive, next.consecutive_positive);
    assert_eq!(loaded.total_feedback_count, 1);

    let events = store.recent_events(&key(), 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, Some(id));
    assert_eq!(events[0].emoji, Emoji::StrongPositive);

    let totals = store.feedback_totals(&key()).await.unwrap();
    assert_eq!(totals.total, 1);
    assert_eq!(totals.positive, 1);
    assert_eq!(totals.mean_delta(), Some(event.score_delta));
}

#[tokio::test]
async fn test_events_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScoreStore::new(sqlite_pool(dir.path()).await);
    let processor = FeedbackProcessor::default();
    let mut state = processor.new_state(&key(), Utc::now());
    let mut stored = None;

    for emoji in [Emoji::Negative, Emoji::Neutral, Emoji::MildPositive] {
        let (next, event) = processor.apply_feedback_at(&state, emoji, Utc::now()).unwrap();
        store.commit_feedback(stored.as_ref(), &next, &event).await.unwrap();
        stored = Some(next.clone());
        state = next;
    }

    let events = store.recent_events(&key(), 2).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].emoji, Emoji::MildPositive);
    assert_eq!(events[1].emoji, Emoji::Neutral);

    let totals = store.feedback_totals(&key()).await.unwrap();
    assert_eq!((totals.positive, totals.neutral, totals.negative), (1, 1, 1));
}

#[tokio::test]
async fn test_initial_test_compare_and_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScoreStore::new(sqlite_pool(dir.path()).await);
    let config = EbarsConfig::default();
    let assessment = InitialAssessment::new(&config);
    let processor = FeedbackProcessor::new(config).unwrap();
    let now = Utc::now();

    let test = assessment.start(&key(), SESSION_CONTENT, now).unwrap();
    store.insert_initial_test(&test).await.unwrap();
    let duplicate = store.insert_initial_test(&test).await.unwrap_err();
    assert!(matches!(duplicate, StoreError::Conflict(_)));

    let loaded = store.load_initial_test(&key()).await.unwrap().unwrap();
    assert_eq!(loaded.questions, test.questions);
    assert!(!loaded.is_completed());

    let responses: Vec<AssessmentResponse> = test
        .questions
        .iter()
        .map(|q| AssessmentResponse {
            question_index: q.index,
            selected_option: q.correct_option,
            preference: None,
        })
        .collect();
    let state = processor.new_state(&key(), now);
    let (calibrated, completed, _) = assessment.complete(&state, &test, &responses, now).unwrap();

    store
        .complete_initial_test(&completed, None, &calibrated)
        .await
        .unwrap();
    let again = store
        .complete_initial_test(&completed, Some(&calibrated), &calibrated)
        .await
        .unwrap_err();
    assert!(matches!(again, StoreError::Conflict(_)));

    let stored = store.load_initial_test(&key()).await.unwrap().unwrap();
    assert!(stored.is_completed());
    assert_eq!(stored.item_correct, vec![true; 5]);
    let state = store.load_state(&key()).await.unwrap().unwrap();
    assert!(state.has_completed_initial_test);
    assert_eq!(state.difficulty_level, DifficultyLevel::Excellent);
}

#[tokio::test]
async fn test_commit_on_stale_snapshot_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScoreStore::new(sqlite_pool(dir.path()).await);
    let processor = FeedbackProcessor::default();
    let now = Utc::now();

    let state = processor.new_state(&key(), now);
    let (first, event) = processor.apply_feedback_at(&state, Emoji::Neutral, now).unwrap();
    store.commit_feedback(None, &first, &event).await.unwrap();

    // Two writers both read `first` and compute their next state from it.
    let later = now + chrono::Duration::seconds(1);
    let (a, event_a) = processor.apply_feedback_at(&first, Emoji::StrongPositive, later).unwrap();
    let (b, event_b) = processor.apply_feedback_at(&first, Emoji::Negative, later).unwrap();

    store.commit_feedback(Some(&first), &a, &event_a).await.unwrap();
    let err = store
        .commit_feedback(Some(&first), &b, &event_b)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Stale(_)), "got {err}");

    let loaded = store.load_state(&key()).await.unwrap().unwrap();
    assert_eq!(loaded.score, a.score);
    assert_eq!(loaded.total_feedback_count, 2);
    // The rejected event was rolled back with its state.
    let totals = store.feedback_totals(&key()).await.unwrap();
    assert_eq!(totals.total, 2);
    assert_eq!(totals.negative, 0);

    // A second insert over a row that now exists is stale too.
    let err = store.commit_feedback(None, &b, &event_b).await.unwrap_err();
    assert!(matches!(err, StoreError::Stale(_)), "got {err}");
}

#[tokio::test]
async fn test_stale_reset_keeps_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScoreStore::new(sqlite_pool(dir.path()).await);
    let config = EbarsConfig::default();
    let assessment = InitialAssessment::new(&config);
    let processor = FeedbackProcessor::new(config).unwrap();
    let now = Utc::now();

    let state = processor.new_state(&key(), now);
    let (fed, event) = processor.apply_feedback_at(&state, Emoji::Neutral, now).unwrap();
    store.commit_feedback(None, &fed, &event).await.unwrap();

    let test = assessment.start(&key(), SESSION_CONTENT, now).unwrap();
    store.insert_initial_test(&test).await.unwrap();
    let responses: Vec<AssessmentResponse> = test
        .questions
        .iter()
        .map(|q| AssessmentResponse {
            question_index: q.index,
            selected_option: q.correct_option,
            preference: None,
        })
        .collect();
    let later = now + chrono::Duration::seconds(1);
    let (calibrated, completed, _) = assessment.complete(&fed, &test, &responses, later).unwrap();
    store
        .complete_initial_test(&completed, Some(&fed), &calibrated)
        .await
        .unwrap();

    // A reset computed from the pre-calibration read must not clobber it.
    let reset = processor.reset_state(&fed, later);
    let err = store.save_state(Some(&fed), &reset).await.unwrap_err();
    assert!(matches!(err, StoreError::Stale(_)), "got {err}");

    let loaded = store.load_state(&key()).await.unwrap().unwrap();
    assert!(loaded.has_completed_initial_test);
    assert_eq!(loaded.difficulty_level, DifficultyLevel::Excellent);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let service = sqlite_service(sqlite_pool(dir.path()).await);
        for _ in 0..3 {
            service
                .submit_feedback("learner-1", "session-1", "❌", None, None)
                .await
                .unwrap();
        }
    }

    let service = sqlite_service(sqlite_pool(dir.path()).await);
    let view = service.get_state("learner-1", "session-1").await.unwrap();
    assert!((view.comprehension_score - 45.5).abs() < 1e-9);
    assert_eq!(view.difficulty_level, DifficultyLevel::Normal);
    assert_eq!(view.statistics.total_feedback, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_feedback_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let service = sqlite_service(sqlite_pool(dir.path()).await);

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = Arc::clone(&service);
        let session = if i % 2 == 0 { "session-1" } else { "session-2" };
        handles.push(tokio::spawn(async move {
            service
                .submit_feedback("learner-1", session, "😐", None, None)
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for session in ["session-1", "session-2"] {
        let view = service.get_state("learner-1", session).await.unwrap();
        assert_eq!(view.statistics.total_feedback, 8);
        assert!((view.comprehension_score - (50.0 + 8.0 * 0.2)).abs() < 1e-9);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initial_test_accepted_once_under_race() {
    let dir = tempfile::tempdir().unwrap();
    let service = sqlite_service(sqlite_pool(dir.path()).await);
    let test = service
        .generate_initial_test("learner-1", "session-1", SESSION_CONTENT)
        .await
        .unwrap();
    let responses: Arc<Vec<AssessmentResponse>> = Arc::new(
        test.questions
            .iter()
            .map(|q| AssessmentResponse {
                question_index: q.index,
                selected_option: 0,
                preference: None,
            })
            .collect(),
    );

    let mut handles = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&service);
        let responses = Arc::clone(&responses);
        handles.push(tokio::spawn(async move {
            service
                .submit_initial_test("learner-1", "session-1", &responses)
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(ServiceError::Core(EbarsError::AlreadyCompleted)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 1);
}
