use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use ebars_algo::{
    ComprehensionState, DifficultyLevel, Emoji, FeedbackEvent, InitialTest, StateKey,
};

use super::{FeedbackTotals, Result, ScoreStore, StoreError};

#[derive(Clone)]
pub struct SqliteScoreStore {
    pool: SqlitePool,
}

impl SqliteScoreStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn stale(state: &ComprehensionState) -> StoreError {
    StoreError::Stale(format!("state for {} changed since it was read", state.key()))
}

fn db_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Write `next` only if the stored row still matches `expected`: a fresh insert when
/// no row was read, otherwise an update guarded on the snapshot columns.
async fn write_state_checked(
    conn: &mut SqliteConnection,
    expected: Option<&ComprehensionState>,
    next: &ComprehensionState,
) -> Result<()> {
    let Some(expected) = expected else {
        let inserted = sqlx::query(
            r#"
            INSERT INTO "comprehension_states" (
                "learner_id", "session_id", "score", "difficulty_level",
                "consecutive_positive", "consecutive_negative", "feedback_since_level_change",
                "pending_level", "total_feedback_count", "has_completed_initial_test",
                "initial_test_score", "initial_test_completed_at", "created_at", "last_updated"
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(next.learner_id.as_str())
        .bind(next.session_id.as_str())
        .bind(next.score)
        .bind(next.difficulty_level.as_str())
        .bind(i64::from(next.consecutive_positive))
        .bind(i64::from(next.consecutive_negative))
        .bind(i64::from(next.feedback_since_level_change))
        .bind(next.pending_level.map(|l| l.as_str()))
        .bind(db_count(next.total_feedback_count))
        .bind(next.has_completed_initial_test)
        .bind(next.initial_test_score)
        .bind(next.initial_test_completed_at)
        .bind(next.created_at)
        .bind(next.last_updated)
        .execute(conn)
        .await;
        return match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(stale(next)),
            Err(err) => Err(err.into()),
        };
    };

    let updated = sqlx::query(
        r#"
        UPDATE "comprehension_states" SET
            "score" = ?,
            "difficulty_level" = ?,
            "consecutive_positive" = ?,
            "consecutive_negative" = ?,
            "feedback_since_level_change" = ?,
            "pending_level" = ?,
            "total_feedback_count" = ?,
            "has_completed_initial_test" = ?,
            "initial_test_score" = ?,
            "initial_test_completed_at" = ?,
            "last_updated" = ?
        WHERE "learner_id" = ? AND "session_id" = ?
            AND "total_feedback_count" = ?
            AND "score" = ?
            AND "last_updated" = ?
            AND "has_completed_initial_test" = ?
        "#,
    )
    .bind(next.score)
    .bind(next.difficulty_level.as_str())
    .bind(i64::from(next.consecutive_positive))
    .bind(i64::from(next.consecutive_negative))
    .bind(i64::from(next.feedback_since_level_change))
    .bind(next.pending_level.map(|l| l.as_str()))
    .bind(db_count(next.total_feedback_count))
    .bind(next.has_completed_initial_test)
    .bind(next.initial_test_score)
    .bind(next.initial_test_completed_at)
    .bind(next.last_updated)
    .bind(expected.learner_id.as_str())
    .bind(expected.session_id.as_str())
    .bind(db_count(expected.total_feedback_count))
    .bind(expected.score)
    .bind(expected.last_updated)
    .bind(expected.has_completed_initial_test)
    .execute(conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(stale(next));
    }
    Ok(())
}

fn level_column(row: &SqliteRow, column: &str) -> Result<DifficultyLevel> {
    let raw: String = row.try_get(column)?;
    DifficultyLevel::parse(&raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{column}: {raw}")))
}

fn map_state(row: &SqliteRow) -> Result<ComprehensionState> {
    let pending: Option<String> = row.try_get("pending_level")?;
    let pending_level = pending
        .map(|raw| DifficultyLevel::parse(&raw))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("pending_level: {e}")))?;
    let total: i64 = row.try_get("total_feedback_count")?;

    let state = ComprehensionState {
        learner_id: row.try_get("learner_id")?,
        session_id: row.try_get("session_id")?,
        score: row.try_get("score")?,
        difficulty_level: level_column(row, "difficulty_level")?,
        consecutive_positive: count_column(row, "consecutive_positive")?,
        consecutive_negative: count_column(row, "consecutive_negative")?,
        feedback_since_level_change: count_column(row, "feedback_since_level_change")?,
        pending_level,
        total_feedback_count: u64::try_from(total)
            .map_err(|_| StoreError::Corrupt(format!("total_feedback_count: {total}")))?,
        has_completed_initial_test: row.try_get("has_completed_initial_test")?,
        initial_test_score: row.try_get("initial_test_score")?,
        initial_test_completed_at: row.try_get("initial_test_completed_at")?,
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
    };
    state
        .validate()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(state)
}

fn map_event(row: &SqliteRow) -> Result<FeedbackEvent> {
    let emoji: String = row.try_get("emoji")?;
    Ok(FeedbackEvent {
        id: Some(row.try_get("id")?),
        learner_id: row.try_get("learner_id")?,
        session_id: row.try_get("session_id")?,
        emoji: Emoji::parse(&emoji).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        interaction_id: row.try_get("interaction_id")?,
        query_text: row.try_get("query_text")?,
        old_score: row.try_get("old_score")?,
        new_score: row.try_get("new_score")?,
        score_delta: row.try_get("score_delta")?,
        old_level: level_column(row, "old_level")?,
        new_level: level_column(row, "new_level")?,
        level_changed: row.try_get("level_changed")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_test(row: &SqliteRow) -> Result<InitialTest> {
    let questions: String = row.try_get("questions")?;
    let item_correct: String = row.try_get("item_correct")?;
    let preferences: String = row.try_get("answer_preferences")?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
    Ok(InitialTest {
        learner_id: row.try_get("learner_id")?,
        session_id: row.try_get("session_id")?,
        questions: serde_json::from_str(&questions)?,
        item_correct: serde_json::from_str(&item_correct)?,
        total_score: row.try_get("total_score")?,
        answer_preferences: serde_json::from_str(&preferences)?,
        started_at: row.try_get("started_at")?,
        completed_at,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl ScoreStore for SqliteScoreStore {
    async fn load_state(&self, key: &StateKey) -> Result<Option<ComprehensionState>> {
        let row = sqlx::query(
            r#"SELECT * FROM "comprehension_states" WHERE "learner_id" = ? AND "session_id" = ?"#,
        )
        .bind(key.learner_id.as_str())
        .bind(key.session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_state).transpose()
    }

    async fn save_state(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_state_checked(&mut conn, expected, state).await
    }

    async fn commit_feedback(
        &self,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
        event: &FeedbackEvent,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        // Dropping `tx` on a stale snapshot rolls the transaction back.
        write_state_checked(&mut tx, expected, state).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO "feedback_events" (
                "learner_id", "session_id", "emoji", "interaction_id", "query_text",
                "old_score", "new_score", "score_delta", "old_level", "new_level",
                "level_changed", "created_at"
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.learner_id.as_str())
        .bind(event.session_id.as_str())
        .bind(event.emoji.symbol())
        .bind(event.interaction_id.as_deref())
        .bind(event.query_text.as_deref())
        .bind(event.old_score)
        .bind(event.new_score)
        .bind(event.score_delta)
        .bind(event.old_level.as_str())
        .bind(event.new_level.as_str())
        .bind(event.level_changed)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    async fn recent_events(&self, key: &StateKey, limit: usize) -> Result<Vec<FeedbackEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM "feedback_events"
            WHERE "learner_id" = ? AND "session_id" = ?
            ORDER BY "id" DESC
            LIMIT ?
            "#,
        )
        .bind(key.learner_id.as_str())
        .bind(key.session_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_event).collect()
    }

    async fn feedback_totals(&self, key: &StateKey) -> Result<FeedbackTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS "total",
                SUM(CASE WHEN "emoji" IN (?, ?) THEN 1 ELSE 0 END) AS "positive",
                SUM(CASE WHEN "emoji" = ? THEN 1 ELSE 0 END) AS "neutral",
                SUM(CASE WHEN "emoji" = ? THEN 1 ELSE 0 END) AS "negative",
                SUM("level_changed") AS "level_changes",
                SUM("score_delta") AS "delta_sum"
            FROM "feedback_events"
            WHERE "learner_id" = ? AND "session_id" = ?
            "#,
        )
        .bind(Emoji::StrongPositive.symbol())
        .bind(Emoji::MildPositive.symbol())
        .bind(Emoji::Neutral.symbol())
        .bind(Emoji::Negative.symbol())
        .bind(key.learner_id.as_str())
        .bind(key.session_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64> {
            let value: Option<i64> = row.try_get(column)?;
            Ok(value.unwrap_or(0).max(0) as u64)
        };
        Ok(FeedbackTotals {
            total: count("total")?,
            positive: count("positive")?,
            neutral: count("neutral")?,
            negative: count("negative")?,
            level_changes: count("level_changes")?,
            delta_sum: row.try_get::<Option<f64>, _>("delta_sum")?.unwrap_or(0.0),
        })
    }

    async fn load_initial_test(&self, key: &StateKey) -> Result<Option<InitialTest>> {
        let row = sqlx::query(
            r#"SELECT * FROM "initial_tests" WHERE "learner_id" = ? AND "session_id" = ?"#,
        )
        .bind(key.learner_id.as_str())
        .bind(key.session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_test).transpose()
    }

    async fn insert_initial_test(&self, test: &InitialTest) -> Result<()> {
        let questions = serde_json::to_string(&test.questions)?;
        let item_correct = serde_json::to_string(&test.item_correct)?;
        let preferences = serde_json::to_string(&test.answer_preferences)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO "initial_tests" (
                "learner_id", "session_id", "questions", "item_correct", "total_score",
                "answer_preferences", "started_at", "completed_at"
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(test.learner_id.as_str())
        .bind(test.session_id.as_str())
        .bind(questions)
        .bind(item_correct)
        .bind(test.total_score)
        .bind(preferences)
        .bind(test.started_at)
        .bind(test.completed_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "initial test exists for {}",
                test.key()
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn complete_initial_test(
        &self,
        test: &InitialTest,
        expected: Option<&ComprehensionState>,
        state: &ComprehensionState,
    ) -> Result<()> {
        let item_correct = serde_json::to_string(&test.item_correct)?;
        let preferences = serde_json::to_string(&test.answer_preferences)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE "initial_tests"
            SET "item_correct" = ?, "total_score" = ?, "answer_preferences" = ?, "completed_at" = ?
            WHERE "learner_id" = ? AND "session_id" = ? AND "completed_at" IS NULL
            "#,
        )
        .bind(item_correct)
        .bind(test.total_score)
        .bind(preferences)
        .bind(test.completed_at)
        .bind(test.learner_id.as_str())
        .bind(test.session_id.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "no pending initial test for {}",
                test.key()
            )));
        }

        write_state_checked(&mut tx, expected, state).await?;
        tx.commit().await?;
        Ok(())
    }
}
