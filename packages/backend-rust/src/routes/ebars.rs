use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ebars_algo::{
    AssessmentQuestion, AssessmentResponse, DifficultyLevel, FeedbackEvent, InitialTest,
    QuestionDifficulty,
};

use crate::response::{AppError, SuccessResponse};
use crate::services::ebars::{FeedbackOutcome, InitialTestOutcome, StateView};
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/feedback", post(submit_feedback))
        .route("/state", get(get_state))
        .route("/reset", post(reset_state))
        .route("/history", get(history))
        .route("/initial-test/status", get(initial_test_status))
        .route("/initial-test/generate", post(generate_initial_test))
        .route("/initial-test/submit", post(submit_initial_test))
}

type ApiResult<T> = Result<Json<SuccessResponse<T>>, AppError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(inner)| inner)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyParams {
    learner_id: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackRequest {
    learner_id: String,
    session_id: String,
    emoji: String,
    interaction_id: Option<String>,
    query_text: Option<String>,
}

async fn submit_feedback(
    State(state): State<AppState>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> ApiResult<FeedbackOutcome> {
    let req = body(payload)?;
    let outcome = state
        .service()
        .submit_feedback(
            &req.learner_id,
            &req.session_id,
            &req.emoji,
            req.interaction_id,
            req.query_text,
        )
        .await?;
    Ok(SuccessResponse::ok(outcome))
}

async fn get_state(
    State(state): State<AppState>,
    params: Result<Query<KeyParams>, QueryRejection>,
) -> ApiResult<StateView> {
    let key = query(params)?;
    let view = state
        .service()
        .get_state(&key.learner_id, &key.session_id)
        .await?;
    Ok(SuccessResponse::ok(view))
}

async fn reset_state(
    State(state): State<AppState>,
    payload: Result<Json<KeyParams>, JsonRejection>,
) -> ApiResult<StateView> {
    let key = body(payload)?;
    let view = state
        .service()
        .reset_state(&key.learner_id, &key.session_id)
        .await?;
    Ok(SuccessResponse::ok(view))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    learner_id: String,
    session_id: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackEventDto {
    id: Option<i64>,
    emoji: String,
    interaction_id: Option<String>,
    query_text: Option<String>,
    old_score: f64,
    new_score: f64,
    score_delta: f64,
    old_level: DifficultyLevel,
    new_level: DifficultyLevel,
    level_changed: bool,
    created_at: DateTime<Utc>,
}

impl From<FeedbackEvent> for FeedbackEventDto {
    fn from(event: FeedbackEvent) -> Self {
        Self {
            id: event.id,
            emoji: event.emoji.symbol().to_string(),
            interaction_id: event.interaction_id,
            query_text: event.query_text,
            old_score: event.old_score,
            new_score: event.new_score,
            score_delta: event.score_delta,
            old_level: event.old_level,
            new_level: event.new_level,
            level_changed: event.level_changed,
            created_at: event.created_at,
        }
    }
}

async fn history(
    State(state): State<AppState>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> ApiResult<Vec<FeedbackEventDto>> {
    let params = query(params)?;
    let events = state
        .service()
        .feedback_history(
            &params.learner_id,
            &params.session_id,
            params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        )
        .await?;
    Ok(SuccessResponse::ok(
        events.into_iter().map(FeedbackEventDto::from).collect(),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitialTestStatus {
    needs_initial_test: bool,
}

async fn initial_test_status(
    State(state): State<AppState>,
    params: Result<Query<KeyParams>, QueryRejection>,
) -> ApiResult<InitialTestStatus> {
    let key = query(params)?;
    let needs_initial_test = state
        .service()
        .needs_initial_test(&key.learner_id, &key.session_id)
        .await?;
    Ok(SuccessResponse::ok(InitialTestStatus { needs_initial_test }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    learner_id: String,
    session_id: String,
    content: String,
}

/// Question as shown to the learner; the answer stays server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuestionDto {
    index: usize,
    prompt: String,
    options: Vec<String>,
    difficulty: QuestionDifficulty,
}

impl From<AssessmentQuestion> for QuestionDto {
    fn from(question: AssessmentQuestion) -> Self {
        Self {
            index: question.index,
            prompt: question.prompt,
            options: question.options,
            difficulty: question.difficulty,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitialTestDto {
    learner_id: String,
    session_id: String,
    questions: Vec<QuestionDto>,
    started_at: DateTime<Utc>,
}

impl From<InitialTest> for InitialTestDto {
    fn from(test: InitialTest) -> Self {
        Self {
            learner_id: test.learner_id,
            session_id: test.session_id,
            questions: test.questions.into_iter().map(QuestionDto::from).collect(),
            started_at: test.started_at,
        }
    }
}

async fn generate_initial_test(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> ApiResult<InitialTestDto> {
    let req = body(payload)?;
    let test = state
        .service()
        .generate_initial_test(&req.learner_id, &req.session_id, &req.content)
        .await?;
    Ok(SuccessResponse::ok(test.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    learner_id: String,
    session_id: String,
    responses: Vec<AssessmentResponse>,
}

async fn submit_initial_test(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<InitialTestOutcome> {
    let req = body(payload)?;
    let outcome = state
        .service()
        .submit_initial_test(&req.learner_id, &req.session_id, &req.responses)
        .await?;
    Ok(SuccessResponse::ok(outcome))
}
