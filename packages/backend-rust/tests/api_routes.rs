use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

mod common;

use common::{body_json, create_test_app, get, post_json, SESSION_CONTENT};

#[tokio::test]
async fn test_health_root() {
    let app = create_test_app();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["store"], "memory");
    assert_eq!(body["database"], "not_configured");
}

#[tokio::test]
async fn test_health_live() {
    let app = create_test_app();
    let response = app.oneshot(get("/health/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route() {
    let app = create_test_app();
    let response = app.oneshot(get("/api/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_feedback_then_state() {
    let app = create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/ebars/feedback",
            json!({ "learnerId": "u1", "sessionId": "s1", "emoji": "👍", "interactionId": "m-1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["newScore"], 52.5);
    assert_eq!(body["data"]["scoreDelta"], 2.5);
    assert_eq!(body["data"]["newDifficulty"], "normal");
    assert_eq!(body["data"]["difficultyChanged"], false);

    let response = app
        .clone()
        .oneshot(get("/api/ebars/state?learnerId=u1&sessionId=s1"))
        .await
        .unwrap();
    let body = body_json(response).await;
    let data = &body["data"];
    assert_eq!(data["initialized"], true);
    assert_eq!(data["comprehensionScore"], 52.5);
    assert_eq!(data["statistics"]["totalFeedback"], 1);
    assert_eq!(data["statistics"]["positiveCount"], 1);
    assert_eq!(data["adaptationParameters"]["difficultyLevel"], "normal");

    let response = app
        .oneshot(get("/api/ebars/history?learnerId=u1&sessionId=s1&limit=10"))
        .await
        .unwrap();
    let body = body_json(response).await;
    let events = body["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["emoji"], "👍");
    assert_eq!(events[0]["interactionId"], "m-1");
}

#[tokio::test]
async fn test_invalid_emoji_rejected() {
    let app = create_test_app();
    let response = app
        .oneshot(post_json(
            "/api/ebars/feedback",
            json!({ "learnerId": "u1", "sessionId": "s1", "emoji": "🎉" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_EMOJI");
}

#[tokio::test]
async fn test_missing_fields_rejected() {
    let app = create_test_app();
    let response = app
        .clone()
        .oneshot(post_json("/api/ebars/feedback", json!({ "learnerId": "u1" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");

    let response = app.oneshot(get("/api/ebars/state?learnerId=u1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_blank_key_rejected() {
    let app = create_test_app();
    let response = app
        .oneshot(post_json(
            "/api/ebars/feedback",
            json!({ "learnerId": "  ", "sessionId": "s1", "emoji": "👍" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_reset_endpoint() {
    let app = create_test_app();
    for _ in 0..3 {
        app.clone()
            .oneshot(post_json(
                "/api/ebars/feedback",
                json!({ "learnerId": "u1", "sessionId": "s1", "emoji": "❌" }),
            ))
            .await
            .unwrap();
    }
    let response = app
        .oneshot(post_json(
            "/api/ebars/reset",
            json!({ "learnerId": "u1", "sessionId": "s1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["comprehensionScore"], 50.0);
    assert_eq!(body["data"]["difficultyLevel"], "normal");
}

#[tokio::test]
async fn test_initial_test_flow() {
    let app = create_test_app();

    let status = body_json(
        app.clone()
            .oneshot(get("/api/ebars/initial-test/status?learnerId=u1&sessionId=s1"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status["data"]["needsInitialTest"], true);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/ebars/initial-test/generate",
            json!({ "learnerId": "u1", "sessionId": "s1", "content": SESSION_CONTENT }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let questions = body["data"]["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 5);
    assert!(questions.iter().all(|q| q.get("correctOption").is_none()));

    // Answer option 0 everywhere; whatever the score, the submission is accepted once.
    let responses: Vec<_> = questions
        .iter()
        .map(|q| json!({ "questionIndex": q["index"], "selectedOption": 0 }))
        .collect();
    let submit = json!({ "learnerId": "u1", "sessionId": "s1", "responses": responses });

    let response = app
        .clone()
        .oneshot(post_json("/api/ebars/initial-test/submit", submit.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let score = body["data"]["comprehensionScore"].as_f64().unwrap();
    assert!((20.0..=90.0).contains(&score));

    let response = app
        .clone()
        .oneshot(post_json("/api/ebars/initial-test/submit", submit))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "ALREADY_COMPLETED");

    let status = body_json(
        app.oneshot(get("/api/ebars/initial-test/status?learnerId=u1&sessionId=s1"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status["data"]["needsInitialTest"], false);
}

#[tokio::test]
async fn test_submit_without_pending_test() {
    let app = create_test_app();
    let response = app
        .oneshot(post_json(
            "/api/ebars/initial-test/submit",
            json!({ "learnerId": "u1", "sessionId": "s1", "responses": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_generate_with_empty_content() {
    let app = create_test_app();
    let response = app
        .oneshot(post_json(
            "/api/ebars/initial-test/generate",
            json!({ "learnerId": "u1", "sessionId": "s1", "content": "   " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
