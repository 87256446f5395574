mod ebars;
mod health;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::response::json_error;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let healthcheck_endpoint = normalize_healthcheck_endpoint(
        std::env::var("HEALTHCHECK_ENDPOINT")
            .ok()
            .as_deref()
            .unwrap_or("/health"),
    );

    Router::new()
        .nest("/api/ebars", ebars::router())
        .nest(&healthcheck_endpoint, health::router())
        .fallback(fallback_handler)
        .with_state(state)
}

fn normalize_healthcheck_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/health".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

async fn fallback_handler() -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Route not found").into_response()
}
