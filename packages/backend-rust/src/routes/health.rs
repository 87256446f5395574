use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::StoreKind;
use crate::state::AppState;

const DB_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/live", get(live))
        .route("/info", get(info))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    database_latency_ms: Option<u64>,
    timestamp: String,
    uptime: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    service: &'static str,
    version: &'static str,
    start_time: String,
    uptime: u64,
}

enum DbCheckStatus {
    Connected { latency_ms: u64 },
    Timeout,
    Disconnected,
    NotConfigured,
}

async fn root(State(state): State<AppState>) -> Response {
    let check = database_check(&state).await;
    let (database, latency, ok) = match check {
        DbCheckStatus::Connected { latency_ms } => ("connected", Some(latency_ms), true),
        DbCheckStatus::NotConfigured => ("not_configured", None, true),
        DbCheckStatus::Timeout => ("timeout", None, false),
        DbCheckStatus::Disconnected => ("disconnected", None, false),
    };

    let response = HealthResponse {
        status: if ok { "ok" } else { "degraded" },
        store: match state.store_kind() {
            StoreKind::Sqlite => "sqlite",
            StoreKind::Memory => "memory",
        },
        database,
        database_latency_ms: latency,
        timestamp: now_iso(),
        uptime: state.uptime_seconds(),
    };

    let status_code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response)).into_response()
}

async fn live() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive", "timestamp": now_iso() }))
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let start: chrono::DateTime<chrono::Utc> = state.started_at_system().into();
    Json(InfoResponse {
        service: "ebars-backend",
        version: env!("CARGO_PKG_VERSION"),
        start_time: start.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        uptime: state.uptime_seconds(),
    })
}

async fn database_check(state: &AppState) -> DbCheckStatus {
    let Some(pool) = state.pool() else {
        return DbCheckStatus::NotConfigured;
    };

    let started = Instant::now();
    let ping = sqlx::query("SELECT 1").execute(pool);
    match tokio::time::timeout(DB_CHECK_TIMEOUT, ping).await {
        Ok(Ok(_)) => DbCheckStatus::Connected {
            latency_ms: started.elapsed().as_millis() as u64,
        },
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "database health check failed");
            DbCheckStatus::Disconnected
        }
        Err(_) => DbCheckStatus::Timeout,
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
