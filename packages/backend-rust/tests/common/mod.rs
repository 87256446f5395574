#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use sqlx::SqlitePool;

use ebars_algo::EbarsConfig;
use ebars_backend::services::ebars::EbarsService;
use ebars_backend::state::AppState;
use ebars_backend::store::{MemoryScoreStore, SqliteScoreStore};

pub const SESSION_CONTENT: &str = "Photosynthesis converts sunlight into chemical energy. \
    Chlorophyll absorbs mostly blue and red light. \
    Plants release oxygen as a byproduct of this process. \
    Glucose produced by plants fuels cellular respiration. \
    Stomata regulate the exchange of gases through leaves. \
    Water moves upward through xylem vessels.";

pub fn memory_service() -> Arc<EbarsService> {
    Arc::new(EbarsService::new(Arc::new(MemoryScoreStore::new()), EbarsConfig::default()).unwrap())
}

pub async fn sqlite_pool(dir: &Path) -> SqlitePool {
    let url = ebars_backend::db::sqlite_url_for(&dir.join("ebars.db"));
    ebars_backend::db::connect(Some(&url)).await.unwrap()
}

pub fn sqlite_service(pool: SqlitePool) -> Arc<EbarsService> {
    Arc::new(EbarsService::new(Arc::new(SqliteScoreStore::new(pool)), EbarsConfig::default()).unwrap())
}

pub fn create_test_app() -> Router {
    ebars_backend::create_app(AppState::new(memory_service(), None))
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
