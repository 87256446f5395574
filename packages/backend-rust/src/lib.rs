//! HTTP service and research tooling around the EBARS core.

pub mod config;
pub mod db;
pub mod logging;
pub mod response;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

use std::sync::Arc;

use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use ebars_algo::EbarsConfig;

use crate::config::{Config, StoreKind};
use crate::services::ebars::{EbarsService, ServiceError};
use crate::state::AppState;
use crate::store::{MemoryScoreStore, ScoreStore, SqliteScoreStore};

#[derive(Debug, thiserror::Error)]
pub enum AppInitError {
    #[error(transparent)]
    Database(#[from] db::DbInitError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Open the configured store and wrap it in the service.
pub async fn build_state(config: &Config, ebars: EbarsConfig) -> Result<AppState, AppInitError> {
    let (store, pool): (Arc<dyn ScoreStore>, Option<SqlitePool>) = match config.store {
        StoreKind::Memory => {
            tracing::warn!("using in-memory store, state is lost on restart");
            let store: Arc<dyn ScoreStore> = Arc::new(MemoryScoreStore::new());
            (store, None)
        }
        StoreKind::Sqlite => {
            let pool = db::connect(config.database_url.as_deref()).await?;
            let store: Arc<dyn ScoreStore> = Arc::new(SqliteScoreStore::new(pool.clone()));
            (store, Some(pool))
        }
    };
    let service = EbarsService::new(store, ebars)?;
    Ok(AppState::new(Arc::new(service), pool))
}

pub fn create_app(state: AppState) -> axum::Router {
    routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
