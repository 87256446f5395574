use std::sync::Arc;
use std::time::{Instant, SystemTime};

use sqlx::SqlitePool;

use crate::config::StoreKind;
use crate::services::ebars::EbarsService;

#[derive(Clone)]
pub struct AppState {
    service: Arc<EbarsService>,
    pool: Option<SqlitePool>,
    store_kind: StoreKind,
    started_at: Instant,
    started_at_system: SystemTime,
}

impl AppState {
    pub fn new(service: Arc<EbarsService>, pool: Option<SqlitePool>) -> Self {
        let store_kind = if pool.is_some() {
            StoreKind::Sqlite
        } else {
            StoreKind::Memory
        };
        Self {
            service,
            pool,
            store_kind,
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
        }
    }

    pub fn service(&self) -> &EbarsService {
        &self.service
    }

    /// Present when the service is backed by SQLite.
    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    pub fn store_kind(&self) -> StoreKind {
        self.store_kind
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
