//! SQLite pool setup and schema migration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub const EBARS_SCHEMA_SQL: &str = include_str!("../../sql/ebars_schema.sql");

const SCHEMA_VERSION: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum DbInitError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Default database file: `<data-local-dir>/ebars/ebars.db`.
pub fn default_sqlite_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ebars")
        .join("ebars.db")
}

pub fn sqlite_url_for(path: &std::path::Path) -> String {
    format!("sqlite:{}?mode=rwc", path.display())
}

/// Open (creating if needed) and migrate the database at `url`.
/// `None` resolves to [`default_sqlite_path`].
pub async fn connect(url: Option<&str>) -> Result<SqlitePool, DbInitError> {
    let url = match url {
        Some(url) => url.to_string(),
        None => {
            let path = default_sqlite_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DbInitError::Io(e.to_string()))?;
            }
            sqlite_url_for(&path)
        }
    };
    let in_memory = url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| DbInitError::Config(e.to_string()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // every connection to :memory: is its own database
    let max_connections = if in_memory { 1 } else { 5 };
    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;

    migrate(&pool).await?;
    tracing::info!(url = %url, "sqlite store ready");
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), DbInitError> {
    let version: Option<String> =
        sqlx::query_scalar(r#"SELECT "value" FROM "_db_metadata" WHERE "key" = 'schema_version'"#)
            .fetch_optional(pool)
            .await
            .unwrap_or(None);

    if version.as_deref() == Some(SCHEMA_VERSION) {
        return Ok(());
    }

    for statement in split_sql_statements(EBARS_SCHEMA_SQL) {
        sqlx::query(&statement).execute(pool).await?;
    }

    sqlx::query(
        r#"INSERT OR REPLACE INTO "_db_metadata" ("key", "value") VALUES ('schema_version', ?)"#,
    )
    .bind(SCHEMA_VERSION)
    .execute(pool)
    .await?;

    tracing::debug!(version = SCHEMA_VERSION, "schema applied");
    Ok(())
}

/// Split a script on `;` outside quotes, dropping `--` comment lines and empty statements.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let uncommented: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in uncommented.chars() {
        match (ch, quote) {
            ('\'' | '"', None) => quote = Some(ch),
            (c, Some(open)) if c == open => quote = None,
            (';', None) => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}
