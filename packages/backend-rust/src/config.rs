use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use ebars_algo::EbarsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    Memory,
}

impl StoreKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    /// SQLite URL; `None` means the default file under the platform data dir
    pub database_url: Option<String>,
    pub store: StoreKind,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(3000);

        let host = std::env::var("HOST")
            .ok()
            .and_then(|value| value.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let store = match std::env::var("EBARS_STORE") {
            Ok(value) => StoreKind::parse(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "unknown EBARS_STORE, using sqlite");
                StoreKind::Sqlite
            }),
            Err(_) => StoreKind::Sqlite,
        };

        Self {
            host,
            port,
            log_level,
            database_url,
            store,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ebars_algo::EbarsError),
}

/// Controller settings: defaults, then `EBARS_CONFIG_PATH` (JSON), then single-value env overrides.
pub fn load_ebars_config() -> Result<EbarsConfig, ConfigError> {
    let mut config = match std::env::var("EBARS_CONFIG_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        Some(path) => read_ebars_config(PathBuf::from(path))?,
        None => EbarsConfig::default(),
    };

    if let Some(turns) = env_parse::<u32>("EBARS_MIN_TURNS_BEFORE_CHANGE") {
        config.hysteresis.min_turns_before_change = turns;
    }
    if let Some(buffer) = env_parse::<f64>("EBARS_BOUNDARY_BUFFER") {
        config.hysteresis.boundary_buffer = buffer;
    }
    if let Some(enabled) = env_bool("EBARS_MOMENTUM_ENABLED") {
        config.momentum.enabled = enabled;
    }

    config.validate()?;
    Ok(config)
}

fn read_ebars_config(path: PathBuf) -> Result<EbarsConfig, ConfigError> {
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
}

/// Settings of the `ebars-simulate` runner.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub turns: u32,
    pub seed: u64,
    pub output_dir: PathBuf,
    /// Built-in profile names; empty means all of them
    pub profiles: Vec<String>,
    pub agents_per_profile: usize,
}

impl SimulationSettings {
    pub fn from_env() -> Self {
        let profiles = std::env::var("SIM_PROFILES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            turns: env_parse("SIM_TURNS").unwrap_or(ebars_algo::simulation::DEFAULT_TURNS),
            seed: env_parse("SIM_SEED").unwrap_or(42),
            output_dir: std::env::var("SIM_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./simulation_output")),
            profiles,
            agents_per_profile: env_parse("SIM_AGENTS_PER_PROFILE").unwrap_or(1).max(1),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

pub fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_kind_parse() {
        assert_eq!(StoreKind::parse("Memory"), Some(StoreKind::Memory));
        assert_eq!(StoreKind::parse(" sqlite "), Some(StoreKind::Sqlite));
        assert_eq!(StoreKind::parse("postgres"), None);
    }

    #[test]
    fn test_read_ebars_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ebars.json");
        std::fs::write(&path, r#"{"hysteresis":{"min_turns_before_change":4}}"#).unwrap();
        let config = read_ebars_config(path).unwrap();
        assert_eq!(config.hysteresis.min_turns_before_change, 4);
        assert_eq!(config.hysteresis.boundary_buffer, 2.0);
        assert_eq!(config.initial_score, 50.0);
    }

    #[test]
    fn test_read_ebars_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();
        let err = read_ebars_config(path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
