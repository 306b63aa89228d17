//! Connection and feature configuration.
//!
//! ```toml
//! use = "postgresql"
//!
//! [postgresql]
//! host = "localhost"
//! port = 5432
//! user = "app"
//! pw = "secret"
//! db = "app"
//! logs = "errors"
//! ```

use crate::error::{DbsError, DbsResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_IDLE_TIMEOUT_MILLIS: u64 = 10_000;

/// Top-level configuration selecting a database engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Engine name. Only `postgresql` exists.
    #[serde(rename = "use")]
    pub engine: String,
    pub postgresql: PgConfig,
}

/// Diagnostic logging level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Off,
    /// Log failed statements.
    Errors,
}

/// PostgreSQL connection settings and feature flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pw: String,
    pub db: String,
    pub max_pool_size: u32,
    /// How long to wait for a pooled connection. `0` keeps the sqlx acquire
    /// timeout of 30 s; sqlx has no unbounded wait.
    pub connection_timeout_millis: u64,
    /// Idle connections are closed after this long. `0` falls back to 10 s.
    pub idle_timeout_millis: u64,
    /// Decode `int8` columns as JSON numbers instead of decimal strings.
    pub big_int_as_number: bool,
    pub ids_as_big_int: bool,
    pub logs: LogMode,
    /// Include bound parameters in diagnostics.
    pub log_params: bool,
    #[serde(alias = "arrayAsJSON")]
    pub array_as_json: bool,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            pw: String::new(),
            db: "postgres".to_string(),
            max_pool_size: 10,
            connection_timeout_millis: 0,
            idle_timeout_millis: DEFAULT_IDLE_TIMEOUT_MILLIS,
            big_int_as_number: false,
            ids_as_big_int: false,
            logs: LogMode::Off,
            log_params: false,
            array_as_json: false,
        }
    }
}

impl PgConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_millis > 0)
            .then(|| Duration::from_millis(self.connection_timeout_millis))
    }

    pub fn idle_timeout(&self) -> Duration {
        match self.idle_timeout_millis {
            0 => Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MILLIS),
            ms => Duration::from_millis(ms),
        }
    }
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> DbsResult<Self> {
        toml::from_str(content).map_err(|e| DbsError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> DbsResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// `~/.config/pgdbs/config.toml` on Linux, the platform equivalent elsewhere.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pgdbs").join("config.toml"))
    }

    /// The PostgreSQL section, if `use` selects it.
    pub fn postgresql(&self) -> DbsResult<&PgConfig> {
        if self.engine == "postgresql" {
            Ok(&self.postgresql)
        } else {
            Err(DbsError::Config(format!(
                "Config references DB-engine that does not exist: {}",
                self.engine
            )))
        }
    }
}
