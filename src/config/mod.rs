use std::env;
use std::path::PathBuf;

use crate::error::{AppError, AppResult};

/// Default location of the SQLite database file.
pub const DEFAULT_SQLITE_PATH: &str = "./data/unified-thinking.db";
/// Default SQLite busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
/// Default connection pool ceiling. SQLite gains nothing from more writers.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local store, lost on exit.
    Memory,
    /// SQLite file with an in-memory write-through cache.
    Sqlite,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            _ => Err(format!("Unknown storage type: {}", s)),
        }
    }
}

/// Storage configuration consumed by the backend factory
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub sqlite_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
    /// Backend to construct when the primary fails. Ignored when equal to
    /// `backend`.
    pub fallback: Option<BackendKind>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            sqlite_path: PathBuf::from(DEFAULT_SQLITE_PATH),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            fallback: Some(BackendKind::Memory),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl StorageConfig {
    /// SQLite configuration at `path` with fail-fast semantics.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            sqlite_path: path.into(),
            fallback: None,
            ..Self::default()
        }
    }

    /// Set the fallback backend
    pub fn with_fallback(mut self, fallback: BackendKind) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Set the busy timeout
    pub fn with_busy_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.busy_timeout_ms = timeout_ms;
        self
    }

    /// Resolve storage settings through a key lookup.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match non_empty("STORAGE_TYPE") {
            Some(raw) => raw
                .parse::<BackendKind>()
                .map_err(|message| AppError::Config { message })?,
            None => defaults.backend,
        };

        let fallback = match non_empty("STORAGE_FALLBACK") {
            Some(raw) if raw.trim().eq_ignore_ascii_case("none") => None,
            Some(raw) => Some(
                raw.parse::<BackendKind>()
                    .map_err(|message| AppError::Config { message })?,
            ),
            None => defaults.fallback,
        };

        Ok(Self {
            backend,
            sqlite_path: non_empty("SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sqlite_path),
            busy_timeout_ms: non_empty("SQLITE_TIMEOUT")
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.busy_timeout_ms),
            max_connections: non_empty("SQLITE_MAX_CONNECTIONS")
                .and_then(|s| s.trim().parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            fallback,
        })
    }

    /// Create the directory holding the SQLite file.
    ///
    /// The store itself never creates directories; callers that want the
    /// default `./data` layout run this first.
    pub fn prepare_data_dir(&self) -> std::io::Result<()> {
        if self.backend != BackendKind::Sqlite {
            return Ok(());
        }
        match self.sqlite_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

impl LoggingConfig {
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            format: match lookup("LOG_FORMAT")
                .unwrap_or_else(|| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> AppResult<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            storage: StorageConfig::from_lookup(&lookup)?,
            logging: LoggingConfig::from_lookup(&lookup),
        })
    }
}
