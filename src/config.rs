use crate::common::constants::*;
use crate::common::error::{ImporterError, Result};
use crate::pipeline::processing::enrich::EnrichmentSettings;
use crate::pipeline::storage::{InMemoryRecordStore, RecordStore, SqliteRecordStore};
use crate::queue::QueueSettings;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where title records are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Sqlite(PathBuf),
    Memory,
}

impl DatabaseTarget {
    fn parse(raw: Option<String>) -> Self {
        match raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            Some(s) if s.eq_ignore_ascii_case(MEMORY_DATABASE) => DatabaseTarget::Memory,
            Some(s) => DatabaseTarget::Sqlite(PathBuf::from(s)),
            None => DatabaseTarget::Sqlite(PathBuf::from(DEFAULT_DATABASE_PATH)),
        }
    }

    pub fn open(&self) -> Result<Arc<dyn RecordStore>> {
        match self {
            DatabaseTarget::Sqlite(path) => Ok(Arc::new(SqliteRecordStore::open(path)?)),
            DatabaseTarget::Memory => {
                info!("Using in-memory record store; records are lost on exit");
                Ok(Arc::new(InMemoryRecordStore::new()))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub concurrency: usize,
    pub rate_capacity: u32,
    pub rate_window_ms: u64,
    pub timeout_secs: u64,
    pub base_url: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_capacity: 4,
            rate_window_ms: 1000,
            timeout_secs: 15,
            base_url: DEFAULT_OMDB_BASE_URL.to_string(),
        }
    }
}

impl EnrichmentConfig {
    pub fn settings(&self) -> EnrichmentSettings {
        EnrichmentSettings {
            concurrency: self.concurrency,
            rate_capacity: self.rate_capacity,
            rate_window: Duration::from_millis(self.rate_window_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WriterConfig {
    pub batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub lease_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub retain_finished: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            lease_timeout_secs: 300,
            poll_interval_ms: 500,
            retain_finished: 1000,
        }
    }
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            lease_timeout: Duration::from_secs(self.lease_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retain_finished: self.retain_finished,
        }
    }
}

/// Optional TOML tuning file; every section and key may be omitted
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Tuning {
    pub enrichment: EnrichmentConfig,
    pub writer: WriterConfig,
    pub queue: QueueConfig,
}

impl Tuning {
    /// Reads `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No tuning file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| {
            ImporterError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let tuning: Tuning = toml::from_str(&content)?;
        Ok(tuning)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseTarget,
    pub omdb_api_key: Option<String>,
    /// Durable queue broker; `None` selects the in-process queue
    pub queue_db: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub log_dir: PathBuf,
    pub tuning: Tuning,
}

impl AppConfig {
    /// Loads from the process environment (after `.env`) and the tuning file
    pub fn load() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Loads from an arbitrary variable source
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let metrics_port = match non_empty(ENV_METRICS_PORT) {
            Some(raw) => Some(raw.parse::<u16>().map_err(|e| {
                ImporterError::Config(format!("{ENV_METRICS_PORT} must be a port number: {e}"))
            })?),
            None => None,
        };

        let config_path = non_empty(ENV_CONFIG).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Ok(Self {
            database: DatabaseTarget::parse(var(ENV_DATABASE)),
            omdb_api_key: non_empty(ENV_OMDB_API_KEY),
            queue_db: non_empty(ENV_QUEUE_DB).map(PathBuf::from),
            metrics_port,
            log_dir: PathBuf::from(non_empty(ENV_LOG_DIR).unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
            tuning: Tuning::load(Path::new(&config_path))?,
        })
    }

    /// The API key, or a configuration error naming the variable
    pub fn require_api_key(&self) -> Result<&str> {
        self.omdb_api_key
            .as_deref()
            .ok_or_else(|| ImporterError::Config(format!("{ENV_OMDB_API_KEY} is not set")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let cfg = AppConfig::from_vars(vars(&[(ENV_CONFIG, missing.to_str().unwrap())])).unwrap();

        assert_eq!(cfg.database, DatabaseTarget::Sqlite(PathBuf::from(DEFAULT_DATABASE_PATH)));
        assert_eq!(cfg.omdb_api_key, None);
        assert_eq!(cfg.queue_db, None);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.tuning, Tuning::default());
        assert!(cfg.require_api_key().is_err());
    }

    #[test]
    fn memory_target_and_blank_broker() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let cfg = AppConfig::from_vars(vars(&[
            (ENV_CONFIG, missing.to_str().unwrap()),
            (ENV_DATABASE, "memory"),
            (ENV_QUEUE_DB, "  "),
            (ENV_OMDB_API_KEY, "k3y"),
            (ENV_METRICS_PORT, "9000"),
        ]))
        .unwrap();

        assert_eq!(cfg.database, DatabaseTarget::Memory);
        assert_eq!(cfg.queue_db, None);
        assert_eq!(cfg.require_api_key().unwrap(), "k3y");
        assert_eq!(cfg.metrics_port, Some(9000));
    }

    #[test]
    fn partial_tuning_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cinephile.toml");
        fs::write(&path, "[enrichment]\nconcurrency = 2\n\n[queue]\nmax_attempts = 5\n").unwrap();

        let tuning = Tuning::load(&path).unwrap();
        assert_eq!(tuning.enrichment.concurrency, 2);
        assert_eq!(tuning.enrichment.rate_capacity, 4);
        assert_eq!(tuning.queue.max_attempts, 5);
        assert_eq!(tuning.queue.concurrency, 4);
        assert_eq!(tuning.writer.batch_size, 1000);
        assert_eq!(tuning.enrichment.settings().timeout, Duration::from_secs(15));
    }

    #[test]
    fn bad_port_is_a_config_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = AppConfig::from_vars(vars(&[
            (ENV_CONFIG, missing.to_str().unwrap()),
            (ENV_METRICS_PORT, "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ImporterError::Config(_)));
    }
}
