//! Global configuration
//!
//! Loaded from a JSON file, from environment variables, or built in code.
//! Environment variables win over file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Per-queue concurrency override from global configuration
///
/// A global override for a queue name wins over any DAG-level
/// `maxActiveRuns` for runs admitted to that queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOverride {
    pub name: String,
    pub max_concurrency: u32,
}

/// Process-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Root directory for run history and logs
    pub data_dir: PathBuf,

    /// Directory scanned for workflow definitions
    pub dags_dir: PathBuf,

    /// Control-plane bind address
    pub host: String,
    pub port: u16,

    /// Internal coordinator listener bind address
    pub coordinator_host: String,
    pub coordinator_port: u16,

    /// Coordinator endpoints workers fail over across, in order
    pub coordinator_endpoints: Vec<String>,

    /// Scheduler timezone name; cron expressions without `CRON_TZ=` use
    /// this, falling back to local time when unset
    pub scheduler_timezone: Option<String>,

    /// Global queue overrides
    pub queues: Vec<QueueOverride>,

    /// Server-side idle timeout for coordinator polls, in seconds
    pub poll_timeout_sec: u64,

    /// Cap on captured step output, in bytes
    pub output_capture_limit: usize,

    /// Default history retention when a DAG does not set its own
    pub hist_retention_days: u32,

    /// Worker identity and labels (worker processes only)
    pub worker_id: Option<String>,
    pub worker_labels: std::collections::BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            dags_dir: PathBuf::from("dags"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            coordinator_host: "127.0.0.1".to_string(),
            coordinator_port: 8090,
            coordinator_endpoints: vec!["http://127.0.0.1:8090".to_string()],
            scheduler_timezone: None,
            queues: Vec::new(),
            poll_timeout_sec: 30,
            output_capture_limit: 64 * 1024,
            hist_retention_days: 30,
            worker_id: None,
            worker_labels: std::collections::BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.apply_env()
    }

    /// Build from defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = std::env::var("DAGRUN_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DAGRUN_DAGS_DIR") {
            self.dags_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DAGRUN_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("DAGRUN_PORT") {
            self.port = parse_env("DAGRUN_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("DAGRUN_COORDINATOR_PORT") {
            self.coordinator_port = parse_env("DAGRUN_COORDINATOR_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("DAGRUN_COORDINATOR_ENDPOINTS") {
            self.coordinator_endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("DAGRUN_SCHEDULER_TZ") {
            self.scheduler_timezone = Some(v);
        }
        if let Ok(v) = std::env::var("DAGRUN_POLL_TIMEOUT_SEC") {
            self.poll_timeout_sec = parse_env("DAGRUN_POLL_TIMEOUT_SEC", &v)?;
        }
        if let Ok(v) = std::env::var("DAGRUN_WORKER_ID") {
            self.worker_id = Some(v);
        }
        Ok(self)
    }

    /// Coordinator idle poll timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_sec)
    }

    /// Global concurrency override for a queue name, if configured.
    pub fn queue_override(&self, name: &str) -> Option<u32> {
        self.queues
            .iter()
            .find(|q| q.name == name)
            .map(|q| q.max_concurrency)
    }

    /// Control-plane bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Coordinator bind address.
    pub fn coordinator_bind_addr(&self) -> String {
        format!("{}:{}", self.coordinator_host, self.coordinator_port)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
