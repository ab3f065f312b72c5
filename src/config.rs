use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Environment variable pointing at a JSON `BusConfig` file.
pub const CONFIG_ENV: &str = "KAFKABUS_CONFIG";

const MAX_NAME_LEN: usize = 249;

/// Bus-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Directory for record logs and offset snapshots. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub retention_check_interval_ms: u64,
    /// Retention applied to topics that do not set their own.
    pub default_retention_ms: u64,
    pub event_channel_capacity: usize,
    pub coordinator_timeout_ms: u64,
    /// Topics the binary declares at startup.
    pub topics: Vec<TopicSpec>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention_check_interval_ms: 60_000,
            default_retention_ms: 7 * 24 * 60 * 60 * 1000,
            event_channel_capacity: 1024,
            coordinator_timeout_ms: 10_000,
            topics: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Loads from the file named by `KAFKABUS_CONFIG`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_json_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn retention_check_interval(&self) -> Duration {
        Duration::from_millis(self.retention_check_interval_ms.max(1))
    }

    pub fn default_retention(&self) -> Duration {
        Duration::from_millis(self.default_retention_ms)
    }

    pub fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_timeout_ms)
    }
}

/// A topic declared through configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    #[serde(flatten)]
    pub config: TopicConfig,
}

/// Per-topic options fixed at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub retention_ms: Option<u64>,
    /// Appends to a partition holding this many records fail with `QueueFull`.
    pub max_partition_records: Option<usize>,
}

impl TopicConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = Some(retention.as_millis() as u64);
        self
    }

    pub fn with_max_partition_records(mut self, max: usize) -> Self {
        self.max_partition_records = Some(max);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Total send attempts, including the first one.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl ProducerConfig {
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub auto_commit: bool,
    pub auto_commit_interval_ms: u64,
    pub max_poll_records: usize,
    /// Prefix for the generated member id.
    pub client_id: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            auto_commit_interval_ms: 5_000,
            max_poll_records: 500,
            client_id: None,
        }
    }
}

impl ConsumerConfig {
    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms.max(1))
    }
}

/// Topic and group names double as file names, so they are restricted to `[A-Za-z0-9._-]`.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> BusResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.default_retention(), Duration::from_secs(7 * 24 * 3600));

        let producer = ProducerConfig::default();
        assert_eq!(producer.attempts(), 3);

        let consumer = ConsumerConfig::default();
        assert!(!consumer.auto_commit);
        assert_eq!(consumer.max_poll_records, 500);
    }

    #[test]
    fn test_partial_json() {
        let config: BusConfig = serde_json::from_str(
            r#"{
                "retention_check_interval_ms": 250,
                "topics": [{"name": "orders", "partitions": 3, "retention_ms": 1000}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.retention_check_interval(), Duration::from_millis(250));
        assert_eq!(config.event_channel_capacity, 1024);
        assert_eq!(config.topics.len(), 1);
        assert_eq!(config.topics[0].config.retention_ms, Some(1000));
        assert_eq!(config.topics[0].config.max_partition_records, None);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let producer = ProducerConfig {
            max_retries: 0,
            retry_delay_ms: 0,
        };
        assert_eq!(producer.attempts(), 1);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("topic", "orders.v1_eu-west").is_ok());
        assert!(validate_name("topic", "").is_err());
        assert!(validate_name("topic", "..").is_err());
        assert!(validate_name("topic", "a/b").is_err());
        assert!(validate_name("group", "g 1").is_err());
    }
}
