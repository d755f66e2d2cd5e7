use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persist::bridge::DEFAULT_KEY_PREFIX;

/// Placeholder substituted with the sync job id.
pub const JOB_ID_PLACEHOLDER: &str = "{job_id}";
/// Placeholder substituted with the collection readable id.
pub const COLLECTION_PLACEHOLDER: &str = "{collection}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub version: String,
    pub api_base_url: String,
    #[serde(default = "default_sync_stream_path")]
    pub sync_stream_path: String,
    #[serde(default = "default_query_stream_path")]
    pub query_stream_path: String,
    #[serde(default = "default_run_path")]
    pub run_path: String,
    /// How long a finished subscription stays readable before removal.
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_sync_stream_path() -> String {
    "/sync/job/{job_id}/subscribe".to_string()
}

fn default_query_stream_path() -> String {
    "/collections/{collection}/search/stream".to_string()
}

fn default_run_path() -> String {
    "/source-connections/{key}/run".to_string()
}

fn default_grace_window_ms() -> u64 {
    2_000
}

fn default_channel_capacity() -> usize {
    256
}

impl StreamConfig {
    /// Config with defaults for everything but the API location.
    pub fn new(api_base_url: &str) -> Self {
        Self {
            version: "1.0".to_string(),
            api_base_url: api_base_url.to_string(),
            sync_stream_path: default_sync_stream_path(),
            query_stream_path: default_query_stream_path(),
            run_path: default_run_path(),
            grace_window_ms: default_grace_window_ms(),
            channel_capacity: default_channel_capacity(),
            health: HealthConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    /// URL of the progress stream for `job_id`.
    pub fn sync_stream_url(&self, job_id: &str) -> String {
        self.url_for(&self.sync_stream_path.replace(JOB_ID_PLACEHOLDER, job_id))
    }

    /// URL of the streaming query endpoint for `collection`.
    pub fn query_stream_url(&self, collection: &str) -> String {
        self.url_for(
            &self
                .query_stream_path
                .replace(COLLECTION_PLACEHOLDER, collection),
        )
    }

    /// URL that starts a new run for the subscription `key`.
    pub fn run_url(&self, key: &str) -> String {
        self.url_for(&self.run_path.replace("{key}", key))
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    300
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// SQLite file; `None` uses the default location under the home directory.
    #[serde(default)]
    pub database_path: Option<String>,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let config = StreamConfig::new("https://api.example.com/");
        assert_eq!(
            config.sync_stream_url("job-42"),
            "https://api.example.com/sync/job/job-42/subscribe"
        );
        assert_eq!(
            config.query_stream_url("docs-abc"),
            "https://api.example.com/collections/docs-abc/search/stream"
        );
        assert_eq!(
            config.run_url("src-1"),
            "https://api.example.com/source-connections/src-1/run"
        );
    }

    #[test]
    fn test_defaults() {
        let config = StreamConfig::new("http://localhost");
        assert_eq!(config.grace_window(), Duration::from_secs(2));
        assert_eq!(config.health.interval(), Duration::from_secs(30));
        assert_eq!(config.health.stale_after(), Duration::from_secs(300));
        assert_eq!(config.persistence.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.logging.level, "info");
    }
}
