use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_RECENT_LIMIT, DEFAULT_SUBSCRIPTION_PREFIX};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub project: String,
    pub topic: String,
    pub endpoint: String,
    /// host:port of a local Pub/Sub emulator; takes precedence over `endpoint`
    pub emulator_host: Option<String>,
    pub access_token: Option<String>,
    pub subscription_prefix: String,
    pub ack_deadline_secs: u32,
    pub delete_subscription_on_shutdown: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_messages: u32,
    pub max_in_flight: usize,
    pub idle_backoff_ms: u64,
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// 0 disables the periodic report
    pub interval_secs: u64,
    pub recent_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project: "test-project".to_string(),
            topic: "scan-topic".to_string(),
            endpoint: "https://pubsub.googleapis.com".to_string(),
            emulator_host: None,
            access_token: None,
            subscription_prefix: DEFAULT_SUBSCRIPTION_PREFIX.to_string(),
            ack_deadline_secs: 30,
            delete_subscription_on_shutdown: true,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_in_flight: 32,
            idle_backoff_ms: 500,
            error_backoff_ms: 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/db/scans.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "[::]:8080".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `DB_PATH` / `PUBSUB_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(path) = lookup("DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(project) = lookup("PUBSUB_PROJECT") {
            self.pubsub.project = project;
        }
        if let Some(topic) = lookup("PUBSUB_TOPIC") {
            self.pubsub.topic = topic;
        }
        if let Some(host) = lookup("PUBSUB_EMULATOR_HOST") {
            self.pubsub.emulator_host = Some(host);
        }
        if let Some(token) = lookup("PUBSUB_ACCESS_TOKEN") {
            self.pubsub.access_token = Some(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.pubsub.project, "test-project");
        assert_eq!(config.pubsub.topic, "scan-topic");
        assert_eq!(config.pubsub.subscription_prefix, "sub");
        assert_eq!(config.store.db_path, PathBuf::from("/db/scans.db"));
        assert_eq!(config.ingest.max_in_flight, 32);
        assert_eq!(config.report.recent_limit, 10);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [pubsub]
            topic = "scans"
            emulator_host = "localhost:8085"

            [ingest]
            max_in_flight = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.pubsub.topic, "scans");
        assert_eq!(config.pubsub.project, "test-project");
        assert_eq!(config.pubsub.emulator_host.as_deref(), Some("localhost:8085"));
        assert_eq!(config.ingest.max_in_flight, 4);
        assert_eq!(config.ingest.max_messages, 100);
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("DB_PATH", "/tmp/scans.db"),
            ("PUBSUB_TOPIC", "other-topic"),
            ("PUBSUB_PROJECT", ""),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.store.db_path, PathBuf::from("/tmp/scans.db"));
        assert_eq!(config.pubsub.topic, "other-topic");
        // Empty values are ignored
        assert_eq!(config.pubsub.project, "test-project");
        assert!(config.pubsub.emulator_host.is_none());
    }
}
