//! Relay configuration.

use crate::{CoreError, CoreResult, LogFormat, Paths};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Relay configuration loaded from `config.json` and the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (RUST_LOG syntax, overridden by RUST_LOG itself)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// SQLite database holding the outbox; `~/.outbox-relay/outbox.sqlite` when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub broker: BrokerSettings,
}

/// Relay loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub lock_name: String,
    /// Fixed owner id; a hostname-derived id is generated when unset
    pub owner_id: Option<String>,
    pub lease_duration_ms: u64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive store failures before the relay reports itself degraded
    pub persistence_failure_threshold: u32,
    /// Value of the `x-source` header, if any
    pub event_source: Option<String>,
    pub poison_policy: PoisonPolicySetting,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            lock_name: "outbox-relay".to_string(),
            owner_id: None,
            lease_duration_ms: 30_000,
            batch_size: 100,
            poll_interval_ms: 1_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            persistence_failure_threshold: 5,
            event_source: None,
            poison_policy: PoisonPolicySetting::Block,
        }
    }
}

/// What to do with a record that can never be published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoisonPolicySetting {
    /// Stall at the record and keep retrying.
    #[default]
    Block,
    /// Forward the record to `topic` and move on.
    DeadLetter { topic: String },
}

/// Kafka REST proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub rest_proxy_url: String,
    pub cluster_id: String,
    pub default_partitions: u32,
    pub topic_partitions: HashMap<String, u32>,
    pub auth_token: Option<String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            rest_proxy_url: "http://localhost:8082".to_string(),
            cluster_id: String::new(),
            default_partitions: 1,
            topic_partitions: HashMap::new(),
            auth_token: None,
            basic_auth_user: None,
            basic_auth_password: None,
            request_timeout_secs: 30,
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            database_path: None,
            relay: RelaySettings::default(),
            broker: BrokerSettings::default(),
        }
    }
}

impl Config {
    /// Load from the default config file, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        Self::load_with_env(&paths.config_file())
    }

    /// Load from `path` (defaults when it does not exist), then apply
    /// environment overrides.
    pub fn load_with_env(path: &Path) -> CoreResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the default config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Apply `OUTBOX_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("OUTBOX_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(path) = lookup("OUTBOX_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("OUTBOX_BROKER_URL") {
            self.broker.rest_proxy_url = url;
        }
        if let Some(token) = lookup("OUTBOX_BROKER_TOKEN") {
            self.broker.auth_token = Some(token);
        }
        if let Some(owner) = lookup("OUTBOX_OWNER_ID") {
            self.relay.owner_id = Some(owner);
        }
    }

    /// Database file to open.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    pub fn validate(&self) -> CoreResult<()> {
        let relay = &self.relay;
        if relay.lock_name.trim().is_empty() {
            return Err(CoreError::Config("relay.lock_name must not be empty".to_string()));
        }
        if relay.batch_size == 0 {
            return Err(CoreError::Config("relay.batch_size must be positive".to_string()));
        }
        if relay.lease_duration_ms == 0 {
            return Err(CoreError::Config(
                "relay.lease_duration_ms must be positive".to_string(),
            ));
        }
        if relay.poll_interval_ms >= relay.lease_duration_ms {
            return Err(CoreError::Config(format!(
                "relay.poll_interval_ms ({}) must be shorter than relay.lease_duration_ms ({})",
                relay.poll_interval_ms, relay.lease_duration_ms
            )));
        }
        if relay.backoff_base_ms > relay.backoff_max_ms {
            return Err(CoreError::Config(format!(
                "relay.backoff_base_ms ({}) exceeds relay.backoff_max_ms ({})",
                relay.backoff_base_ms, relay.backoff_max_ms
            )));
        }
        if relay.persistence_failure_threshold == 0 {
            return Err(CoreError::Config(
                "relay.persistence_failure_threshold must be positive".to_string(),
            ));
        }
        if let PoisonPolicySetting::DeadLetter { topic } = &relay.poison_policy {
            if topic.trim().is_empty() {
                return Err(CoreError::Config(
                    "dead letter topic must not be empty".to_string(),
                ));
            }
        }

        url::Url::parse(&self.broker.rest_proxy_url)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.relay.lock_name, "outbox-relay");
        assert_eq!(config.relay.lease_duration_ms, 30_000);
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.relay.poison_policy, PoisonPolicySetting::Block);
        assert_eq!(config.broker.rest_proxy_url, "http://localhost:8082");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "log_format": "json",
                "relay": { "batch_size": 25, "poison_policy": { "kind": "dead_letter", "topic": "orders.dlq" } },
                "broker": { "cluster_id": "lkc-1", "topic_partitions": { "orders": 6 } }
            }"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.relay.batch_size, 25);
        assert_eq!(config.relay.lease_duration_ms, 30_000);
        assert_eq!(
            config.relay.poison_policy,
            PoisonPolicySetting::DeadLetter {
                topic: "orders.dlq".to_string()
            }
        );
        assert_eq!(config.broker.cluster_id, "lkc-1");
        assert_eq!(config.broker.topic_partitions.get("orders"), Some(&6));
        assert_eq!(config.broker.request_timeout_secs, 30);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_with_env(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.relay, RelaySettings::default());
    }

    #[test]
    fn test_load_reads_default_config_file() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        assert_eq!(Config::load(&paths).unwrap().relay.batch_size, 100);

        let mut config = Config::default();
        config.relay.batch_size = 7;
        config.save(&paths).unwrap();
        assert_eq!(Config::load(&paths).unwrap().relay.batch_size, 7);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Config::load_from_file(&path), Err(CoreError::Json(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().join("relay"));

        let mut config = Config::default();
        config.relay.owner_id = Some("relay-1".to_string());
        config.broker.auth_token = Some("secret".to_string());
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("OUTBOX_LOG_LEVEL", "debug"),
            ("OUTBOX_DATABASE_PATH", "/var/lib/app/app.db"),
            ("OUTBOX_BROKER_URL", "https://proxy.internal:8082"),
            ("OUTBOX_BROKER_TOKEN", "t0ken"),
            ("OUTBOX_OWNER_ID", "pod-7"),
        ]));

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/app/app.db")));
        assert_eq!(config.broker.rest_proxy_url, "https://proxy.internal:8082");
        assert_eq!(config.broker.auth_token.as_deref(), Some("t0ken"));
        assert_eq!(config.relay.owner_id.as_deref(), Some("pod-7"));
    }

    #[test]
    fn test_env_leaves_unset_fields_alone() {
        let mut config = Config::default();
        config.apply_env(env(&[]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_database_path_default() {
        let paths = Paths::with_base_dir(PathBuf::from("/tmp/relay"));
        let mut config = Config::default();
        assert_eq!(config.database_path(&paths), PathBuf::from("/tmp/relay/outbox.sqlite"));

        config.database_path = Some(PathBuf::from("/data/app.db"));
        assert_eq!(config.database_path(&paths), PathBuf::from("/data/app.db"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let cases: Vec<Box<dyn Fn(&mut Config)>> = vec![
            Box::new(|c: &mut Config| c.relay.batch_size = 0),
            Box::new(|c: &mut Config| c.relay.lease_duration_ms = 0),
            Box::new(|c: &mut Config| c.relay.poll_interval_ms = c.relay.lease_duration_ms),
            Box::new(|c: &mut Config| c.relay.backoff_base_ms = c.relay.backoff_max_ms + 1),
            Box::new(|c: &mut Config| c.relay.lock_name = " ".to_string()),
            Box::new(|c: &mut Config| c.relay.persistence_failure_threshold = 0),
            Box::new(|c: &mut Config| {
                c.relay.poison_policy = PoisonPolicySetting::DeadLetter {
                    topic: String::new(),
                }
            }),
        ];

        for mutate in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(CoreError::Config(_))));
        }
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = Config::default();
        config.broker.rest_proxy_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(CoreError::InvalidUrl(_))));
    }
}
