use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::{Config, MergeBackendKind};

/// Environment variable prefix; `__` separates nested keys.
pub const ENV_PREFIX: &str = "TASKMESH_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: [&str; 2] = ["json", "pretty"];
const VALID_ROTATIONS: [&str; 3] = ["daily", "hourly", "never"];

/// Configuration error types
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid server port: 0")]
    InvalidPort,

    #[error("Priority weights must be non-negative and sum to 1.0, got sum {0}")]
    InvalidWeights(f64),

    #[error("Heartbeat timeout ({timeout_secs}s) must exceed the heartbeat interval ({interval_secs}s)")]
    InvalidHeartbeat { interval_secs: u64, timeout_secs: u64 },

    #[error("{0} cannot be 0")]
    ZeroValue(&'static str),

    #[error("Invalid backoff_factor: {0}. Must be at least 1.0")]
    InvalidBackoffFactor(f64),

    #[error("Invalid backoff configuration: base_delay_ms ({0}) must not exceed max_delay_ms ({1})")]
    InvalidBackoff(u64, u64),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
    explicit: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("."),
            explicit: None,
        }
    }

    /// Directory containing `.taskmesh/`.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Extra file merged above the project files, typically from `--config`.
    #[must_use]
    pub fn with_file(mut self, path: Option<impl Into<PathBuf>>) -> Self {
        self.explicit = path.map(Into::into);
        self
    }

    /// Merged but unvalidated figment, useful for `config show`.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .taskmesh/config.yaml
    /// 3. .taskmesh/local.yaml
    /// 4. The explicit file, if any
    /// 5. Environment variables (TASKMESH_* prefix)
    pub fn figment(&self) -> Figment {
        let dir = self.root.join(".taskmesh");
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")));
        if let Some(path) = &self.explicit {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate.
    pub fn load(&self) -> Result<Config> {
        if let Some(path) = &self.explicit {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
        }
        let config: Config = self
            .figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a single file over the defaults, ignoring project files and env.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let logging = &config.logging;
        if !VALID_LOG_LEVELS.contains(&logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(logging.level.clone()));
        }
        if !VALID_LOG_FORMATS.contains(&logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(logging.format.clone()));
        }
        if !VALID_ROTATIONS.contains(&logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(logging.rotation.clone()));
        }

        Self::validate_priority(config)?;

        let heartbeat = &config.heartbeat;
        if heartbeat.interval_secs == 0 {
            return Err(ConfigError::ZeroValue("heartbeat.interval_secs"));
        }
        if heartbeat.timeout_secs <= heartbeat.interval_secs {
            return Err(ConfigError::InvalidHeartbeat {
                interval_secs: heartbeat.interval_secs,
                timeout_secs: heartbeat.timeout_secs,
            });
        }
        if heartbeat.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("heartbeat.sweep_interval_secs"));
        }
        if heartbeat.escalation_threshold == 0 {
            return Err(ConfigError::ZeroValue("heartbeat.escalation_threshold"));
        }

        let breaker = &config.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::ZeroValue("circuit_breaker.failure_threshold"));
        }
        if breaker.success_threshold == 0 {
            return Err(ConfigError::ZeroValue("circuit_breaker.success_threshold"));
        }
        if breaker.half_open_max_probes == 0 {
            return Err(ConfigError::ZeroValue("circuit_breaker.half_open_max_probes"));
        }

        let retry = &config.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::ZeroValue("retry.max_attempts"));
        }
        if retry.backoff_factor < 1.0 || !retry.backoff_factor.is_finite() {
            return Err(ConfigError::InvalidBackoffFactor(retry.backoff_factor));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(ConfigError::InvalidBackoff(retry.base_delay_ms, retry.max_delay_ms));
        }

        if config.merge.lock_wait_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("merge.lock_wait_timeout_secs"));
        }
        if config.merge.backend == MergeBackendKind::Git
            && config.merge.repo_path.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::ValidationFailed(
                "merge.repo_path is required for the git backend".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_priority(config: &Config) -> Result<(), ConfigError> {
        let priority = &config.priority;
        let w = &priority.weights;
        let sum = w.sum();
        let negative = [w.priority, w.age, w.deadline, w.dependents, w.retry]
            .iter()
            .any(|v| *v < 0.0);
        if negative || (sum - 1.0).abs() > 1e-3 {
            return Err(ConfigError::InvalidWeights(sum));
        }
        if priority.age_ceiling_secs == 0 {
            return Err(ConfigError::ZeroValue("priority.age_ceiling_secs"));
        }
        if priority.sla_urgency_window_secs == 0 {
            return Err(ConfigError::ZeroValue("priority.sla_urgency_window_secs"));
        }
        if priority.blocker_ceiling == 0 {
            return Err(ConfigError::ZeroValue("priority.blocker_ceiling"));
        }
        if priority.sla_boost_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "priority.sla_boost_multiplier must be at least 1.0, got {}",
                priority.sla_boost_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&priority.starvation_floor) {
            return Err(ConfigError::ValidationFailed(format!(
                "priority.starvation_floor must be within [0, 1], got {}",
                priority.starvation_floor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StorageBackend;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8420);
        assert_eq!(config.database.path, ".taskmesh/taskmesh.db");
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.heartbeat.timeout_secs, 90);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
server:
  port: 9999
database:
  backend: memory
  max_connections: 2
logging:
  level: debug
  format: pretty
heartbeat:
  interval_secs: 5
  timeout_secs: 15
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.heartbeat.timeout_secs, 15);

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.priority.weights.age = 0.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_validate_negative_weight() {
        let mut config = Config::default();
        config.priority.weights.priority = 0.55;
        config.priority.weights.retry = -0.05;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_validate_timeout_must_exceed_interval() {
        let mut config = Config::default();
        config.heartbeat.timeout_secs = 30;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidHeartbeat {
                interval_secs: 30,
                timeout_secs: 30
            })
        );
    }

    #[test]
    fn test_validate_zero_failure_threshold() {
        let mut config = Config::default();
        config.circuit_breaker.failure_threshold = 0;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ZeroValue("circuit_breaker.failure_threshold"))
        );
    }

    #[test]
    fn test_validate_backoff() {
        let mut config = Config::default();
        config.retry.backoff_factor = 0.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoffFactor(_))
        ));

        let mut config = Config::default();
        config.retry.base_delay_ms = 30_000;
        config.retry.max_delay_ms = 10_000;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(30_000, 10_000))
        );
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.server.port = 0;
        assert_eq!(ConfigLoader::validate(&config), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_git_backend_needs_repo_path() {
        let mut config = Config::default();
        config.merge.backend = MergeBackendKind::Git;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ValidationFailed(_))
        ));
        config.merge.repo_path = Some("/srv/repo".to_string());
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_hierarchical_merging() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join(".taskmesh");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.yaml"),
            "server:\n  port: 9000\nlogging:\n  level: info\n  format: pretty\n",
        )
        .unwrap();
        std::fs::write(dir.join("local.yaml"), "logging:\n  level: debug\n").unwrap();

        let mut explicit = NamedTempFile::new().unwrap();
        writeln!(explicit, "server:\n  port: 9100").unwrap();
        explicit.flush().unwrap();

        let config = temp_env::with_vars_unset(["TASKMESH_SERVER__PORT", "TASKMESH_LOGGING__LEVEL"], || {
            ConfigLoader::new()
                .with_root(root.path())
                .with_file(Some(explicit.path()))
                .load()
                .unwrap()
        });

        assert_eq!(config.server.port, 9100, "Explicit file should win");
        assert_eq!(config.logging.level, "debug", "local.yaml should override config.yaml");
        assert_eq!(config.logging.format, "pretty", "Base value should persist when not overridden");
    }

    #[test]
    fn test_env_override() {
        let root = TempDir::new().unwrap();
        let config = temp_env::with_vars(
            [
                ("TASKMESH_HEARTBEAT__TIMEOUT_SECS", Some("120")),
                ("TASKMESH_LOGGING__LEVEL", Some("warn")),
            ],
            || ConfigLoader::new().with_root(root.path()).load().unwrap(),
        );
        assert_eq!(config.heartbeat.timeout_secs, 120);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_env_override_is_validated() {
        let root = TempDir::new().unwrap();
        let result = temp_env::with_var("TASKMESH_HEARTBEAT__TIMEOUT_SECS", Some("10"), || {
            ConfigLoader::new().with_root(root.path()).load()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let root = TempDir::new().unwrap();
        let result = ConfigLoader::new()
            .with_root(root.path())
            .with_file(Some(root.path().join("nope.yaml")))
            .load();
        assert!(result.unwrap_err().to_string().contains("not found"));
    }
}
