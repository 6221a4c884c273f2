use serde::{Deserialize, Serialize};

/// Main configuration structure for taskmesh
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Priority scoring weights and normalization ceilings
    #[serde(default)]
    pub priority: PriorityConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub tasks: TaskDefaultsConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Retry policy configuration
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub merge: MergeConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8420
}

const fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".taskmesh/taskmesh.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation for file output: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    #[serde(default = "default_true")]
    pub enable_stdout: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            enable_stdout: true,
        }
    }
}

/// Weights for the priority score. All five must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PriorityWeights {
    #[serde(default = "default_w_priority")]
    pub priority: f64,
    #[serde(default = "default_w_age")]
    pub age: f64,
    #[serde(default = "default_w_deadline")]
    pub deadline: f64,
    #[serde(default = "default_w_dependents")]
    pub dependents: f64,
    /// Subtracted once per prior failed attempt
    #[serde(default = "default_w_retry")]
    pub retry: f64,
}

const fn default_w_priority() -> f64 {
    0.45
}

const fn default_w_age() -> f64 {
    0.20
}

const fn default_w_deadline() -> f64 {
    0.15
}

const fn default_w_dependents() -> f64 {
    0.15
}

const fn default_w_retry() -> f64 {
    0.05
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            priority: default_w_priority(),
            age: default_w_age(),
            deadline: default_w_deadline(),
            dependents: default_w_dependents(),
            retry: default_w_retry(),
        }
    }
}

impl PriorityWeights {
    pub fn sum(&self) -> f64 {
        self.priority + self.age + self.deadline + self.dependents + self.retry
    }
}

/// Priority scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PriorityConfig {
    #[serde(default)]
    pub weights: PriorityWeights,

    /// Age at which the age term saturates
    #[serde(default = "default_age_ceiling_secs")]
    pub age_ceiling_secs: u64,

    /// Slack at which deadline urgency reaches 0.5; also the SLA boost window
    #[serde(default = "default_sla_urgency_window_secs")]
    pub sla_urgency_window_secs: u64,

    /// Dependent count at which the dependents term saturates
    #[serde(default = "default_blocker_ceiling")]
    pub blocker_ceiling: u32,

    #[serde(default = "default_sla_boost_multiplier")]
    pub sla_boost_multiplier: f64,

    /// Wait after which a task scores at least `starvation_floor`
    #[serde(default = "default_starvation_limit_secs")]
    pub starvation_limit_secs: u64,

    #[serde(default = "default_starvation_floor")]
    pub starvation_floor: f64,
}

const fn default_age_ceiling_secs() -> u64 {
    3600
}

const fn default_sla_urgency_window_secs() -> u64 {
    900
}

const fn default_blocker_ceiling() -> u32 {
    10
}

const fn default_sla_boost_multiplier() -> f64 {
    1.25
}

const fn default_starvation_limit_secs() -> u64 {
    7200
}

const fn default_starvation_floor() -> f64 {
    0.6
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            age_ceiling_secs: default_age_ceiling_secs(),
            sla_urgency_window_secs: default_sla_urgency_window_secs(),
            blocker_ceiling: default_blocker_ceiling(),
            sla_boost_multiplier: default_sla_boost_multiplier(),
            starvation_limit_secs: default_starvation_limit_secs(),
            starvation_floor: default_starvation_floor(),
        }
    }
}

/// Agent liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Interval agents are expected to heartbeat at
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    /// Lease length; an agent silent for longer is stale
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,

    /// How often the background sweep runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Timeout releases of one task before it is escalated
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_heartbeat_timeout_secs() -> u64 {
    90
}

const fn default_sweep_interval_secs() -> u64 {
    10
}

const fn default_escalation_threshold() -> u32 {
    3
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

impl HeartbeatConfig {
    #[allow(clippy::cast_possible_wrap)]
    pub const fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskDefaultsConfig {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

const fn default_max_retries() -> u32 {
    3
}

impl Default for TaskDefaultsConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Consecutive probe successes that close a half-open circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Concurrent probes allowed while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown_secs() -> u64 {
    60
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_half_open_max_probes() -> u32 {
    1
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
            half_open_max_probes: default_half_open_max_probes(),
            enabled: true,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the uniform random jitter added to each delay
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// How long idempotent results are remembered
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter_ms() -> u64 {
    250
}

const fn default_idempotency_ttl_secs() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeBackendKind {
    #[default]
    Snapshot,
    Git,
}

/// Convergence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MergeConfig {
    /// Bounded wait for the per-base lock before surfacing a conflict
    #[serde(default = "default_lock_wait_timeout_secs")]
    pub lock_wait_timeout_secs: u64,

    #[serde(default)]
    pub backend: MergeBackendKind,

    /// Repository used by the git backend
    #[serde(default)]
    pub repo_path: Option<String>,
}

const fn default_lock_wait_timeout_secs() -> u64 {
    30
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_secs: default_lock_wait_timeout_secs(),
            backend: MergeBackendKind::default(),
            repo_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        let weights = PriorityWeights::default();
        assert!((weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("heartbeat:\n  timeout_secs: 120\n").unwrap();
        assert_eq!(config.heartbeat.timeout_secs, 120);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.database.backend, StorageBackend::Sqlite);
    }
}
