//! Circuit breaker pattern for failure detection and recovery.
//!
//! Each scope (a merge base or a named external operation) has its own
//! breaker. A breaker opens after `failure_threshold` consecutive failures,
//! rejects calls until the cooldown elapses, then lets a bounded number of
//! probe calls through. Enough probe successes close it; any probe failure
//! reopens it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::models::{CircuitBreakerSettings, SchedulerEvent};
use crate::services::event_bus::EventBus;

/// Configuration for circuit breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub cooldown: Duration,
    /// Consecutive probe successes in half-open state to close the circuit.
    pub success_threshold: u32,
    /// Probe calls allowed in flight while half-open.
    pub half_open_max_probes: u32,
    /// Whether to enable circuit breakers.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_settings(&CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerConfig {
    #[allow(clippy::cast_possible_wrap)]
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::seconds(settings.cooldown_secs as i64),
            success_threshold: settings.success_threshold.max(1),
            half_open_max_probes: settings.half_open_max_probes.max(1),
            enabled: settings.enabled,
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are blocked.
    Open,
    /// Circuit is testing if the dependency has recovered.
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Scope of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitScope {
    /// Merges into one base ref.
    Merge(String),
    /// A named external call, such as a worker tool invocation.
    Operation(String),
}

impl CircuitScope {
    pub fn merge(base_ref: impl Into<String>) -> Self {
        Self::Merge(base_ref.into())
    }

    pub fn operation(name: impl Into<String>) -> Self {
        Self::Operation(name.into())
    }
}

impl fmt::Display for CircuitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(base) => write!(f, "merge:{base}"),
            Self::Operation(name) => write!(f, "op:{name}"),
        }
    }
}

/// Individual circuit breaker state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub scope: CircuitScope,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Successful probes since entering half-open.
    pub half_open_successes: u32,
    /// Probes admitted and not yet reported.
    pub probes_in_flight: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    /// Total times circuit opened.
    pub open_count: u32,
    pub last_error: Option<String>,
}

impl CircuitBreaker {
    pub fn new(scope: CircuitScope, now: DateTime<Utc>) -> Self {
        Self {
            scope,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            probes_in_flight: 0,
            opened_at: None,
            state_changed_at: now,
            open_count: 0,
            last_error: None,
        }
    }

    /// Returns the new state if this failure changed it.
    fn record_failure(
        &mut self,
        error: String,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Option<CircuitState> {
        self.last_error = Some(error);
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold {
                    self.open(now);
                    return Some(CircuitState::Open);
                }
                None
            }
            // Any probe failure reopens the circuit
            CircuitState::HalfOpen => {
                self.open(now);
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Returns the new state if this success changed it.
    fn record_success(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                self.half_open_successes += 1;
                if self.half_open_successes >= config.success_threshold {
                    self.close(now);
                    return Some(CircuitState::Closed);
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.state_changed_at = now;
        self.half_open_successes = 0;
        self.probes_in_flight = 0;
        self.open_count += 1;
    }

    fn close(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.state_changed_at = now;
        self.half_open_successes = 0;
        self.probes_in_flight = 0;
        self.consecutive_failures = 0;
    }

    fn half_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::HalfOpen;
        self.state_changed_at = now;
        self.half_open_successes = 0;
        self.probes_in_flight = 0;
    }

    fn retry_after(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> DateTime<Utc> {
        self.opened_at.map_or(now, |opened| opened + config.cooldown)
    }

    fn admit(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> CircuitCheckResult {
        if self.state == CircuitState::Open {
            if now < self.retry_after(config, now) {
                return CircuitCheckResult::Blocked {
                    scope: self.scope.clone(),
                    retry_after: self.retry_after(config, now),
                };
            }
            self.half_open(now);
        }
        match self.state {
            CircuitState::Closed => CircuitCheckResult::Allowed,
            CircuitState::HalfOpen if self.probes_in_flight < config.half_open_max_probes => {
                self.probes_in_flight += 1;
                CircuitCheckResult::Probe {
                    scope: self.scope.clone(),
                }
            }
            _ => CircuitCheckResult::Blocked {
                scope: self.scope.clone(),
                retry_after: now,
            },
        }
    }
}

/// Result of a circuit breaker check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitCheckResult {
    /// Request is allowed.
    Allowed,
    /// Request is admitted as a half-open probe.
    Probe { scope: CircuitScope },
    /// Request is blocked by an open circuit.
    Blocked {
        scope: CircuitScope,
        retry_after: DateTime<Utc>,
    },
}

impl CircuitCheckResult {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed | Self::Probe { .. })
    }

    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub scope: String,
    pub state: String,
    pub consecutive_failures: u32,
    pub open_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Service for managing circuit breakers.
pub struct CircuitBreakerService {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<CircuitScope, CircuitBreaker>>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreakerService {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish `CircuitOpened` / `CircuitClosed` on state changes.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn check(&self, scope: CircuitScope) -> CircuitCheckResult {
        self.check_at(scope, Utc::now()).await
    }

    /// Check whether a call may proceed. A `Probe` result reserves a probe slot
    /// that the caller must report back through `record_success` or `record_failure`.
    pub async fn check_at(&self, scope: CircuitScope, now: DateTime<Utc>) -> CircuitCheckResult {
        if !self.config.enabled {
            return CircuitCheckResult::Allowed;
        }

        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(scope.clone())
            .or_insert_with(|| CircuitBreaker::new(scope, now));
        circuit.admit(&self.config, now)
    }

    pub async fn record_failure(&self, scope: CircuitScope, error: impl Into<String>) {
        self.record_failure_at(scope, error, Utc::now()).await;
    }

    pub async fn record_failure_at(&self, scope: CircuitScope, error: impl Into<String>, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(scope.clone())
            .or_insert_with(|| CircuitBreaker::new(scope.clone(), now));

        if circuit.record_failure(error.into(), &self.config, now) == Some(CircuitState::Open) {
            warn!(
                scope = %scope,
                open_count = circuit.open_count,
                last_error = circuit.last_error.as_deref().unwrap_or_default(),
                "circuit opened"
            );
            self.publish(SchedulerEvent::CircuitOpened {
                scope: scope.to_string(),
            });
        }
    }

    pub async fn record_success(&self, scope: CircuitScope) {
        self.record_success_at(scope, Utc::now()).await;
    }

    pub async fn record_success_at(&self, scope: CircuitScope, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(&scope) {
            if circuit.record_success(&self.config, now) == Some(CircuitState::Closed) {
                info!(scope = %scope, "circuit closed");
                self.publish(SchedulerEvent::CircuitClosed {
                    scope: scope.to_string(),
                });
            }
        }
    }

    /// Give back a probe slot without counting the call either way.
    pub async fn release_probe(&self, scope: &CircuitScope) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(scope) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
            }
        }
    }

    fn publish(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    pub async fn get_state(&self, scope: &CircuitScope) -> Option<CircuitState> {
        let circuits = self.circuits.read().await;
        circuits.get(scope).map(|c| c.state)
    }

    pub async fn stats(&self) -> Vec<CircuitStats> {
        let circuits = self.circuits.read().await;
        let mut stats: Vec<CircuitStats> = circuits
            .values()
            .map(|c| CircuitStats {
                scope: c.scope.to_string(),
                state: c.state.as_str().to_string(),
                consecutive_failures: c.consecutive_failures,
                open_count: c.open_count,
                opened_at: c.opened_at,
                state_changed_at: c.state_changed_at,
                last_error: c.last_error.clone(),
            })
            .collect();
        stats.sort_by(|a, b| a.scope.cmp(&b.scope));
        stats
    }
}
