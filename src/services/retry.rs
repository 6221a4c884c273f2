//! Retry policy, idempotency cache and the resilient executor that combines
//! them with the circuit breaker.
//!
//! Wrapped calls report an explicit [`CallOutcome`] instead of a bare
//! `Result`, so the executor knows which failures are worth retrying and
//! which should count against the breaker.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::errors::DomainError;
use crate::domain::models::RetryConfig;
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitCheckResult, CircuitScope};

/// Outcome of one attempt of a wrapped call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T, E> {
    Ok(T),
    /// Transient failure: retry with backoff, counts against the breaker
    Retryable(E),
    /// Permanent failure: surface immediately
    Fatal(E),
}

impl<T> CallOutcome<T, DomainError> {
    /// Classify a domain result by [`DomainError::is_transient`].
    pub fn from_result(result: Result<T, DomainError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) if e.is_transient() => Self::Retryable(e),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// Why a resilient call gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Circuit breaker open for {scope}, retry after {retry_after}")]
    CircuitOpen {
        scope: CircuitScope,
        retry_after: DateTime<Utc>,
    },
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Fatal(E),
}

impl From<RetryError<DomainError>> for DomainError {
    fn from(err: RetryError<DomainError>) -> Self {
        match err {
            RetryError::CircuitOpen { scope, retry_after } => Self::CircuitOpen {
                scope: scope.to_string(),
                retry_after,
            },
            RetryError::Exhausted { last, .. } | RetryError::Fatal(last) => last,
        }
    }
}

/// Exponential backoff: `min(base * factor^attempt + jitter, max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Backoff before retry number `attempt` (0-based) without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_secs_f64() * 1000.0 * self.backoff_factor.powi(exp);
        let capped = millis.min(self.max_delay.as_secs_f64() * 1000.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped as u64)
    }

    /// Backoff before retry number `attempt` with random jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (self.base_delay_for(attempt) + jitter).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CallOutcome<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                CallOutcome::Ok(value) => return Ok(value),
                CallOutcome::Fatal(e) => return Err(RetryError::Fatal(e)),
                CallOutcome::Retryable(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, error = %e, "retries exhausted");
                        return Err(RetryError::Exhausted { attempts: attempt, last: e });
                    }
                    let backoff = self.delay_for(attempt - 1);
                    debug!(attempt, error = %e, ?backoff, "transient failure, retrying");
                    sleep(backoff).await;
                }
            }
        }
    }
}

struct CacheEntry {
    value: serde_json::Value,
    stored_at: Instant,
}

/// Results of side-effecting calls keyed by idempotency key.
///
/// A key is served from the cache until the TTL passes. Holding the key lock
/// while executing keeps two concurrent retries from both applying.
pub struct IdempotencyCache {
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        {
            let entry = self.entries.get(key)?;
            if entry.stored_at.elapsed() < self.ttl {
                return serde_json::from_value(entry.value.clone()).ok();
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DomainError> {
        let value = serde_json::to_value(value)?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Serialize work on one key.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop expired entries and key locks nobody holds or waits on.
    /// Returns how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        // Holders and waiters each keep a clone; the shard lock blocks new ones
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.entries.len()
    }

    /// Number of per-key locks currently tracked.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Retry policy + circuit breaker + idempotency cache around external calls.
pub struct ResilientExecutor {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreakerService>,
    cache: IdempotencyCache,
}

impl ResilientExecutor {
    pub fn new(config: &RetryConfig, breaker: Arc<CircuitBreakerService>) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            breaker,
            cache: IdempotencyCache::new(Duration::from_secs(config.idempotency_ttl_secs)),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn breaker(&self) -> &Arc<CircuitBreakerService> {
        &self.breaker
    }

    pub const fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    /// Execute `operation` under `scope`'s breaker with retries.
    ///
    /// With an idempotency key, a result already produced under that key is
    /// returned without calling `operation` again. Only `Retryable` outcomes
    /// count as breaker failures.
    pub async fn execute<F, Fut, T, E>(
        &self,
        scope: CircuitScope,
        idempotency_key: Option<&str>,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CallOutcome<T, E>>,
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
    {
        let _guard = match idempotency_key {
            Some(key) => {
                let guard = self.cache.lock(key).await;
                if let Some(cached) = self.cache.get::<T>(key) {
                    debug!(key, scope = %scope, "idempotent replay served from cache");
                    return Ok(cached);
                }
                Some(guard)
            }
            None => None,
        };

        let mut attempt = 0;
        loop {
            if let CircuitCheckResult::Blocked { scope, retry_after } = self.breaker.check(scope.clone()).await {
                return Err(RetryError::CircuitOpen { scope, retry_after });
            }

            match operation().await {
                CallOutcome::Ok(value) => {
                    self.breaker.record_success(scope.clone()).await;
                    if let Some(key) = idempotency_key {
                        if let Err(e) = self.cache.put(key, &value) {
                            warn!(key, error = %e, "failed to cache idempotent result");
                        }
                    }
                    return Ok(value);
                }
                CallOutcome::Fatal(e) => {
                    self.breaker.release_probe(&scope).await;
                    return Err(RetryError::Fatal(e));
                }
                CallOutcome::Retryable(e) => {
                    self.breaker.record_failure(scope.clone(), e.to_string()).await;
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        warn!(scope = %scope, attempts = attempt, error = %e, "retries exhausted");
                        return Err(RetryError::Exhausted { attempts: attempt, last: e });
                    }
                    let backoff = self.policy.delay_for(attempt - 1);
                    debug!(scope = %scope, attempt, error = %e, ?backoff, "transient failure, retrying");
                    sleep(backoff).await;
                }
            }
        }
    }
}

const PERMANENT_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "authentication failed",
    "authorization failed",
    "syntax error",
    "invalid argument",
    "not found",
    "does not exist",
    "already exists",
    "duplicate key",
    "constraint violation",
    "immutable",
    "read-only",
    "quota exceeded",
    "rate limit exceeded",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "timeout",
    "network",
    "temporary",
    "unavailable",
    "retryable",
    "transient",
    "intermittent",
];

/// Classify a free-text failure reason reported by a worker.
///
/// Permanent markers win over transient ones. Unrecognised or empty text is
/// treated as retryable.
pub fn is_retryable_message(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    true
}
