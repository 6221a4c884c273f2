//! Background lease sweep.
//!
//! Ticks on its own interval, independent of request handling, and hands
//! each tick to [`WorkerCoordinator::sweep_expired`]. The same tick drops
//! expired idempotency results when an executor is attached. A failed sweep
//! is logged and counted; the loop keeps going.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::services::retry::ResilientExecutor;
use crate::services::worker_coordinator::WorkerCoordinator;

/// Sweep loop settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between two sweeps. The first sweep runs right after spawn.
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct SweeperStats {
    runs: AtomicU64,
    failures: AtomicU64,
    released: AtomicU64,
    purged: AtomicU64,
}

/// Snapshot of sweeper counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperStatus {
    pub running: bool,
    pub runs: u64,
    pub failures: u64,
    pub released: u64,
    /// Idempotency results dropped after their TTL
    pub purged: u64,
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    stats: Arc<SweeperStats>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask the loop to exit after the current tick.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SweeperStatus {
        SweeperStatus {
            running: self.is_running(),
            runs: self.stats.runs.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            purged: self.stats.purged.load(Ordering::Relaxed),
        }
    }

    /// Stop and wait for the loop to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            warn!(error = %e, "heartbeat sweeper task ended abnormally");
        }
    }
}

pub struct HeartbeatSweeper {
    coordinator: Arc<WorkerCoordinator>,
    executor: Option<Arc<ResilientExecutor>>,
    config: SweeperConfig,
}

impl HeartbeatSweeper {
    pub fn new(coordinator: Arc<WorkerCoordinator>, config: SweeperConfig) -> Self {
        Self {
            coordinator,
            executor: None,
            config,
        }
    }

    /// Also purge `executor`'s idempotency cache on every tick.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<ResilientExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Spawn the sweep loop on the current runtime.
    pub fn spawn(self) -> SweeperHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(SweeperStats::default());

        let join = tokio::spawn(self.run_loop(stop_rx, running.clone(), stats.clone()));
        SweeperHandle {
            stop_tx,
            running,
            stats,
            join,
        }
    }

    async fn run_loop(self, mut stop_rx: watch::Receiver<bool>, running: Arc<AtomicBool>, stats: Arc<SweeperStats>) {
        info!(interval_ms = self.config.interval.as_millis(), "heartbeat sweeper started");
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once(&stats).await;
                }
                changed = stop_rx.changed() => {
                    // A dropped handle also stops the loop
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        running.store(false, Ordering::Release);
        info!(runs = stats.runs.load(Ordering::Relaxed), "heartbeat sweeper stopped");
    }

    async fn sweep_once(&self, stats: &SweeperStats) {
        stats.runs.fetch_add(1, Ordering::Relaxed);
        match self.coordinator.sweep_expired(Utc::now()).await {
            Ok(report) => {
                if report.expired > 0 {
                    debug!(
                        expired = report.expired,
                        released = report.released.len(),
                        stale_agents = report.stale_agents.len(),
                        "lease sweep finished"
                    );
                }
                stats.released.fetch_add(report.released.len() as u64, Ordering::Relaxed);
                if report.errors > 0 {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "lease sweep failed");
            }
        }

        if let Some(executor) = &self.executor {
            let purged = executor.cache().purge_expired();
            if purged > 0 {
                debug!(purged, "expired idempotency results dropped");
                stats.purged.fetch_add(purged as u64, Ordering::Relaxed);
            }
        }
    }
}
