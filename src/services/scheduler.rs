//! Wiring of the scheduler services behind one handle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::adapters::memory::{
    InMemoryAgentRepository, InMemoryMergeUnitRepository, InMemoryTaskRepository, InMemoryTicketRepository,
};
use crate::adapters::merge::{backend_from_config, SnapshotMergeBackend};
use crate::adapters::sqlite::{
    initialize_database, PoolConfig, SqliteAgentRepository, SqliteMergeUnitRepository, SqliteTaskRepository,
    SqliteTicketRepository,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Config, MergeResult, MergeStats, MergeUnit, StorageBackend};
use crate::domain::ports::{AgentRepository, MergeBackend, MergeUnitRepository, TaskRepository, TicketRepository};
use crate::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerService};
use crate::services::convergence_service::ConvergenceService;
use crate::services::dependency_graph::DependencyGraph;
use crate::services::event_bus::EventBus;
use crate::services::heartbeat_sweeper::{HeartbeatSweeper, SweeperConfig, SweeperHandle};
use crate::services::priority_scorer::PriorityScorer;
use crate::services::retry::ResilientExecutor;
use crate::services::task_queue_service::{TaskQueueConfig, TaskQueueService};
use crate::services::ticket_service::TicketService;
use crate::services::worker_coordinator::WorkerCoordinator;

/// The storage the scheduler runs on.
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub tickets: Arc<dyn TicketRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub merge_units: Arc<dyn MergeUnitRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskRepository::new()),
            tickets: Arc::new(InMemoryTicketRepository::new()),
            agents: Arc::new(InMemoryAgentRepository::new()),
            merge_units: Arc::new(InMemoryMergeUnitRepository::new()),
        }
    }

    pub fn sqlite(pool: &SqlitePool) -> Self {
        Self {
            tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
            tickets: Arc::new(SqliteTicketRepository::new(pool.clone())),
            agents: Arc::new(SqliteAgentRepository::new(pool.clone())),
            merge_units: Arc::new(SqliteMergeUnitRepository::new(pool.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeState {
    pub stats: MergeStats,
    pub conflicts: Vec<MergeUnit>,
}

pub struct Scheduler {
    config: Config,
    events: Arc<EventBus>,
    breaker: Arc<CircuitBreakerService>,
    executor: Arc<ResilientExecutor>,
    tickets: Arc<TicketService>,
    queue: Arc<TaskQueueService>,
    workers: Arc<WorkerCoordinator>,
    convergence: Arc<ConvergenceService>,
}

impl Scheduler {
    /// Wire every service over `repos`, rebuilding in-memory indexes from what is stored.
    pub async fn build(config: Config, repos: Repositories, backend: Arc<dyn MergeBackend>) -> DomainResult<Self> {
        let events = Arc::new(EventBus::default());
        let breaker = Arc::new(
            CircuitBreakerService::new(CircuitBreakerConfig::from_settings(&config.circuit_breaker))
                .with_event_bus(events.clone()),
        );
        let executor = Arc::new(ResilientExecutor::new(&config.retry, breaker.clone()));

        let graph = Arc::new(DependencyGraph::hydrate(repos.tasks.clone()).await?);
        let tickets = Arc::new(TicketService::new(repos.tickets, repos.tasks.clone()));
        let convergence = Arc::new(ConvergenceService::new(
            repos.merge_units,
            backend,
            executor.clone(),
            events.clone(),
            Duration::from_secs(config.merge.lock_wait_timeout_secs),
        ));

        let queue = TaskQueueService::new(
            repos.tasks.clone(),
            repos.agents.clone(),
            graph,
            PriorityScorer::new(config.priority.clone()),
            tickets.clone(),
            events.clone(),
            TaskQueueConfig::from_config(&config),
        )
        .with_convergence(convergence.clone());
        queue.restore_sequences().await?;
        let queue = Arc::new(queue);

        let workers = Arc::new(WorkerCoordinator::new(
            repos.agents,
            repos.tasks,
            queue.clone(),
            events.clone(),
        ));

        Ok(Self {
            config,
            events,
            breaker,
            executor,
            tickets,
            queue,
            workers,
            convergence,
        })
    }

    /// Everything in memory, merging onto a snapshot store.
    pub async fn in_memory(config: Config) -> DomainResult<Self> {
        Self::build(config, Repositories::in_memory(), Arc::new(SnapshotMergeBackend::new())).await
    }

    /// Open the storage and merge backend named in `config`.
    pub async fn from_config(config: Config) -> DomainResult<Self> {
        let backend = backend_from_config(&config.merge)?;
        let repos = match config.database.backend {
            StorageBackend::Memory => Repositories::in_memory(),
            StorageBackend::Sqlite => {
                let url = format!("sqlite:{}", config.database.path);
                let pool = initialize_database(&url, Some(PoolConfig::from_database(&config.database)))
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                Repositories::sqlite(&pool)
            }
        };
        info!(
            storage = ?config.database.backend,
            merge_backend = backend.name(),
            "scheduler storage opened"
        );
        Self::build(config, repos, backend).await
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerService> {
        &self.breaker
    }

    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.executor
    }

    pub fn tickets(&self) -> &Arc<TicketService> {
        &self.tickets
    }

    pub fn queue(&self) -> &Arc<TaskQueueService> {
        &self.queue
    }

    pub fn workers(&self) -> &Arc<WorkerCoordinator> {
        &self.workers
    }

    pub fn convergence(&self) -> &Arc<ConvergenceService> {
        &self.convergence
    }

    /// Merge a completed task's output into `base_ref`.
    pub async fn submit_merge(&self, task_id: Uuid, base_ref: &str, produced_ref: &str) -> DomainResult<MergeResult> {
        let task = self.queue.get(task_id).await?;
        self.convergence.submit(&task, base_ref, produced_ref).await
    }

    pub async fn merge_state(&self) -> DomainResult<MergeState> {
        Ok(MergeState {
            stats: self.convergence.stats().await?,
            conflicts: self.convergence.conflicts().await?,
        })
    }

    /// Start the background lease sweep at the configured interval.
    /// Each tick also purges expired idempotency results.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        HeartbeatSweeper::new(
            self.workers.clone(),
            SweeperConfig {
                interval: Duration::from_secs(self.config.heartbeat.sweep_interval_secs.max(1)),
            },
        )
        .with_executor(self.executor.clone())
        .spawn()
    }
}
