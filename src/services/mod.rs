//! Scheduler services.

pub mod circuit_breaker;
pub mod convergence_service;
pub mod dependency_graph;
pub mod event_bus;
pub mod heartbeat_sweeper;
pub mod priority_scorer;
pub mod retry;
pub mod scheduler;
pub mod task_queue_service;
pub mod ticket_service;
pub mod worker_coordinator;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerService, CircuitCheckResult, CircuitScope, CircuitState, CircuitStats,
};
pub use convergence_service::ConvergenceService;
pub use dependency_graph::{BlockedTask, DependencyGraph};
pub use event_bus::{EventBus, EventBusConfig};
pub use heartbeat_sweeper::{HeartbeatSweeper, SweeperConfig, SweeperHandle, SweeperStatus};
pub use priority_scorer::{PriorityScorer, ScoreBreakdown};
pub use retry::{is_retryable_message, CallOutcome, IdempotencyCache, ResilientExecutor, RetryError, RetryPolicy};
pub use scheduler::{MergeState, Repositories, Scheduler};
pub use task_queue_service::{CompletionReport, NewTask, QueueStats, RankedTask, TaskQueueConfig, TaskQueueService};
pub use ticket_service::TicketService;
pub use worker_coordinator::{AgentLiveness, HeartbeatAck, SweepReport, WorkerCoordinator};
