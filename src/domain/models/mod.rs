pub mod agent;
pub mod config;
pub mod events;
pub mod merge;
pub mod task;
pub mod ticket;

pub use agent::{Agent, AgentStatus, Assignment};
pub use config::{
    CircuitBreakerSettings, Config, DatabaseConfig, HeartbeatConfig, LoggingConfig, MergeBackendKind,
    MergeConfig, PriorityConfig, PriorityWeights, RetryConfig, ServerConfig, StorageBackend,
    TaskDefaultsConfig,
};
pub use events::{EventCategory, EventEnvelope, SchedulerEvent};
pub use merge::{ConflictStatus, MergeResult, MergeStats, MergeUnit, MergeUnitState, Resolution};
pub use task::{
    ArtifactRef, CancelOutcome, ReleaseOutcome, ReleaseReason, Task, TaskPriority, TaskStatus,
};
pub use ticket::{Ticket, TicketStatus};
