//! taskmesh - dependency-aware task scheduling for agent swarms
//!
//! Tasks are grouped under tickets and linked by dependency edges that must
//! form a DAG. Ready tasks are ranked by a weighted priority score and handed
//! to agents through a compare-and-swap claim, so no two agents ever hold the
//! same task. Claims are leased; agents heartbeat to keep them, and a
//! background sweep requeues whatever a silent agent was holding. When a task
//! completes with an artifact, its output is merged into a shared base in
//! completion order, one merge per base at a time.
//!
//! # Architecture
//!
//! The crate follows a hexagonal layout:
//!
//! - **Domain Layer** (`domain`): models, port traits and the error taxonomy
//! - **Service Layer** (`services`): dependency graph, scorer, queue, worker
//!   coordination, convergence, retry and circuit breaking
//! - **Adapters** (`adapters`): in-memory and SQLite storage, merge backends, HTTP
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```no_run
//! use taskmesh::services::{NewTask, Scheduler};
//! use taskmesh::{Config, TaskPriority};
//!
//! # async fn demo() -> taskmesh::DomainResult<()> {
//! let scheduler = Scheduler::in_memory(Config::default()).await?;
//! let ticket = scheduler.tickets().create("checkout flow", TaskPriority::High).await?;
//! let schema = scheduler.queue().create_task(NewTask::new(ticket.id, "add schema")).await?;
//! scheduler
//!     .queue()
//!     .create_task(NewTask::new(ticket.id, "wire handler").depends_on(schema.id))
//!     .await?;
//!
//! scheduler.workers().register(Some("agent-1"), 1).await?;
//! let claimed = scheduler.queue().claim_next("agent-1", None).await?;
//! assert_eq!(claimed.map(|t| t.id), Some(schema.id));
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Agent, AgentStatus, ArtifactRef, Config, ConflictStatus, MergeResult, MergeUnit, Resolution, Task,
    TaskPriority, TaskStatus, Ticket, TicketStatus,
};
pub use domain::ports::{AgentRepository, MergeBackend, TaskRepository, TicketRepository};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{NewTask, Scheduler};
