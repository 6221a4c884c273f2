//! Port traits implemented by the adapters.

pub mod agent_repository;
pub mod merge_backend;
pub mod merge_unit_repository;
pub mod task_repository;
pub mod ticket_repository;

pub use agent_repository::AgentRepository;
pub use merge_backend::{MergeBackend, MergeOutcome};
pub use merge_unit_repository::MergeUnitRepository;
pub use task_repository::{DependencyEdge, TaskFilter, TaskRepository};
pub use ticket_repository::TicketRepository;
