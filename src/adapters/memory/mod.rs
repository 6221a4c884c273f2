//! In-memory adapters backed by `DashMap`.
//!
//! Each map shard is locked per entry, so a compare-and-swap on one task
//! never waits on writers of another.

pub mod agent_repository;
pub mod merge_unit_repository;
pub mod task_repository;
pub mod ticket_repository;

pub use agent_repository::InMemoryAgentRepository;
pub use merge_unit_repository::InMemoryMergeUnitRepository;
pub use task_repository::InMemoryTaskRepository;
pub use ticket_repository::InMemoryTicketRepository;
