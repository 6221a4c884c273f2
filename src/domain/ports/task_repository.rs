use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskStatus};

/// Filters for querying tasks
#[derive(Default, Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub ticket_id: Option<Uuid>,
    pub claimed_by: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn for_ticket(ticket_id: Uuid) -> Self {
        Self {
            ticket_id: Some(ticket_id),
            ..Default::default()
        }
    }
}

/// A directed dependency edge: `blocker` must complete before `blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub blocker: Uuid,
    pub blocked: Uuid,
}

/// Repository port for task persistence.
///
/// Task rows are versioned. Every state change goes through
/// [`TaskRepository::compare_and_swap`], which only writes when the stored
/// version still equals the version the caller read.
///
/// Dependency edges are stored separately and written only by the
/// dependency graph; `create` ignores `task.depends_on` and `get`/`list`
/// fill it in from the edge table.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task row
    async fn create(&self, task: &Task) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Write `task` if the stored version equals `expected_version`.
    ///
    /// The caller sets `task.version` to the new version. Returns `false`
    /// when another writer got there first.
    async fn compare_and_swap(&self, task: &Task, expected_version: u64) -> DomainResult<bool>;

    /// Remove a task row and its edges
    async fn delete(&self, id: Uuid) -> DomainResult<()>;

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    async fn get_by_idempotency_key(&self, key: &str) -> DomainResult<Option<Task>>;

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>>;

    /// Highest creation sequence and highest completion sequence seen so far
    async fn max_sequences(&self) -> DomainResult<(u64, u64)>;

    async fn add_dependency(&self, edge: DependencyEdge) -> DomainResult<()>;

    async fn remove_dependency(&self, edge: DependencyEdge) -> DomainResult<bool>;

    async fn list_dependencies(&self) -> DomainResult<Vec<DependencyEdge>>;
}
