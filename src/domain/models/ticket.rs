//! Ticket domain model.
//!
//! A ticket is the user-visible unit of work. Its status is rolled up from
//! the tasks it owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskPriority, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Backlog,
    InProgress,
    Blocked,
    Done,
    Archived,
}

impl TicketStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Derive the ticket status from the statuses of its tasks.
    ///
    /// Cancelled tasks are ignored. A ticket with no live tasks stays in backlog.
    pub fn rollup(task_statuses: &[TaskStatus]) -> Self {
        let live: Vec<TaskStatus> = task_statuses
            .iter()
            .copied()
            .filter(|s| *s != TaskStatus::Cancelled)
            .collect();

        if live.is_empty() {
            return Self::Backlog;
        }
        if live.iter().all(|s| *s == TaskStatus::Completed) {
            return Self::Done;
        }
        if live.contains(&TaskStatus::Failed) {
            return Self::Blocked;
        }
        if live
            .iter()
            .any(|s| matches!(s, TaskStatus::Claimed | TaskStatus::Running | TaskStatus::Completed))
        {
            return Self::InProgress;
        }
        Self::Backlog
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub status: TicketStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; stale writers lose the compare-and-swap
    #[serde(default = "initial_version")]
    pub version: u64,
}

const fn initial_version() -> u64 {
    1
}

impl Ticket {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            status: TicketStatus::Backlog,
            priority: TaskPriority::default(),
            created_at: now,
            updated_at: now,
            version: initial_version(),
        }
    }

    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}
