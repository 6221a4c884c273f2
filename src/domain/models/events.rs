//! Scheduler events broadcast to observers (dashboards, pollers, tests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::merge::ConflictStatus;
use super::task::ReleaseOutcome;

/// Event category for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Task,
    Agent,
    Merge,
    Circuit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SchedulerEvent {
    TaskCreated {
        task_id: Uuid,
        ticket_id: Uuid,
    },
    /// A task entered the ready-set
    TaskReady {
        task_id: Uuid,
    },
    TaskBlocked {
        task_id: Uuid,
        waiting_on: usize,
    },
    TaskClaimed {
        task_id: Uuid,
        agent_id: String,
        attempt: u32,
    },
    TaskStarted {
        task_id: Uuid,
        agent_id: String,
    },
    TaskCompleted {
        task_id: Uuid,
        unblocked: Vec<Uuid>,
    },
    TaskReleased {
        task_id: Uuid,
        reason: String,
        outcome: ReleaseOutcome,
    },
    TaskCancelRequested {
        task_id: Uuid,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    /// Repeated timeout releases crossed the escalation threshold
    TaskEscalated {
        task_id: Uuid,
        timeout_releases: u32,
    },
    AgentRegistered {
        agent_id: String,
    },
    AgentStale {
        agent_id: String,
        released: Vec<Uuid>,
    },
    AgentTerminated {
        agent_id: String,
    },
    MergeCompleted {
        merge_unit_id: Uuid,
        base_ref: String,
        status: ConflictStatus,
    },
    CircuitOpened {
        scope: String,
    },
    CircuitClosed {
        scope: String,
    },
}

impl SchedulerEvent {
    pub const fn category(&self) -> EventCategory {
        match self {
            Self::TaskCreated { .. }
            | Self::TaskReady { .. }
            | Self::TaskBlocked { .. }
            | Self::TaskClaimed { .. }
            | Self::TaskStarted { .. }
            | Self::TaskCompleted { .. }
            | Self::TaskReleased { .. }
            | Self::TaskCancelRequested { .. }
            | Self::TaskCancelled { .. }
            | Self::TaskEscalated { .. } => EventCategory::Task,
            Self::AgentRegistered { .. } | Self::AgentStale { .. } | Self::AgentTerminated { .. } => {
                EventCategory::Agent
            }
            Self::MergeCompleted { .. } => EventCategory::Merge,
            Self::CircuitOpened { .. } | Self::CircuitClosed { .. } => EventCategory::Circuit,
        }
    }
}

/// Sequenced envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub event: SchedulerEvent,
}
