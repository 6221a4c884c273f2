//! Agent (worker slot) and assignment models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    /// Missed its heartbeat deadline; its tasks were released
    Stale,
    /// Terminated by operator or on shutdown; must re-register
    Terminated,
}

impl AgentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stale => "stale",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "stale" => Some(Self::Stale),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution slot, typically a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Max concurrent claimed tasks
    pub capacity: u32,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Count of heartbeats received since registration
    pub heartbeat_count: u64,
}

impl Agent {
    pub fn new(id: impl Into<String>, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capacity: capacity.max(1),
            status: AgentStatus::Idle,
            last_heartbeat_at: now,
            registered_at: now,
            heartbeat_count: 0,
        }
    }

    pub const fn is_terminated(&self) -> bool {
        matches!(self.status, AgentStatus::Terminated)
    }

    pub fn heartbeat_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat_at > timeout
    }

    /// Busy or idle from how many assignments the agent holds.
    pub const fn status_for_load(held: usize) -> AgentStatus {
        if held == 0 {
            AgentStatus::Idle
        } else {
            AgentStatus::Busy
        }
    }
}

/// Time-leased binding of a task to the agent that claimed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: String,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(task_id: Uuid, agent_id: impl Into<String>, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            claimed_at: now,
            lease_expires_at: now + lease,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}
