//! SQLite implementation of the AgentRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentStatus, Assignment};
use crate::domain::ports::AgentRepository;

#[derive(Clone)]
pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn upsert(&self, agent: &Agent) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO agents (id, capacity, status, last_heartbeat_at, registered_at, heartbeat_count)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 capacity = excluded.capacity,
                 status = excluded.status,
                 last_heartbeat_at = excluded.last_heartbeat_at,
                 registered_at = excluded.registered_at,
                 heartbeat_count = excluded.heartbeat_count",
        )
        .bind(&agent.id)
        .bind(i64::from(agent.capacity))
        .bind(agent.status.as_str())
        .bind(format_datetime(agent.last_heartbeat_at))
        .bind(format_datetime(agent.registered_at))
        .bind(i64::try_from(agent.heartbeat_count).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agents ORDER BY registered_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn put_assignment(&self, assignment: &Assignment) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO assignments (task_id, agent_id, claimed_at, lease_expires_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(task_id) DO UPDATE SET
                 agent_id = excluded.agent_id,
                 claimed_at = excluded.claimed_at,
                 lease_expires_at = excluded.lease_expires_at",
        )
        .bind(assignment.task_id.to_string())
        .bind(&assignment.agent_id)
        .bind(format_datetime(assignment.claimed_at))
        .bind(format_datetime(assignment.lease_expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_assignment(&self, task_id: Uuid) -> DomainResult<Option<Assignment>> {
        let row: Option<AssignmentRow> = sqlx::query_as("SELECT * FROM assignments WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_assignments(&self) -> DomainResult<Vec<Assignment>> {
        let rows: Vec<AssignmentRow> = sqlx::query_as("SELECT * FROM assignments ORDER BY claimed_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn assignments_for_agent(&self, agent_id: &str) -> DomainResult<Vec<Assignment>> {
        let rows: Vec<AssignmentRow> =
            sqlx::query_as("SELECT * FROM assignments WHERE agent_id = ? ORDER BY claimed_at ASC")
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_assignment(&self, task_id: Uuid, agent_id: &str) -> DomainResult<bool> {
        let result = sqlx::query("DELETE FROM assignments WHERE task_id = ? AND agent_id = ?")
            .bind(task_id.to_string())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_leases(&self, agent_id: &str, until: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("UPDATE assignments SET lease_expires_at = ? WHERE agent_id = ?")
            .bind(format_datetime(until))
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn expired_assignments(&self, now: DateTime<Utc>) -> DomainResult<Vec<Assignment>> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(
            "SELECT * FROM assignments WHERE lease_expires_at <= ? ORDER BY lease_expires_at ASC",
        )
        .bind(format_datetime(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    capacity: i64,
    status: String,
    last_heartbeat_at: String,
    registered_at: String,
    heartbeat_count: i64,
}

impl TryFrom<AgentRow> for Agent {
    type Error = DomainError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            capacity: u32::try_from(row.capacity).unwrap_or(1),
            status: AgentStatus::from_str(&row.status)
                .ok_or_else(|| DomainError::SerializationError(format!("Invalid agent status: {}", row.status)))?,
            last_heartbeat_at: parse_datetime(&row.last_heartbeat_at)?,
            registered_at: parse_datetime(&row.registered_at)?,
            heartbeat_count: u64::try_from(row.heartbeat_count).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    task_id: String,
    agent_id: String,
    claimed_at: String,
    lease_expires_at: String,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = DomainError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            task_id: parse_uuid(&row.task_id)?,
            agent_id: row.agent_id,
            claimed_at: parse_datetime(&row.claimed_at)?,
            lease_expires_at: parse_datetime(&row.lease_expires_at)?,
        })
    }
}
