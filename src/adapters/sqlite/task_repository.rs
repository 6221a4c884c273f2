//! SQLite implementation of the TaskRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_optional_datetime, parse_uuid, to_i64, to_u32, to_u64};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ArtifactRef, Task, TaskPriority, TaskStatus};
use crate::domain::ports::{DependencyEdge, TaskFilter, TaskRepository};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn dependencies_of(&self, id: Uuid) -> DomainResult<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT blocker_id FROM task_dependencies WHERE blocked_id = ? ORDER BY blocker_id",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|(s,)| parse_uuid(s)).collect()
    }

    async fn dependency_map(&self) -> DomainResult<HashMap<Uuid, Vec<Uuid>>> {
        let mut map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in self.list_dependencies().await? {
            map.entry(edge.blocked).or_default().push(edge.blocker);
        }
        Ok(map)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO tasks (id, ticket_id, description, status, priority, retry_count,
               max_retries, attempts, timeout_releases, claimed_by, cancel_requested, deadline,
               last_error, artifact_base_ref, artifact_produced_ref, idempotency_key, sequence,
               completion_seq, version, created_at, updated_at, claimed_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.ticket_id.to_string())
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.timeout_releases))
        .bind(&task.claimed_by)
        .bind(task.cancel_requested)
        .bind(task.deadline.map(format_datetime))
        .bind(&task.last_error)
        .bind(task.artifact.as_ref().map(|a| a.base_ref.clone()))
        .bind(task.artifact.as_ref().map(|a| a.produced_ref.clone()))
        .bind(&task.idempotency_key)
        .bind(to_i64(task.sequence))
        .bind(task.completion_seq.map(to_i64))
        .bind(to_i64(task.version))
        .bind(format_datetime(task.created_at))
        .bind(format_datetime(task.updated_at))
        .bind(task.claimed_at.map(format_datetime))
        .bind(task.started_at.map(format_datetime))
        .bind(task.completed_at.map(format_datetime))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let mut task: Task = r.try_into()?;
                task.depends_on = self.dependencies_of(id).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, task: &Task, expected_version: u64) -> DomainResult<bool> {
        let result = sqlx::query(
            r"UPDATE tasks SET description = ?, status = ?, priority = ?, retry_count = ?,
               max_retries = ?, attempts = ?, timeout_releases = ?, claimed_by = ?,
               cancel_requested = ?, deadline = ?, last_error = ?, artifact_base_ref = ?,
               artifact_produced_ref = ?, completion_seq = ?, version = ?, updated_at = ?,
               claimed_at = ?, started_at = ?, completed_at = ?
               WHERE id = ? AND version = ?",
        )
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.timeout_releases))
        .bind(&task.claimed_by)
        .bind(task.cancel_requested)
        .bind(task.deadline.map(format_datetime))
        .bind(&task.last_error)
        .bind(task.artifact.as_ref().map(|a| a.base_ref.clone()))
        .bind(task.artifact.as_ref().map(|a| a.produced_ref.clone()))
        .bind(task.completion_seq.map(to_i64))
        .bind(to_i64(task.version))
        .bind(format_datetime(task.updated_at))
        .bind(task.claimed_at.map(format_datetime))
        .bind(task.started_at.map(format_datetime))
        .bind(task.completed_at.map(format_datetime))
        .bind(task.id.to_string())
        .bind(to_i64(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM tasks WHERE id = ?")
            .bind(task.id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(DomainError::TaskNotFound(task.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let status = filter.status.map(|s| s.as_str());
        let ticket_id = filter.ticket_id.map(|id| id.to_string());
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows: Vec<TaskRow> = sqlx::query_as(
            r"SELECT * FROM tasks
               WHERE (? IS NULL OR status = ?)
                 AND (? IS NULL OR ticket_id = ?)
                 AND (? IS NULL OR claimed_by = ?)
               ORDER BY sequence ASC
               LIMIT ?",
        )
        .bind(status)
        .bind(status)
        .bind(&ticket_id)
        .bind(&ticket_id)
        .bind(&filter.claimed_by)
        .bind(&filter.claimed_by)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut deps = self.dependency_map().await?;
        rows.into_iter()
            .map(|row| {
                let mut task: Task = row.try_into()?;
                task.depends_on = deps.remove(&task.id).unwrap_or_default();
                Ok(task)
            })
            .collect()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> DomainResult<Option<Task>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((id,)) => self.get(parse_uuid(&id)?).await,
            None => Ok(None),
        }
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            if let Some(s) = TaskStatus::from_str(&status) {
                counts.insert(s, to_u64(count));
            }
        }
        Ok(counts)
    }

    async fn max_sequences(&self) -> DomainResult<(u64, u64)> {
        let (seq, completion): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0), COALESCE(MAX(completion_seq), 0) FROM tasks",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((to_u64(seq), to_u64(completion)))
    }

    async fn add_dependency(&self, edge: DependencyEdge) -> DomainResult<()> {
        sqlx::query("INSERT OR IGNORE INTO task_dependencies (blocker_id, blocked_id) VALUES (?, ?)")
            .bind(edge.blocker.to_string())
            .bind(edge.blocked.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_dependency(&self, edge: DependencyEdge) -> DomainResult<bool> {
        let result = sqlx::query("DELETE FROM task_dependencies WHERE blocker_id = ? AND blocked_id = ?")
            .bind(edge.blocker.to_string())
            .bind(edge.blocked.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_dependencies(&self) -> DomainResult<Vec<DependencyEdge>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT blocker_id, blocked_id FROM task_dependencies ORDER BY blocked_id, blocker_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(blocker, blocked)| {
                Ok(DependencyEdge {
                    blocker: parse_uuid(blocker)?,
                    blocked: parse_uuid(blocked)?,
                })
            })
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    ticket_id: String,
    description: String,
    status: String,
    priority: String,
    retry_count: i64,
    max_retries: i64,
    attempts: i64,
    timeout_releases: i64,
    claimed_by: Option<String>,
    cancel_requested: bool,
    deadline: Option<String>,
    last_error: Option<String>,
    artifact_base_ref: Option<String>,
    artifact_produced_ref: Option<String>,
    idempotency_key: Option<String>,
    sequence: i64,
    completion_seq: Option<i64>,
    version: i64,
    created_at: String,
    updated_at: String,
    claimed_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        let priority = TaskPriority::from_str(&row.priority)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid priority: {}", row.priority)))?;

        let artifact = match (row.artifact_base_ref, row.artifact_produced_ref) {
            (Some(base_ref), Some(produced_ref)) => Some(ArtifactRef { base_ref, produced_ref }),
            _ => None,
        };

        Ok(Self {
            id: parse_uuid(&row.id)?,
            ticket_id: parse_uuid(&row.ticket_id)?,
            description: row.description,
            status,
            priority,
            depends_on: Vec::new(),
            retry_count: to_u32(row.retry_count),
            max_retries: to_u32(row.max_retries),
            attempts: to_u32(row.attempts),
            timeout_releases: to_u32(row.timeout_releases),
            claimed_by: row.claimed_by,
            cancel_requested: row.cancel_requested,
            deadline: parse_optional_datetime(row.deadline)?,
            last_error: row.last_error,
            artifact,
            idempotency_key: row.idempotency_key,
            sequence: to_u64(row.sequence),
            completion_seq: row.completion_seq.map(to_u64),
            version: to_u64(row.version),
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            claimed_at: parse_optional_datetime(row.claimed_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}
