//! SQLite implementation of the TicketRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_uuid, to_i64, to_u64};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{TaskPriority, Ticket, TicketStatus};
use crate::domain::ports::TicketRepository;

#[derive(Clone)]
pub struct SqliteTicketRepository {
    pool: SqlitePool,
}

impl SqliteTicketRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketRepository for SqliteTicketRepository {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO tickets (id, title, status, priority, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ticket.id.to_string())
        .bind(&ticket.title)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(format_datetime(ticket.created_at))
        .bind(format_datetime(ticket.updated_at))
        .bind(to_i64(ticket.version))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>> {
        let row: Option<TicketRow> = sqlx::query_as("SELECT * FROM tickets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn compare_and_swap(&self, ticket: &Ticket, expected_version: u64) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE tickets SET title = ?, status = ?, priority = ?, updated_at = ?, version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&ticket.title)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(format_datetime(ticket.updated_at))
        .bind(to_i64(ticket.version))
        .bind(ticket.id.to_string())
        .bind(to_i64(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tickets WHERE id = ?)")
            .bind(ticket.id.to_string())
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(false)
        } else {
            Err(DomainError::TicketNotFound(ticket.id))
        }
    }

    async fn list(&self) -> DomainResult<Vec<Ticket>> {
        let rows: Vec<TicketRow> = sqlx::query_as("SELECT * FROM tickets ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: String,
    title: String,
    status: String,
    priority: String,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = DomainError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            title: row.title,
            status: TicketStatus::from_str(&row.status)
                .ok_or_else(|| DomainError::SerializationError(format!("Invalid ticket status: {}", row.status)))?,
            priority: TaskPriority::from_str(&row.priority)
                .ok_or_else(|| DomainError::SerializationError(format!("Invalid priority: {}", row.priority)))?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            version: to_u64(row.version),
        })
    }
}
