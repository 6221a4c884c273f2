//! Ticket service: creation, lookup, archival and status rollup.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{TaskPriority, TaskStatus, Ticket, TicketStatus};
use crate::domain::ports::{TaskFilter, TaskRepository, TicketRepository};

const CAS_RETRIES: usize = 16;

pub struct TicketService {
    tickets: Arc<dyn TicketRepository>,
    tasks: Arc<dyn TaskRepository>,
}

impl TicketService {
    pub fn new(tickets: Arc<dyn TicketRepository>, tasks: Arc<dyn TaskRepository>) -> Self {
        Self { tickets, tasks }
    }

    #[instrument(skip(self), err)]
    pub async fn create(&self, title: &str, priority: TaskPriority) -> DomainResult<Ticket> {
        if title.trim().is_empty() {
            return Err(DomainError::ValidationFailed("ticket title cannot be empty".to_string()));
        }
        let ticket = Ticket::new(title.trim()).with_priority(priority);
        self.tickets.create(&ticket).await?;
        Ok(ticket)
    }

    pub async fn get(&self, id: Uuid) -> DomainResult<Ticket> {
        self.tickets.get(id).await?.ok_or(DomainError::TicketNotFound(id))
    }

    pub async fn list(&self) -> DomainResult<Vec<Ticket>> {
        self.tickets.list().await
    }

    /// Operator archive. Archived tickets no longer follow their tasks.
    #[instrument(skip(self), err)]
    pub async fn archive(&self, id: Uuid) -> DomainResult<Ticket> {
        self.mutate(id, |ticket| {
            if ticket.status != TicketStatus::Archived {
                ticket.status = TicketStatus::Archived;
            }
        })
        .await
    }

    /// Recompute a ticket's status from its tasks.
    pub async fn refresh(&self, id: Uuid) -> DomainResult<Ticket> {
        let statuses: Vec<TaskStatus> = self
            .tasks
            .list(TaskFilter::for_ticket(id))
            .await?
            .into_iter()
            .map(|t| t.status)
            .collect();
        let status = TicketStatus::rollup(&statuses);

        self.mutate(id, |ticket| {
            // An archive that lands first wins
            if ticket.status != TicketStatus::Archived && ticket.status != status {
                debug!(ticket_id = %id, from = ticket.status.as_str(), to = status.as_str(), "ticket status rolled up");
                ticket.status = status;
            }
        })
        .await
    }

    /// Read-modify-CAS loop on one ticket. Nothing is written when `apply`
    /// leaves the ticket unchanged.
    async fn mutate<F>(&self, id: Uuid, mut apply: F) -> DomainResult<Ticket>
    where
        F: FnMut(&mut Ticket) + Send,
    {
        for _ in 0..CAS_RETRIES {
            let current = self.get(id).await?;
            let mut next = current.clone();
            apply(&mut next);
            if next == current {
                return Ok(current);
            }

            next.updated_at = Utc::now();
            next.version = current.version + 1;
            if self.tickets.compare_and_swap(&next, current.version).await? {
                return Ok(next);
            }
            debug!(ticket_id = %id, expected = current.version, "ticket version moved, retrying");
        }
        Err(DomainError::ConcurrencyConflict {
            entity: "ticket".to_string(),
            id: id.to_string(),
        })
    }
}
