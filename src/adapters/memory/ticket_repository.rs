use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Ticket;
use crate::domain::ports::TicketRepository;

#[derive(Default)]
pub struct InMemoryTicketRepository {
    tickets: DashMap<Uuid, Ticket>,
}

impl InMemoryTicketRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketRepository for InMemoryTicketRepository {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()> {
        if self.tickets.contains_key(&ticket.id) {
            return Err(DomainError::ValidationFailed(format!("ticket {} already exists", ticket.id)));
        }
        self.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>> {
        Ok(self.tickets.get(&id).map(|t| t.clone()))
    }

    async fn compare_and_swap(&self, ticket: &Ticket, expected_version: u64) -> DomainResult<bool> {
        let mut stored = self
            .tickets
            .get_mut(&ticket.id)
            .ok_or(DomainError::TicketNotFound(ticket.id))?;
        if stored.version != expected_version {
            return Ok(false);
        }
        *stored = ticket.clone();
        Ok(true)
    }

    async fn list(&self) -> DomainResult<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = self.tickets.iter().map(|t| t.clone()).collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }
}
