use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::Ticket;

/// Repository port for ticket persistence
#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>>;

    /// Write `ticket` if the stored version equals `expected_version`.
    ///
    /// The caller sets `ticket.version` to the new version. Returns `false`
    /// when another writer got there first; errors with `TicketNotFound` if absent.
    async fn compare_and_swap(&self, ticket: &Ticket, expected_version: u64) -> DomainResult<bool>;

    async fn list(&self) -> DomainResult<Vec<Ticket>>;
}
