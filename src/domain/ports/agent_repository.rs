use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, Assignment};

/// Repository port for agents and their leased assignments.
///
/// At most one assignment exists per task. Removal is always scoped to the
/// agent that holds it, so a late cleanup by a previous holder can never take
/// away the lease of whoever claimed the task since.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or replace an agent
    async fn upsert(&self, agent: &Agent) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<Agent>>;

    async fn list(&self) -> DomainResult<Vec<Agent>>;

    /// Insert the lease for a task, replacing one left behind by a previous holder
    async fn put_assignment(&self, assignment: &Assignment) -> DomainResult<()>;

    async fn get_assignment(&self, task_id: Uuid) -> DomainResult<Option<Assignment>>;

    async fn list_assignments(&self) -> DomainResult<Vec<Assignment>>;

    async fn assignments_for_agent(&self, agent_id: &str) -> DomainResult<Vec<Assignment>>;

    /// Remove the task's lease if `agent_id` still holds it. Returns `true` if one was removed.
    async fn delete_assignment(&self, task_id: Uuid, agent_id: &str) -> DomainResult<bool>;

    /// Push every lease held by `agent_id` out to `until`. Returns how many were renewed.
    async fn renew_leases(&self, agent_id: &str, until: DateTime<Utc>) -> DomainResult<u64>;

    async fn expired_assignments(&self, now: DateTime<Utc>) -> DomainResult<Vec<Assignment>>;
}
