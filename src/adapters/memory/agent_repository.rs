use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, Assignment};
use crate::domain::ports::AgentRepository;

#[derive(Default)]
pub struct InMemoryAgentRepository {
    agents: DashMap<String, Agent>,
    assignments: DashMap<Uuid, Assignment>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_assignments(&self, keep: impl Fn(&Assignment) -> bool) -> Vec<Assignment> {
        let mut out: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|a| keep(a))
            .map(|a| a.clone())
            .collect();
        out.sort_by_key(|a| a.claimed_at);
        out
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn upsert(&self, agent: &Agent) -> DomainResult<()> {
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<Agent>> {
        Ok(self.agents.get(id).map(|a| a.clone()))
    }

    async fn list(&self) -> DomainResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|a| a.clone()).collect();
        agents.sort_by_key(|a| a.registered_at);
        Ok(agents)
    }

    async fn put_assignment(&self, assignment: &Assignment) -> DomainResult<()> {
        self.assignments.insert(assignment.task_id, assignment.clone());
        Ok(())
    }

    async fn get_assignment(&self, task_id: Uuid) -> DomainResult<Option<Assignment>> {
        Ok(self.assignments.get(&task_id).map(|a| a.clone()))
    }

    async fn list_assignments(&self) -> DomainResult<Vec<Assignment>> {
        Ok(self.collect_assignments(|_| true))
    }

    async fn assignments_for_agent(&self, agent_id: &str) -> DomainResult<Vec<Assignment>> {
        Ok(self.collect_assignments(|a| a.agent_id == agent_id))
    }

    async fn delete_assignment(&self, task_id: Uuid, agent_id: &str) -> DomainResult<bool> {
        Ok(self
            .assignments
            .remove_if(&task_id, |_, lease| lease.agent_id == agent_id)
            .is_some())
    }

    async fn renew_leases(&self, agent_id: &str, until: DateTime<Utc>) -> DomainResult<u64> {
        let mut renewed = 0;
        for mut assignment in self.assignments.iter_mut() {
            if assignment.agent_id == agent_id {
                assignment.lease_expires_at = until;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn expired_assignments(&self, now: DateTime<Utc>) -> DomainResult<Vec<Assignment>> {
        let mut expired = self.collect_assignments(|a| a.is_expired(now));
        expired.sort_by_key(|a| a.lease_expires_at);
        Ok(expired)
    }
}
