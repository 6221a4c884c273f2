//! Agent registration, heartbeats and lease expiry.
//!
//! Liveness is lease based: each claim carries a lease that heartbeats push
//! forward. [`WorkerCoordinator::sweep_expired`] releases every task whose
//! lease ran out and marks the holding agent stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentStatus, Assignment, ReleaseOutcome, ReleaseReason, SchedulerEvent};
use crate::domain::ports::{AgentRepository, TaskRepository};
use crate::services::event_bus::EventBus;
use crate::services::task_queue_service::TaskQueueService;

/// Reply to a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatAck {
    pub agent_id: String,
    pub status: AgentStatus,
    /// Tasks the agent currently holds
    pub tasks: Vec<Uuid>,
    /// Held tasks an operator asked to stop
    pub cancel_requested: Vec<Uuid>,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub released: Vec<Uuid>,
    pub stale_agents: Vec<String>,
    /// Per-task release errors; the sweep carries on past them
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentLiveness {
    #[serde(flatten)]
    pub agent: Agent,
    pub held: Vec<Uuid>,
    /// Earliest lease expiry among held tasks
    pub lease_expires_at: Option<DateTime<Utc>>,
}

pub struct WorkerCoordinator {
    agents: Arc<dyn AgentRepository>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<TaskQueueService>,
    events: Arc<EventBus>,
    lease: Duration,
}

impl WorkerCoordinator {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<TaskQueueService>,
        events: Arc<EventBus>,
    ) -> Self {
        let lease = queue.config().lease;
        Self {
            agents,
            tasks,
            queue,
            events,
            lease,
        }
    }

    /// Register a new agent, or revive an existing one under the same id.
    #[instrument(skip(self), err)]
    pub async fn register(&self, agent_id: Option<&str>, capacity: u32) -> DomainResult<Agent> {
        if capacity == 0 {
            return Err(DomainError::ValidationFailed("agent capacity must be at least 1".to_string()));
        }
        let id = match agent_id.map(str::trim) {
            Some("") => return Err(DomainError::ValidationFailed("agent id cannot be empty".to_string())),
            Some(id) => id.to_string(),
            None => format!("agent-{}", &Uuid::new_v4().simple().to_string()[..8]),
        };

        let held = self.agents.assignments_for_agent(&id).await?.len();
        let agent = match self.agents.get(&id).await? {
            Some(mut existing) => {
                existing.capacity = capacity;
                existing.status = Agent::status_for_load(held);
                existing.last_heartbeat_at = Utc::now();
                if existing.is_terminated() {
                    existing.registered_at = existing.last_heartbeat_at;
                    existing.heartbeat_count = 0;
                }
                existing
            }
            None => Agent::new(&id, capacity),
        };
        self.agents.upsert(&agent).await?;

        self.events.publish(SchedulerEvent::AgentRegistered { agent_id: id.clone() });
        info!(agent_id = %id, capacity, "agent registered");
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> DomainResult<Agent> {
        self.agents
            .get(agent_id)
            .await?
            .ok_or_else(|| DomainError::UnknownAgent(agent_id.to_string()))
    }

    pub async fn heartbeat(&self, agent_id: &str) -> DomainResult<HeartbeatAck> {
        self.heartbeat_at(agent_id, Utc::now()).await
    }

    /// Record a heartbeat and renew every lease the agent holds.
    ///
    /// Terminated and unknown agents are rejected and must re-register.
    pub async fn heartbeat_at(&self, agent_id: &str, now: DateTime<Utc>) -> DomainResult<HeartbeatAck> {
        let mut agent = match self.agents.get(agent_id).await? {
            Some(agent) if !agent.is_terminated() => agent,
            _ => return Err(DomainError::UnknownAgent(agent_id.to_string())),
        };

        let lease_expires_at = now + self.lease;
        self.agents.renew_leases(agent_id, lease_expires_at).await?;
        let held = self.agents.assignments_for_agent(agent_id).await?;

        if agent.status == AgentStatus::Stale {
            info!(agent_id, "stale agent resumed heartbeating");
        }
        agent.status = Agent::status_for_load(held.len());
        agent.last_heartbeat_at = now;
        agent.heartbeat_count += 1;
        self.agents.upsert(&agent).await?;

        let mut cancel_requested = Vec::new();
        for assignment in &held {
            if let Some(task) = self.tasks.get(assignment.task_id).await? {
                if task.cancel_requested {
                    cancel_requested.push(task.id);
                }
            }
        }

        debug!(agent_id, held = held.len(), "heartbeat");
        Ok(HeartbeatAck {
            agent_id: agent.id,
            status: agent.status,
            tasks: held.iter().map(|a| a.task_id).collect(),
            cancel_requested,
            lease_expires_at,
        })
    }

    /// Terminate an agent and give its tasks back. Returns the released task ids.
    #[instrument(skip(self), err)]
    pub async fn terminate(&self, agent_id: &str) -> DomainResult<Vec<Uuid>> {
        let mut agent = self.get(agent_id).await?;
        agent.status = AgentStatus::Terminated;
        self.agents.upsert(&agent).await?;

        let now = Utc::now();
        let mut released = Vec::new();
        for assignment in self.agents.assignments_for_agent(agent_id).await? {
            let outcome = self
                .queue
                .release_at(assignment.task_id, Some(agent_id), ReleaseReason::Manual, now)
                .await?;
            if outcome == ReleaseOutcome::NoOp {
                self.agents.delete_assignment(assignment.task_id, agent_id).await?;
            } else {
                released.push(assignment.task_id);
            }
        }

        self.queue.forget_agent(agent_id);
        self.events.publish(SchedulerEvent::AgentTerminated {
            agent_id: agent_id.to_string(),
        });
        info!(agent_id, released = released.len(), "agent terminated");
        Ok(released)
    }

    /// Release every task whose lease expired at `now` and mark its agent stale.
    ///
    /// Safe to run concurrently with claims and completions: a task that
    /// completed or changed hands in the meantime is left alone.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<SweepReport> {
        let expired = self.agents.expired_assignments(now).await?;
        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };
        if expired.is_empty() {
            return Ok(report);
        }

        let mut by_agent: BTreeMap<String, Vec<Assignment>> = BTreeMap::new();
        for assignment in expired {
            by_agent.entry(assignment.agent_id.clone()).or_default().push(assignment);
        }

        for (agent_id, assignments) in by_agent {
            if let Some(mut agent) = self.agents.get(&agent_id).await? {
                if !matches!(agent.status, AgentStatus::Stale | AgentStatus::Terminated) {
                    let stale = DomainError::StaleAgent {
                        agent_id: agent_id.clone(),
                        last_heartbeat_at: agent.last_heartbeat_at,
                    };
                    warn!(error = %stale, agent_id = %agent_id, "agent missed its lease");
                    agent.status = AgentStatus::Stale;
                    self.agents.upsert(&agent).await?;
                    report.stale_agents.push(agent_id.clone());
                }
            }

            let mut released = Vec::new();
            for assignment in assignments {
                match self.release_expired(&assignment, now).await {
                    Ok(true) => released.push(assignment.task_id),
                    Ok(false) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!(task_id = %assignment.task_id, agent_id = %agent_id, error = %e, "failed to release expired task");
                    }
                }
            }

            if !released.is_empty() {
                warn!(agent_id = %agent_id, released = released.len(), "released tasks of stale agent");
            }
            self.events.publish(SchedulerEvent::AgentStale {
                agent_id: agent_id.clone(),
                released: released.clone(),
            });
            report.released.extend(released);
        }

        Ok(report)
    }

    /// Returns whether the task went back to the queue (or terminal state).
    async fn release_expired(&self, expired: &Assignment, now: DateTime<Utc>) -> DomainResult<bool> {
        // A heartbeat may have renewed the lease since the scan
        let current = self.agents.get_assignment(expired.task_id).await?;
        if !current.is_some_and(|a| a.agent_id == expired.agent_id && a.is_expired(now)) {
            return Ok(false);
        }

        let outcome = self
            .queue
            .release_at(expired.task_id, Some(&expired.agent_id), ReleaseReason::Timeout, now)
            .await?;
        if outcome == ReleaseOutcome::NoOp {
            // Task finished or moved on; only the lease row is left
            self.agents
                .delete_assignment(expired.task_id, &expired.agent_id)
                .await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn liveness(&self) -> DomainResult<Vec<AgentLiveness>> {
        let assignments = self.agents.list_assignments().await?;
        Ok(self
            .agents
            .list()
            .await?
            .into_iter()
            .map(|agent| {
                let held: Vec<&Assignment> = assignments.iter().filter(|a| a.agent_id == agent.id).collect();
                AgentLiveness {
                    lease_expires_at: held.iter().map(|a| a.lease_expires_at).min(),
                    held: held.iter().map(|a| a.task_id).collect(),
                    agent,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryAgentRepository, InMemoryTaskRepository, InMemoryTicketRepository};
    use crate::domain::models::{TaskPriority, TaskStatus};
    use crate::services::dependency_graph::DependencyGraph;
    use crate::services::priority_scorer::PriorityScorer;
    use crate::services::task_queue_service::{NewTask, TaskQueueConfig};
    use crate::services::ticket_service::TicketService;

    struct Harness {
        coordinator: WorkerCoordinator,
        queue: Arc<TaskQueueService>,
        ticket_id: Uuid,
    }

    async fn harness() -> Harness {
        let tasks: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let agents: Arc<dyn AgentRepository> = Arc::new(InMemoryAgentRepository::new());
        let tickets = Arc::new(TicketService::new(Arc::new(InMemoryTicketRepository::new()), tasks.clone()));
        let events = Arc::new(EventBus::default());
        let queue = Arc::new(TaskQueueService::new(
            tasks.clone(),
            agents.clone(),
            Arc::new(DependencyGraph::new(tasks.clone())),
            PriorityScorer::default(),
            tickets.clone(),
            events.clone(),
            TaskQueueConfig {
                escalation_threshold: 2,
                ..TaskQueueConfig::default()
            },
        ));
        let ticket_id = tickets.create("workers", TaskPriority::Medium).await.unwrap().id;
        Harness {
            coordinator: WorkerCoordinator::new(agents, tasks, queue.clone(), events),
            queue,
            ticket_id,
        }
    }

    #[tokio::test]
    async fn test_expired_lease_releases_task_to_other_agent() {
        let h = harness().await;
        h.coordinator.register(Some("a1"), 1).await.unwrap();
        h.coordinator.register(Some("a2"), 1).await.unwrap();
        let task = h.queue.create_task(NewTask::new(h.ticket_id, "build")).await.unwrap();

        let t0 = Utc::now();
        h.queue.claim_next_at("a1", Some("poll-1"), t0).await.unwrap().unwrap();

        let early = h.coordinator.sweep_expired(t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(early.expired, 0);

        let report = h.coordinator.sweep_expired(t0 + Duration::seconds(91)).await.unwrap();
        assert_eq!(report.released, vec![task.id]);
        assert_eq!(report.stale_agents, vec!["a1".to_string()]);
        assert_eq!(h.coordinator.get("a1").await.unwrap().status, AgentStatus::Stale);

        let released = h.queue.get(task.id).await.unwrap();
        assert_eq!(released.status, TaskStatus::Ready);
        assert_eq!(released.timeout_releases, 1);
        assert_eq!(h.queue.claim_bookkeeping(), (1, 0));

        let reclaimed = h.queue.claim_next("a2", None).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, task.id);
    }

    #[tokio::test]
    async fn test_heartbeat_renews_lease() {
        let h = harness().await;
        h.coordinator.register(Some("a1"), 1).await.unwrap();
        h.queue.create_task(NewTask::new(h.ticket_id, "build")).await.unwrap();

        let t0 = Utc::now();
        h.queue.claim_next_at("a1", None, t0).await.unwrap().unwrap();
        let ack = h.coordinator.heartbeat_at("a1", t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(ack.tasks.len(), 1);
        assert_eq!(ack.status, AgentStatus::Busy);

        let report = h.coordinator.sweep_expired(t0 + Duration::seconds(120)).await.unwrap();
        assert!(report.released.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancellation() {
        let h = harness().await;
        h.coordinator.register(Some("a1"), 1).await.unwrap();
        let task = h.queue.create_task(NewTask::new(h.ticket_id, "long")).await.unwrap();
        h.queue.claim_next("a1", None).await.unwrap();
        h.queue.cancel(task.id, Some("no longer needed")).await.unwrap();

        let ack = h.coordinator.heartbeat("a1").await.unwrap();
        assert_eq!(ack.cancel_requested, vec![task.id]);
    }

    #[tokio::test]
    async fn test_terminated_agent_is_rejected() {
        let h = harness().await;
        h.coordinator.register(Some("a1"), 1).await.unwrap();
        let task = h.queue.create_task(NewTask::new(h.ticket_id, "work")).await.unwrap();
        h.queue.claim_next("a1", Some("poll-1")).await.unwrap();
        assert_eq!(h.queue.claim_bookkeeping(), (1, 1));

        let released = h.coordinator.terminate("a1").await.unwrap();
        assert_eq!(released, vec![task.id]);
        assert_eq!(h.queue.get(task.id).await.unwrap().status, TaskStatus::Ready);

        assert!(matches!(
            h.coordinator.heartbeat("a1").await,
            Err(DomainError::UnknownAgent(_))
        ));
        assert!(matches!(
            h.queue.claim_next("a1", None).await,
            Err(DomainError::UnknownAgent(_))
        ));

        assert_eq!(h.queue.claim_bookkeeping(), (0, 0));

        // Re-registration brings it back
        h.coordinator.register(Some("a1"), 1).await.unwrap();
        assert!(h.coordinator.heartbeat("a1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_agent_heartbeat() {
        let h = harness().await;
        assert!(matches!(
            h.coordinator.heartbeat("nobody").await,
            Err(DomainError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_repeated_timeouts_escalate_but_still_release() {
        let h = harness().await;
        h.coordinator.register(Some("a1"), 1).await.unwrap();
        let task = h.queue.create_task(NewTask::new(h.ticket_id, "hangs")).await.unwrap();
        let mut now = Utc::now();

        for _ in 0..2 {
            h.coordinator.heartbeat_at("a1", now).await.unwrap();
            h.queue.claim_next_at("a1", None, now).await.unwrap().unwrap();
            now += Duration::seconds(91);
            let report = h.coordinator.sweep_expired(now).await.unwrap();
            assert_eq!(report.released, vec![task.id]);
        }

        let task = h.queue.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.timeout_releases, 2);
    }

    #[tokio::test]
    async fn test_register_generates_id_and_rejects_zero_capacity() {
        let h = harness().await;
        let agent = h.coordinator.register(None, 2).await.unwrap();
        assert!(agent.id.starts_with("agent-"));
        assert!(h.coordinator.register(Some("a"), 0).await.is_err());
        assert_eq!(h.coordinator.liveness().await.unwrap().len(), 1);
    }
}
