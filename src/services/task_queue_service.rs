//! Task queue: creation, claiming, release, completion and operator actions.
//!
//! Every task status change in the system goes through this service, and
//! every write is an optimistic compare-and-swap on the task's version.
//! There is no lock on the claim path shared between agents: concurrent
//! claimers race on the CAS and the loser moves on to the next candidate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, AgentStatus, ArtifactRef, Assignment, CancelOutcome, Config, MergeUnit, ReleaseOutcome, ReleaseReason,
    SchedulerEvent, Task, TaskPriority, TaskStatus,
};
use crate::domain::ports::{AgentRepository, TaskFilter, TaskRepository};
use crate::services::convergence_service::ConvergenceService;
use crate::services::dependency_graph::{BlockedTask, DependencyGraph};
use crate::services::event_bus::EventBus;
use crate::services::priority_scorer::PriorityScorer;
use crate::services::retry::is_retryable_message;
use crate::services::ticket_service::TicketService;

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub default_max_retries: u32,
    /// Lease granted with each claim
    pub lease: Duration,
    /// Timeout releases of one task before it is escalated
    pub escalation_threshold: u32,
    /// CAS attempts before a mutation gives up with `ConcurrencyConflict`
    pub cas_retries: u32,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl TaskQueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_max_retries: config.tasks.default_max_retries,
            lease: config.heartbeat.lease(),
            escalation_threshold: config.heartbeat.escalation_threshold,
            cas_retries: 8,
        }
    }
}

/// Request to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub ticket_id: Uuid,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default, alias = "priority_hint")]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(ticket_id: Uuid, description: impl Into<String>) -> Self {
        Self {
            ticket_id,
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, blocker: Uuid) -> Self {
        self.depends_on.push(blocker);
        self
    }

    pub const fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub const fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// What `complete` did.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub task: Task,
    /// Tasks that became ready because of this completion; empty on a repeat call
    pub unblocked: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_unit: Option<MergeUnit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedTask {
    pub task_id: Uuid,
    pub description: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub counts: BTreeMap<TaskStatus, u64>,
    pub total: u64,
    pub ready: usize,
    /// Highest-scored ready tasks, best first
    pub next_up: Vec<RankedTask>,
    pub blocked: Vec<BlockedTask>,
}

pub struct TaskQueueService {
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    graph: Arc<DependencyGraph>,
    scorer: PriorityScorer,
    tickets: Arc<TicketService>,
    merges: Option<Arc<ConvergenceService>>,
    events: Arc<EventBus>,
    config: TaskQueueConfig,
    sequence: AtomicU64,
    completion_sequence: AtomicU64,
    /// Serializes claims of one agent so capacity checks hold
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
    /// (agent, claim idempotency key) -> task claimed under it
    claim_keys: DashMap<(String, String), Uuid>,
}

impl TaskQueueService {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        graph: Arc<DependencyGraph>,
        scorer: PriorityScorer,
        tickets: Arc<TicketService>,
        events: Arc<EventBus>,
        config: TaskQueueConfig,
    ) -> Self {
        Self {
            tasks,
            agents,
            graph,
            scorer,
            tickets,
            merges: None,
            events,
            config,
            sequence: AtomicU64::new(0),
            completion_sequence: AtomicU64::new(0),
            agent_locks: DashMap::new(),
            claim_keys: DashMap::new(),
        }
    }

    /// Enqueue merge units for completed tasks that carry an artifact.
    #[must_use]
    pub fn with_convergence(mut self, merges: Arc<ConvergenceService>) -> Self {
        self.merges = Some(merges);
        self
    }

    pub const fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Continue creation and completion numbering from persisted state.
    pub async fn restore_sequences(&self) -> DomainResult<()> {
        let (sequence, completion) = self.tasks.max_sequences().await?;
        self.sequence.fetch_max(sequence, Ordering::SeqCst);
        self.completion_sequence.fetch_max(completion, Ordering::SeqCst);
        Ok(())
    }

    /// Create a task. Tasks with no dependencies are ready immediately.
    ///
    /// Repeating an idempotency key returns the task created under it.
    #[instrument(skip(self, new), fields(ticket_id = %new.ticket_id), err)]
    pub async fn create_task(&self, new: NewTask) -> DomainResult<Task> {
        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self.tasks.get_by_idempotency_key(key).await? {
                debug!(task_id = %existing.id, key = %key, "task creation replayed");
                return Ok(existing);
            }
        }
        self.tickets.get(new.ticket_id).await?;

        let mut task = Task::new(new.ticket_id, new.description)
            .with_priority(new.priority.unwrap_or_default())
            .with_max_retries(new.max_retries.unwrap_or(self.config.default_max_retries));
        for blocker in new.depends_on {
            task = task.with_dependency(blocker);
        }
        if let Some(deadline) = new.deadline {
            task = task.with_deadline(deadline);
        }
        if let Some(key) = new.idempotency_key {
            task = task.with_idempotency_key(key);
        }
        task.validate()?;
        task.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = self.tasks.create(&task).await {
            // Lost a race on the same idempotency key
            if let Some(key) = &task.idempotency_key {
                if let Some(existing) = self.tasks.get_by_idempotency_key(key).await? {
                    return Ok(existing);
                }
            }
            return Err(e);
        }

        if let Err(e) = self.graph.add_task(task.id, &task.depends_on).await {
            if let Err(cleanup) = self.tasks.delete(task.id).await {
                warn!(task_id = %task.id, error = %cleanup, "failed to remove rejected task");
            }
            return Err(e);
        }

        self.events.publish(SchedulerEvent::TaskCreated {
            task_id: task.id,
            ticket_id: task.ticket_id,
        });
        let task = self.settle(task.id, Utc::now()).await?;
        self.refresh_ticket(task.ticket_id).await;

        info!(
            task_id = %task.id,
            status = task.status.as_str(),
            dependencies = task.depends_on.len(),
            "task created"
        );
        Ok(task)
    }

    pub async fn get(&self, task_id: Uuid) -> DomainResult<Task> {
        self.tasks.get(task_id).await?.ok_or(DomainError::TaskNotFound(task_id))
    }

    pub async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.tasks.list(filter).await
    }

    pub async fn claim_next(&self, agent_id: &str, idempotency_key: Option<&str>) -> DomainResult<Option<Task>> {
        self.claim_next_at(agent_id, idempotency_key, Utc::now()).await
    }

    /// Claim the highest-scored ready task for `agent_id`.
    ///
    /// Returns `None` when nothing is ready or the agent is at capacity.
    /// Lost CAS races are retried against the next candidate and never surface.
    #[instrument(skip(self, now), err)]
    pub async fn claim_next_at(
        &self,
        agent_id: &str,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<Task>> {
        let agent = self.live_agent(agent_id).await?;

        let lock = self
            .agent_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let claim_key = idempotency_key.map(|k| (agent_id.to_string(), k.to_string()));
        if let Some(key) = &claim_key {
            if let Some(task) = self.replay_claim(key).await? {
                return Ok(Some(task));
            }
        }

        let held = self.agents.assignments_for_agent(agent_id).await?.len();
        if held >= agent.capacity as usize {
            debug!(agent_id, held, capacity = agent.capacity, "agent at capacity");
            return Ok(None);
        }

        let ready = self.tasks.list(TaskFilter::with_status(TaskStatus::Ready)).await?;
        if ready.is_empty() {
            return Ok(None);
        }
        let ids: Vec<Uuid> = ready.iter().map(|t| t.id).collect();
        let dependents = self.graph.dependents_counts(&ids).await;

        for (candidate, score) in self.scorer.rank(&ready, &dependents, now) {
            let mut claimed = candidate.clone();
            claimed.claim(agent_id, now)?;
            claimed.version = candidate.version + 1;
            if !self.tasks.compare_and_swap(&claimed, candidate.version).await? {
                debug!(error = %DomainError::ClaimConflict(candidate.id), agent_id, "lost claim race");
                continue;
            }

            self.agents
                .put_assignment(&Assignment::new(claimed.id, agent_id, now, self.config.lease))
                .await?;
            self.refresh_agent_load(agent_id).await?;
            if let Some(key) = claim_key {
                self.claim_keys.insert(key, claimed.id);
            }

            self.events.publish(SchedulerEvent::TaskClaimed {
                task_id: claimed.id,
                agent_id: agent_id.to_string(),
                attempt: claimed.attempt_number(),
            });
            self.refresh_ticket(claimed.ticket_id).await;
            info!(task_id = %claimed.id, agent_id, score, attempt = claimed.attempts, "task claimed");
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    /// `claimed -> running`. Only the claiming agent may start the task.
    #[instrument(skip(self), err)]
    pub async fn start(&self, task_id: Uuid, agent_id: &str) -> DomainResult<Task> {
        let now = Utc::now();
        let (task, ()) = self.mutate(task_id, |t| t.start(agent_id, now)).await?;
        self.events.publish(SchedulerEvent::TaskStarted {
            task_id,
            agent_id: agent_id.to_string(),
        });
        Ok(task)
    }

    pub async fn release(&self, task_id: Uuid, reason: ReleaseReason) -> DomainResult<ReleaseOutcome> {
        self.release_at(task_id, None, reason, Utc::now()).await
    }

    /// Give a held task back.
    ///
    /// With `holder` set, the release only applies while that agent still
    /// holds the task. A task that is no longer held is left untouched.
    #[instrument(skip(self, now), err)]
    pub async fn release_at(
        &self,
        task_id: Uuid,
        holder: Option<&str>,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> DomainResult<ReleaseOutcome> {
        let mut previous_holder: Option<String> = None;
        let (task, outcome) = self
            .mutate(task_id, |t| {
                if holder.is_some() && t.claimed_by.as_deref() != holder {
                    return Ok(ReleaseOutcome::NoOp);
                }
                previous_holder.clone_from(&t.claimed_by);
                t.release(&reason, now)
            })
            .await?;
        if outcome == ReleaseOutcome::NoOp {
            debug!(task_id = %task_id, status = task.status.as_str(), "release ignored, task not held");
            return Ok(outcome);
        }

        if let Some(agent_id) = &previous_holder {
            self.agents.delete_assignment(task_id, agent_id).await?;
            self.drop_claim_keys(agent_id, task_id);
            self.refresh_agent_load(agent_id).await?;
        }

        self.events.publish(SchedulerEvent::TaskReleased {
            task_id,
            reason: reason.as_str().to_string(),
            outcome,
        });
        match outcome {
            ReleaseOutcome::Requeued => self.events.publish(SchedulerEvent::TaskReady { task_id }),
            ReleaseOutcome::Cancelled => self.events.publish(SchedulerEvent::TaskCancelled { task_id }),
            ReleaseOutcome::Failed => warn!(
                task_id = %task_id,
                retry_count = task.retry_count,
                last_error = task.last_error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            ReleaseOutcome::NoOp => {}
        }

        if reason == ReleaseReason::Timeout && task.timeout_releases >= self.config.escalation_threshold {
            error!(
                task_id = %task_id,
                timeout_releases = task.timeout_releases,
                "task repeatedly timed out, escalating"
            );
            self.events.publish(SchedulerEvent::TaskEscalated {
                task_id,
                timeout_releases: task.timeout_releases,
            });
        }

        self.refresh_ticket(task.ticket_id).await;
        info!(
            task_id = %task_id,
            agent_id = previous_holder.as_deref().unwrap_or_default(),
            reason = reason.as_str(),
            outcome = ?outcome,
            "task released"
        );
        Ok(outcome)
    }

    /// Report a failed attempt. Without an explicit flag, the reason text
    /// decides whether the failure is worth retrying.
    pub async fn fail(&self, task_id: Uuid, reason: &str, retryable: Option<bool>) -> DomainResult<ReleaseOutcome> {
        let retryable = retryable.unwrap_or_else(|| is_retryable_message(reason));
        self.release(
            task_id,
            ReleaseReason::Failure {
                reason: reason.to_string(),
                retryable,
            },
        )
        .await
    }

    /// Complete a held task and unblock its dependents.
    ///
    /// Completing an already completed task changes nothing.
    #[instrument(skip(self, artifact), err)]
    pub async fn complete(&self, task_id: Uuid, artifact: Option<ArtifactRef>) -> DomainResult<CompletionReport> {
        let now = Utc::now();
        let mut previous_holder: Option<String> = None;
        let (task, newly_completed) = self
            .mutate(task_id, |t| {
                if t.status == TaskStatus::Completed {
                    return Ok(false);
                }
                previous_holder.clone_from(&t.claimed_by);
                let seq = self.completion_sequence.fetch_add(1, Ordering::SeqCst) + 1;
                t.complete(artifact.clone(), seq, now)
            })
            .await?;

        if !newly_completed {
            let merge_unit = match &self.merges {
                Some(merges) => merges.get_by_task(task_id).await?,
                None => None,
            };
            return Ok(CompletionReport {
                task,
                unblocked: Vec::new(),
                merge_unit,
            });
        }

        if let Some(agent_id) = &previous_holder {
            self.agents.delete_assignment(task_id, agent_id).await?;
            self.drop_claim_keys(agent_id, task_id);
            self.refresh_agent_load(agent_id).await?;
        }

        let mut newly_ready: Vec<Uuid> = self.graph.mark_completed(task_id).await?.into_iter().collect();
        newly_ready.sort_unstable();
        let mut tickets = BTreeSet::from([task.ticket_id]);
        let mut unblocked = Vec::with_capacity(newly_ready.len());
        for id in newly_ready {
            let dependent = self.settle(id, now).await?;
            tickets.insert(dependent.ticket_id);
            if dependent.status == TaskStatus::Ready {
                unblocked.push(id);
            }
        }

        let merge_unit = match &self.merges {
            Some(merges) => merges.enqueue(&task).await?,
            None => None,
        };

        self.events.publish(SchedulerEvent::TaskCompleted {
            task_id,
            unblocked: unblocked.clone(),
        });
        for ticket_id in tickets {
            self.refresh_ticket(ticket_id).await;
        }
        info!(
            task_id = %task_id,
            agent_id = previous_holder.as_deref().unwrap_or_default(),
            unblocked = unblocked.len(),
            "task completed"
        );

        Ok(CompletionReport {
            task,
            unblocked,
            merge_unit,
        })
    }

    /// Cancel a task. Held tasks only get `cancel_requested`; the agent sees it
    /// on its next heartbeat and the task lands in `cancelled` on release.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, task_id: Uuid, reason: Option<&str>) -> DomainResult<CancelOutcome> {
        let now = Utc::now();
        let (task, outcome) = self.mutate(task_id, |t| t.cancel(reason, now)).await?;
        match outcome {
            CancelOutcome::Cancelled => {
                self.events.publish(SchedulerEvent::TaskCancelled { task_id });
                self.refresh_ticket(task.ticket_id).await;
                info!(task_id = %task_id, "task cancelled");
            }
            CancelOutcome::Requested => {
                self.events.publish(SchedulerEvent::TaskCancelRequested { task_id });
                info!(task_id = %task_id, agent_id = task.claimed_by.as_deref().unwrap_or_default(), "cancellation requested");
            }
            CancelOutcome::NoOp => {}
        }
        Ok(outcome)
    }

    /// Operator retry of a failed task with a fresh retry budget.
    #[instrument(skip(self), err)]
    pub async fn retry(&self, task_id: Uuid) -> DomainResult<Task> {
        let now = Utc::now();
        let ready = self.graph.is_ready(task_id).await?;
        let (task, ()) = self.mutate(task_id, |t| t.reset_for_retry(ready, now)).await?;
        self.publish_readiness(&task).await;
        // A blocker may have completed in between
        let task = self.settle(task_id, now).await?;
        self.refresh_ticket(task.ticket_id).await;
        info!(task_id = %task_id, status = task.status.as_str(), "task retried");
        Ok(task)
    }

    /// Add `blocker -> blocked` to a task nobody holds yet.
    #[instrument(skip(self), err)]
    pub async fn add_dependency(&self, blocker: Uuid, blocked: Uuid) -> DomainResult<Task> {
        let task = self.get(blocked).await?;
        Self::ensure_unclaimed(&task)?;
        self.get(blocker).await?;

        self.graph.add_dependency(blocker, blocked).await?;

        let current = self.get(blocked).await?;
        if let Err(e) = Self::ensure_unclaimed(&current) {
            self.graph.remove_dependency(blocker, blocked).await?;
            return Err(e);
        }
        let task = self.settle(blocked, Utc::now()).await?;
        self.refresh_ticket(task.ticket_id).await;
        Ok(task)
    }

    /// Drop `blocker -> blocked`; the blocked task may become ready.
    #[instrument(skip(self), err)]
    pub async fn remove_dependency(&self, blocker: Uuid, blocked: Uuid) -> DomainResult<Task> {
        self.graph.remove_dependency(blocker, blocked).await?;
        let task = self.settle(blocked, Utc::now()).await?;
        self.refresh_ticket(task.ticket_id).await;
        Ok(task)
    }

    /// Ready tasks, best first.
    pub async fn ranked(&self, now: DateTime<Utc>) -> DomainResult<Vec<RankedTask>> {
        let ready = self.tasks.list(TaskFilter::with_status(TaskStatus::Ready)).await?;
        let ids: Vec<Uuid> = ready.iter().map(|t| t.id).collect();
        let dependents = self.graph.dependents_counts(&ids).await;
        Ok(self
            .scorer
            .rank(&ready, &dependents, now)
            .into_iter()
            .map(|(task, score)| RankedTask {
                task_id: task.id,
                description: task.description.clone(),
                score,
            })
            .collect())
    }

    pub async fn stats(&self) -> DomainResult<QueueStats> {
        let counts: BTreeMap<TaskStatus, u64> = self.tasks.count_by_status().await?.into_iter().collect();
        let ranked = self.ranked(Utc::now()).await?;
        Ok(QueueStats {
            total: counts.values().sum(),
            ready: ranked.len(),
            next_up: ranked.into_iter().take(10).collect(),
            blocked: self.graph.blocked_tasks().await,
            counts,
        })
    }

    /// Drop the claim lock and claim keys of an agent that is gone for good.
    pub fn forget_agent(&self, agent_id: &str) {
        self.agent_locks.remove(agent_id);
        self.claim_keys.retain(|(agent, _), _| agent != agent_id);
    }

    /// Agents with a claim lock and claim keys still remembered.
    pub fn claim_bookkeeping(&self) -> (usize, usize) {
        (self.agent_locks.len(), self.claim_keys.len())
    }

    /// Set a live agent idle or busy from the leases it holds.
    pub async fn refresh_agent_load(&self, agent_id: &str) -> DomainResult<()> {
        let Some(mut agent) = self.agents.get(agent_id).await? else {
            return Ok(());
        };
        // Stale agents get their status back on the next heartbeat
        if matches!(agent.status, AgentStatus::Stale | AgentStatus::Terminated) {
            return Ok(());
        }
        let held = self.agents.assignments_for_agent(agent_id).await?.len();
        let status = Agent::status_for_load(held);
        if agent.status != status {
            agent.status = status;
            self.agents.upsert(&agent).await?;
        }
        Ok(())
    }

    /// Read-modify-CAS loop on one task.
    ///
    /// `apply` runs against a fresh copy on every attempt. Nothing is written
    /// when it leaves the task unchanged.
    async fn mutate<F, R>(&self, task_id: Uuid, mut apply: F) -> DomainResult<(Task, R)>
    where
        F: FnMut(&mut Task) -> DomainResult<R> + Send,
        R: Send,
    {
        for _ in 0..self.config.cas_retries {
            let current = self.get(task_id).await?;
            let mut next = current.clone();
            let result = apply(&mut next)?;
            if next == current {
                return Ok((current, result));
            }

            let expected = current.version;
            next.version = expected + 1;
            if self.tasks.compare_and_swap(&next, expected).await? {
                return Ok((next, result));
            }
            debug!(task_id = %task_id, expected, "task version moved, retrying");
        }
        Err(DomainError::ConcurrencyConflict {
            entity: "task".to_string(),
            id: task_id.to_string(),
        })
    }

    /// Align an unheld task's ready/blocked status with the graph.
    async fn settle(&self, task_id: Uuid, now: DateTime<Utc>) -> DomainResult<Task> {
        let ready = self.graph.is_ready(task_id).await?;
        let (task, changed) = self
            .mutate(task_id, |t| {
                if !matches!(t.status, TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked) {
                    return Ok(false);
                }
                let before = t.status;
                t.settle(ready, now)?;
                Ok(t.status != before)
            })
            .await?;
        if changed {
            self.publish_readiness(&task).await;
        }
        Ok(task)
    }

    async fn publish_readiness(&self, task: &Task) {
        match task.status {
            TaskStatus::Ready => self.events.publish(SchedulerEvent::TaskReady { task_id: task.id }),
            TaskStatus::Blocked => {
                let waiting_on = self.graph.waiting_on(task.id).await.map_or(0, |w| w.len());
                self.events.publish(SchedulerEvent::TaskBlocked {
                    task_id: task.id,
                    waiting_on,
                });
            }
            _ => {}
        }
    }

    async fn live_agent(&self, agent_id: &str) -> DomainResult<Agent> {
        match self.agents.get(agent_id).await? {
            Some(agent) if !agent.is_terminated() => Ok(agent),
            _ => Err(DomainError::UnknownAgent(agent_id.to_string())),
        }
    }

    async fn replay_claim(&self, key: &(String, String)) -> DomainResult<Option<Task>> {
        let Some(task_id) = self.claim_keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        let task = self.get(task_id).await?;
        if task.status.is_held() && task.claimed_by.as_deref() == Some(key.0.as_str()) {
            debug!(task_id = %task_id, agent_id = %key.0, "claim replayed");
            return Ok(Some(task));
        }
        self.claim_keys.remove(key);
        Ok(None)
    }

    fn drop_claim_keys(&self, agent_id: &str, task_id: Uuid) {
        self.claim_keys
            .retain(|(agent, _), claimed| !(agent == agent_id && *claimed == task_id));
    }

    fn ensure_unclaimed(task: &Task) -> DomainResult<()> {
        if matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked | TaskStatus::Failed
        ) {
            return Ok(());
        }
        Err(DomainError::InvalidStateTransition {
            from: task.status.as_str().to_string(),
            to: TaskStatus::Blocked.as_str().to_string(),
            reason: "dependencies can only be added to tasks nobody holds".to_string(),
        })
    }

    async fn refresh_ticket(&self, ticket_id: Uuid) {
        if let Err(e) = self.tickets.refresh(ticket_id).await {
            warn!(ticket_id = %ticket_id, error = %e, "ticket rollup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryAgentRepository, InMemoryTaskRepository, InMemoryTicketRepository};
    use crate::domain::models::{EventEnvelope, TicketStatus};

    struct Harness {
        queue: TaskQueueService,
        agents: Arc<InMemoryAgentRepository>,
        tickets: Arc<TicketService>,
        events: Arc<EventBus>,
        ticket_id: Uuid,
    }

    async fn harness() -> Harness {
        let tasks: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let agents = Arc::new(InMemoryAgentRepository::new());
        let tickets = Arc::new(TicketService::new(Arc::new(InMemoryTicketRepository::new()), tasks.clone()));
        let events = Arc::new(EventBus::default());
        let queue = TaskQueueService::new(
            tasks.clone(),
            agents.clone(),
            Arc::new(DependencyGraph::new(tasks)),
            PriorityScorer::default(),
            tickets.clone(),
            events.clone(),
            TaskQueueConfig::default(),
        );
        let ticket_id = tickets.create("queue", TaskPriority::Medium).await.unwrap().id;
        Harness {
            queue,
            agents,
            tickets,
            events,
            ticket_id,
        }
    }

    impl Harness {
        async fn agent(&self, id: &str, capacity: u32) {
            self.agents.upsert(&Agent::new(id, capacity)).await.unwrap();
        }

        async fn task(&self, description: &str) -> Task {
            self.queue
                .create_task(NewTask::new(self.ticket_id, description))
                .await
                .unwrap()
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<SchedulerEvent> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.event);
        }
        out
    }

    #[tokio::test]
    async fn test_dependent_waits_for_blocker() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let t1 = h.task("parse").await;
        let t2 = h
            .queue
            .create_task(NewTask::new(h.ticket_id, "typecheck").depends_on(t1.id))
            .await
            .unwrap();
        assert_eq!(t1.status, TaskStatus::Ready);
        assert_eq!(t2.status, TaskStatus::Blocked);

        let claimed = h.queue.claim_next("a1", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, t1.id);

        let report = h.queue.complete(t1.id, None).await.unwrap();
        assert_eq!(report.unblocked, vec![t2.id]);
        assert_eq!(h.queue.get(t2.id).await.unwrap().status, TaskStatus::Ready);

        let next = h.queue.claim_next("a1", None).await.unwrap().unwrap();
        assert_eq!(next.id, t2.id);
    }

    #[tokio::test]
    async fn test_claim_returns_none_when_empty_or_at_capacity() {
        let h = harness().await;
        h.agent("a1", 1).await;
        assert!(h.queue.claim_next("a1", None).await.unwrap().is_none());

        h.task("one").await;
        h.task("two").await;
        assert!(h.queue.claim_next("a1", None).await.unwrap().is_some());
        assert!(h.queue.claim_next("a1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_rejects_unknown_agent() {
        let h = harness().await;
        h.task("one").await;
        assert!(matches!(
            h.queue.claim_next("ghost", None).await,
            Err(DomainError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_idempotency_key_replays() {
        let h = harness().await;
        h.agent("a1", 2).await;
        h.task("one").await;
        h.task("two").await;

        let first = h.queue.claim_next("a1", Some("req-1")).await.unwrap().unwrap();
        let again = h.queue.claim_next("a1", Some("req-1")).await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(h.agents.assignments_for_agent("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_claims_forget_their_keys() {
        let h = harness().await;
        h.agent("a1", 2).await;
        let one = h.task("one").await;
        let two = h.task("two").await;

        h.queue.claim_next("a1", Some("req-1")).await.unwrap().unwrap();
        h.queue.claim_next("a1", Some("req-2")).await.unwrap().unwrap();
        assert_eq!(h.queue.claim_bookkeeping(), (1, 2));

        h.queue.complete(one.id, None).await.unwrap();
        assert_eq!(h.queue.claim_bookkeeping(), (1, 1));
        h.queue.release(two.id, ReleaseReason::Manual).await.unwrap();
        assert_eq!(h.queue.claim_bookkeeping(), (1, 0));

        h.queue.forget_agent("a1");
        assert_eq!(h.queue.claim_bookkeeping(), (0, 0));
    }

    #[tokio::test]
    async fn test_creation_idempotency_key() {
        let h = harness().await;
        let first = h
            .queue
            .create_task(NewTask::new(h.ticket_id, "once").idempotency_key("k1"))
            .await
            .unwrap();
        let second = h
            .queue
            .create_task(NewTask::new(h.ticket_id, "once").idempotency_key("k1"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.queue.list(TaskFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_twice_is_noop() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let t1 = h.task("one").await;
        let t2 = h
            .queue
            .create_task(NewTask::new(h.ticket_id, "two").depends_on(t1.id))
            .await
            .unwrap();
        h.queue.claim_next("a1", None).await.unwrap();

        let first = h.queue.complete(t1.id, None).await.unwrap();
        let second = h.queue.complete(t1.id, None).await.unwrap();
        assert_eq!(first.unblocked, vec![t2.id]);
        assert!(second.unblocked.is_empty());
        assert_eq!(first.task.completion_seq, second.task.completion_seq);
        assert_eq!(second.task.version, first.task.version);
    }

    #[tokio::test]
    async fn test_failure_requeues_then_fails_past_budget() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h
            .queue
            .create_task(NewTask::new(h.ticket_id, "flaky").max_retries(1))
            .await
            .unwrap();

        h.queue.claim_next("a1", None).await.unwrap();
        let outcome = h.queue.fail(task.id, "connection reset", None).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Requeued);
        assert_eq!(h.queue.get(task.id).await.unwrap().retry_count, 1);

        h.queue.claim_next("a1", None).await.unwrap();
        let outcome = h.queue.fail(task.id, "connection reset", None).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Failed);

        let failed = h.queue.get(task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("connection reset"));
        assert_eq!(h.tickets.get(h.ticket_id).await.unwrap().status, TicketStatus::Blocked);
        assert!(h.agents.assignments_for_agent("a1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h.task("deploy").await;
        h.queue.claim_next("a1", None).await.unwrap();
        let outcome = h.queue.fail(task.id, "permission denied", None).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Failed);
    }

    #[tokio::test]
    async fn test_retry_resets_budget() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h.task("deploy").await;
        h.queue.claim_next("a1", None).await.unwrap();
        h.queue.fail(task.id, "boom", Some(false)).await.unwrap();

        let retried = h.queue.retry(task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Ready);
        assert_eq!(retried.retry_count, 0);
    }

    #[tokio::test]
    async fn test_release_of_completed_task_is_noop() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h.task("race").await;
        h.queue.claim_next("a1", None).await.unwrap();
        h.queue.complete(task.id, None).await.unwrap();

        let outcome = h.queue.release(task.id, ReleaseReason::Timeout).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::NoOp);
        assert_eq!(h.queue.get(task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_release_with_wrong_holder_is_noop() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h.task("held").await;
        h.queue.claim_next("a1", None).await.unwrap();

        let outcome = h
            .queue
            .release_at(task.id, Some("a2"), ReleaseReason::Timeout, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::NoOp);
        assert_eq!(h.queue.get(task.id).await.unwrap().claimed_by.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_cancel_held_task_lands_on_release() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h.task("long").await;
        h.queue.claim_next("a1", None).await.unwrap();
        h.queue.start(task.id, "a1").await.unwrap();

        assert_eq!(h.queue.cancel(task.id, None).await.unwrap(), CancelOutcome::Requested);
        assert!(h.queue.get(task.id).await.unwrap().cancel_requested);

        let outcome = h.queue.fail(task.id, "stopped", Some(true)).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Cancelled);
        assert_eq!(h.queue.get(task.id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_start_requires_claimant() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let task = h.task("one").await;
        h.queue.claim_next("a1", None).await.unwrap();
        assert!(matches!(
            h.queue.start(task.id, "a2").await,
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_dependency() {
        let h = harness().await;
        let t1 = h.task("one").await;
        let t2 = h.task("two").await;

        let blocked = h.queue.add_dependency(t1.id, t2.id).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert!(matches!(
            h.queue.add_dependency(t2.id, t1.id).await,
            Err(DomainError::DependencyCycle(_))
        ));

        let ready = h.queue.remove_dependency(t1.id, t2.id).await.unwrap();
        assert_eq!(ready.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_add_dependency_to_claimed_task_rejected() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let t1 = h.task("one").await;
        let t2 = h.task("two").await;
        let claimed = h.queue.claim_next("a1", None).await.unwrap().unwrap();
        let other = if claimed.id == t1.id { t2.id } else { t1.id };

        assert!(matches!(
            h.queue.add_dependency(other, claimed.id).await,
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let h = harness().await;
        h.agent("a1", 1).await;
        let mut rx = h.events.subscribe();
        let task = h.task("observed").await;
        h.queue.claim_next("a1", None).await.unwrap();
        h.queue.complete(task.id, None).await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events[0], SchedulerEvent::TaskCreated { .. }));
        assert!(matches!(events[1], SchedulerEvent::TaskReady { .. }));
        assert!(matches!(events[2], SchedulerEvent::TaskClaimed { attempt: 1, .. }));
        assert!(matches!(events[3], SchedulerEvent::TaskCompleted { .. }));
    }

    #[tokio::test]
    async fn test_create_requires_ticket() {
        let h = harness().await;
        assert!(matches!(
            h.queue.create_task(NewTask::new(Uuid::new_v4(), "orphan")).await,
            Err(DomainError::TicketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_dependency_leaves_no_task() {
        let h = harness().await;
        let result = h
            .queue
            .create_task(NewTask::new(h.ticket_id, "dangling").depends_on(Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(DomainError::UnknownDependency { .. })));
        assert!(h.queue.list(TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let h = harness().await;
        let t1 = h.task("one").await;
        h.queue
            .create_task(NewTask::new(h.ticket_id, "two").depends_on(t1.id))
            .await
            .unwrap();
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.counts.get(&TaskStatus::Blocked), Some(&1));
        assert_eq!(stats.blocked.len(), 1);
    }
}
