//! Task domain model.
//!
//! Tasks are atomic units of executable work. They form a DAG through
//! `depends_on` edges and move through a fixed status machine that only
//! the task queue service drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Status of a task in the scheduling pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, readiness not yet decided
    #[default]
    Pending,
    /// Every dependency is completed; claimable
    Ready,
    /// Exclusively held by one agent
    Claimed,
    /// The claiming agent reported that it started work
    Running,
    /// Finished successfully
    Completed,
    /// Retry budget exhausted or permanently failed
    Failed,
    /// Waiting on at least one incomplete dependency
    Blocked,
    /// Cancelled by an operator
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Ready,
        Self::Claimed,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Blocked,
        Self::Cancelled,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Claimed or running: an agent holds the task.
    pub const fn is_held(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::Ready, Self::Blocked, Self::Cancelled],
            Self::Ready => vec![Self::Claimed, Self::Blocked, Self::Cancelled],
            Self::Blocked => vec![Self::Ready, Self::Cancelled],
            Self::Claimed => vec![
                Self::Running,
                Self::Ready,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
            ],
            Self::Running => vec![Self::Ready, Self::Completed, Self::Failed, Self::Cancelled],
            // Operator retry
            Self::Failed => vec![Self::Ready, Self::Blocked],
            Self::Completed | Self::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority hint supplied at creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Normalized weight of the tier, in `[0, 1]`.
    pub const fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

/// Why a held task is being given back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The agent reported a failure. Counts against the retry budget.
    Failure { reason: String, retryable: bool },
    /// The assignment lease expired without a heartbeat.
    Timeout,
    /// Operator or agent termination.
    Manual,
}

impl ReleaseReason {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent_failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Failure { .. } => "failure",
            Self::Timeout => "timeout",
            Self::Manual => "manual",
        }
    }
}

/// What a release did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Back in the ready-set
    Requeued,
    /// Retry budget exhausted (or permanent failure); now terminal `failed`
    Failed,
    /// Cancellation had been requested; now terminal `cancelled`
    Cancelled,
    /// Task was not held; nothing changed
    NoOp,
}

/// What a cancel request did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was not held and is now `cancelled`
    Cancelled,
    /// The task is held; the agent sees `cancel_requested` on its next heartbeat
    Requested,
    /// Already terminal
    NoOp,
}

/// Reference to the output of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub base_ref: String,
    pub produced_ref: String,
}

/// A unit of executable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Tasks that must complete before this one is ready
    pub depends_on: Vec<Uuid>,
    /// Failed attempts counted against `max_retries`
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times this task was claimed
    pub attempts: u32,
    /// Releases caused by lease expiry
    pub timeout_releases: u32,
    pub claimed_by: Option<String>,
    pub cancel_requested: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub artifact: Option<ArtifactRef>,
    pub idempotency_key: Option<String>,
    /// Creation order, used as the FIFO tie-breaker
    pub sequence: u64,
    /// Completion order, used to order merges per base
    pub completion_seq: Option<u64>,
    /// Optimistic lock
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(ticket_id: Uuid, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            description: description.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            depends_on: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            attempts: 0,
            timeout_releases: 0,
            claimed_by: None,
            cancel_requested: false,
            deadline: None,
            last_error: None,
            artifact: None,
            idempotency_key: None,
            sequence: 0,
            completion_seq: None,
            version: 1,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) {
            self.depends_on.push(task_id);
        }
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub const fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.description.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "task description cannot be empty".to_string(),
            ));
        }
        if self.depends_on.contains(&self.id) {
            return Err(DomainError::DependencyCycle(vec![self.id, self.id]));
        }
        Ok(())
    }

    fn transition_to(&mut self, new_status: TaskStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
                reason: "transition not allowed".to_string(),
            });
        }
        self.status = new_status;
        self.updated_at = now;
        Ok(())
    }

    /// Readiness decided by the dependency graph after insertion.
    pub fn settle(&mut self, ready: bool, now: DateTime<Utc>) -> DomainResult<()> {
        let target = if ready { TaskStatus::Ready } else { TaskStatus::Blocked };
        if self.status == target {
            return Ok(());
        }
        self.transition_to(target, now)
    }

    pub fn claim(&mut self, agent_id: &str, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition_to(TaskStatus::Claimed, now)?;
        self.claimed_by = Some(agent_id.to_string());
        self.claimed_at = Some(now);
        self.attempts += 1;
        Ok(())
    }

    pub fn start(&mut self, agent_id: &str, now: DateTime<Utc>) -> DomainResult<()> {
        if self.claimed_by.as_deref() != Some(agent_id) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: TaskStatus::Running.as_str().to_string(),
                reason: format!("task is not claimed by {agent_id}"),
            });
        }
        self.transition_to(TaskStatus::Running, now)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Returns `false` when the task was already completed.
    pub fn complete(
        &mut self,
        artifact: Option<ArtifactRef>,
        completion_seq: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        if self.status == TaskStatus::Completed {
            return Ok(false);
        }
        self.transition_to(TaskStatus::Completed, now)?;
        self.claimed_by = None;
        self.cancel_requested = false;
        self.artifact = artifact;
        self.completion_seq = Some(completion_seq);
        self.completed_at = Some(now);
        Ok(true)
    }

    /// Give a held task back. A task that is not claimed or running is left untouched.
    pub fn release(&mut self, reason: &ReleaseReason, now: DateTime<Utc>) -> DomainResult<ReleaseOutcome> {
        if !self.status.is_held() {
            return Ok(ReleaseOutcome::NoOp);
        }

        self.claimed_by = None;
        self.claimed_at = None;
        self.started_at = None;

        if self.cancel_requested {
            self.cancel_requested = false;
            if let ReleaseReason::Failure { reason, .. } = reason {
                self.last_error = Some(reason.clone());
            }
            self.transition_to(TaskStatus::Cancelled, now)?;
            return Ok(ReleaseOutcome::Cancelled);
        }

        match reason {
            ReleaseReason::Failure { reason, retryable } => {
                self.retry_count += 1;
                self.last_error = Some(reason.clone());
                if !retryable || self.retry_count > self.max_retries {
                    self.transition_to(TaskStatus::Failed, now)?;
                    return Ok(ReleaseOutcome::Failed);
                }
            }
            ReleaseReason::Timeout => {
                self.timeout_releases += 1;
                self.last_error = Some("lease expired without heartbeat".to_string());
            }
            ReleaseReason::Manual => {}
        }

        self.transition_to(TaskStatus::Ready, now)?;
        Ok(ReleaseOutcome::Requeued)
    }

    pub fn cancel(&mut self, reason: Option<&str>, now: DateTime<Utc>) -> DomainResult<CancelOutcome> {
        if self.status.is_terminal() {
            return Ok(CancelOutcome::NoOp);
        }
        if self.status.is_held() {
            self.cancel_requested = true;
            self.updated_at = now;
            return Ok(CancelOutcome::Requested);
        }
        if let Some(reason) = reason {
            self.last_error = Some(reason.to_string());
        }
        self.transition_to(TaskStatus::Cancelled, now)?;
        Ok(CancelOutcome::Cancelled)
    }

    /// Operator retry of a terminally failed task with a fresh retry budget.
    pub fn reset_for_retry(&mut self, ready: bool, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::Failed {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: TaskStatus::Ready.as_str().to_string(),
                reason: "only failed tasks can be retried".to_string(),
            });
        }
        self.retry_count = 0;
        self.timeout_releases = 0;
        self.settle(ready, now)
    }

    /// 1-based number of the current attempt.
    pub const fn attempt_number(&self) -> u32 {
        self.attempts
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.created_at).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let secs = millis as f64 / 1000.0;
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed_task() -> Task {
        let mut task = Task::new(Uuid::new_v4(), "build parser").with_max_retries(1);
        task.settle(true, Utc::now()).unwrap();
        task.claim("agent-1", Utc::now()).unwrap();
        task
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_claim_requires_ready() {
        let mut task = Task::new(Uuid::new_v4(), "x");
        assert!(task.claim("a", Utc::now()).is_err());
        task.settle(true, Utc::now()).unwrap();
        task.claim("a", Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by.as_deref(), Some("a"));
        assert_eq!(task.attempt_number(), 1);
    }

    #[test]
    fn test_only_claimant_can_start() {
        let mut task = claimed_task();
        assert!(task.start("agent-2", Utc::now()).is_err());
        task.start("agent-1", Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn test_failure_release_exhausts_budget() {
        let mut task = claimed_task();
        let outcome = task.release(&ReleaseReason::failure("boom"), Utc::now()).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Requeued);
        assert_eq!(task.retry_count, 1);

        task.claim("agent-1", Utc::now()).unwrap();
        let outcome = task.release(&ReleaseReason::failure("boom again"), Utc::now()).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Failed);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let mut task = claimed_task().with_max_retries(5);
        let outcome = task
            .release(&ReleaseReason::permanent_failure("permission denied"), Utc::now())
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::Failed);
    }

    #[test]
    fn test_timeout_release_does_not_touch_retry_count() {
        let mut task = claimed_task();
        let outcome = task.release(&ReleaseReason::Timeout, Utc::now()).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Requeued);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.timeout_releases, 1);
        assert!(task.claimed_by.is_none());
    }

    #[test]
    fn test_release_of_completed_task_is_noop() {
        let mut task = claimed_task();
        assert!(task.complete(None, 1, Utc::now()).unwrap());
        let outcome = task.release(&ReleaseReason::Timeout, Utc::now()).unwrap();
        assert_eq!(outcome, ReleaseOutcome::NoOp);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_second_complete_reports_noop() {
        let mut task = claimed_task();
        assert!(task.complete(None, 7, Utc::now()).unwrap());
        assert!(!task.complete(None, 8, Utc::now()).unwrap());
        assert_eq!(task.completion_seq, Some(7));
    }

    #[test]
    fn test_cancel_held_task_sets_flag_then_lands_cancelled() {
        let mut task = claimed_task();
        assert_eq!(task.cancel(None, Utc::now()).unwrap(), CancelOutcome::Requested);
        assert!(task.cancel_requested);
        assert_eq!(task.status, TaskStatus::Claimed);

        let outcome = task.release(&ReleaseReason::Timeout, Utc::now()).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Cancelled);
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_retry_resets_budget() {
        let mut task = claimed_task();
        task.release(&ReleaseReason::permanent_failure("x"), Utc::now()).unwrap();
        task.reset_for_retry(true, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut task = Task::new(Uuid::new_v4(), "x");
        task.depends_on.push(task.id);
        assert!(matches!(task.validate(), Err(DomainError::DependencyCycle(_))));
    }
}
