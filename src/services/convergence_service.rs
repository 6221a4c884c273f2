//! Convergence of completed work onto shared bases.
//!
//! Every completed task with an artifact becomes a [`MergeUnit`]. Units are
//! merged one base at a time under a per-base mutex, and always in task
//! completion order: submitting a unit first merges every pending unit on
//! the same base that completed before it. Conflicts are recorded on the
//! unit and wait for an explicit [`Resolution`]; they never block other bases.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ConflictStatus, MergeResult, MergeStats, MergeUnit, MergeUnitState, Resolution, SchedulerEvent, Task,
    TaskStatus,
};
use crate::domain::ports::{MergeBackend, MergeOutcome, MergeUnitRepository};
use crate::services::circuit_breaker::CircuitScope;
use crate::services::event_bus::EventBus;
use crate::services::retry::{CallOutcome, ResilientExecutor, RetryError};

pub struct ConvergenceService {
    units: Arc<dyn MergeUnitRepository>,
    backend: Arc<dyn MergeBackend>,
    executor: Arc<ResilientExecutor>,
    events: Arc<EventBus>,
    lock_wait: Duration,
    base_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConvergenceService {
    pub fn new(
        units: Arc<dyn MergeUnitRepository>,
        backend: Arc<dyn MergeBackend>,
        executor: Arc<ResilientExecutor>,
        events: Arc<EventBus>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            units,
            backend,
            executor,
            events,
            lock_wait,
            base_locks: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn MergeBackend> {
        &self.backend
    }

    /// Record the artifact of a completed task as a pending merge unit.
    ///
    /// Returns the existing unit if the task already has one, and `None`
    /// when the task carries no artifact.
    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    pub async fn enqueue(&self, task: &Task) -> DomainResult<Option<MergeUnit>> {
        let (Some(artifact), Some(seq)) = (&task.artifact, task.completion_seq) else {
            return Ok(None);
        };
        if let Some(existing) = self.units.get_by_task(task.id).await? {
            return Ok(Some(existing));
        }
        let unit = MergeUnit::new(task.id, &artifact.base_ref, &artifact.produced_ref, seq);
        self.units.save(&unit).await?;
        info!(
            merge_unit_id = %unit.id,
            base_ref = %unit.base_ref,
            completion_seq = seq,
            "merge unit enqueued"
        );
        Ok(Some(unit))
    }

    /// Merge the task's output into `base_ref`.
    ///
    /// Pending units on the same base that completed earlier are merged first.
    /// Resubmitting a unit that is already merged or conflicted returns its
    /// recorded result.
    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    pub async fn submit(&self, task: &Task, base_ref: &str, produced_ref: &str) -> DomainResult<MergeResult> {
        let Some(completion_seq) = task.completion_seq.filter(|_| task.status == TaskStatus::Completed) else {
            return Err(DomainError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: "merged".to_string(),
                reason: "only completed tasks can be merged".to_string(),
            });
        };
        if base_ref.trim().is_empty() || produced_ref.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "base_ref and produced_ref are required".to_string(),
            ));
        }

        let unit = match self.units.get_by_task(task.id).await? {
            Some(unit) if unit.base_ref != base_ref || unit.produced_ref != produced_ref => {
                return Err(DomainError::ValidationFailed(format!(
                    "task {} already submitted {} onto {}",
                    task.id, unit.produced_ref, unit.base_ref
                )));
            }
            Some(unit) => unit,
            None => {
                let unit = MergeUnit::new(task.id, base_ref, produced_ref, completion_seq);
                self.units.save(&unit).await?;
                unit
            }
        };

        if unit.state != MergeUnitState::Pending {
            return Ok(MergeResult::from_unit(&unit));
        }

        let Some(_guard) = self.lock_base(base_ref).await else {
            return Ok(self.lock_timeout_result(&unit));
        };

        let pending = self.pending_on(base_ref).await?;
        for earlier in pending
            .into_iter()
            .filter(|u| (u.completion_seq, u.id) < (unit.completion_seq, unit.id))
        {
            // An earlier unit that cannot merge stays behind; it never holds up this one
            let (earlier_id, produced) = (earlier.id, earlier.produced_ref.clone());
            if let Err(e) = self.merge_locked(earlier, &produced, false).await {
                warn!(
                    merge_unit_id = %earlier_id,
                    base_ref = %base_ref,
                    error = %e,
                    "earlier merge unit failed, continuing"
                );
            }
        }
        let current = self
            .units
            .get(unit.id)
            .await?
            .ok_or(DomainError::MergeUnitNotFound(unit.id))?;
        if current.state == MergeUnitState::Pending {
            self.merge_locked(current, produced_ref, false).await?;
        }

        let unit = self
            .units
            .get(unit.id)
            .await?
            .ok_or(DomainError::MergeUnitNotFound(unit.id))?;
        Ok(MergeResult::from_unit(&unit))
    }

    /// Explicitly close out a unit.
    ///
    /// Conflicted units may be merged from another ref or abandoned. Pending
    /// units may only be abandoned, which is how an operator drops work that
    /// can never merge.
    #[instrument(skip(self, resolution), err)]
    pub async fn resolve(&self, unit_id: Uuid, resolution: Resolution) -> DomainResult<MergeResult> {
        let unit = self.get(unit_id).await?;
        let allowed = match &resolution {
            Resolution::Abandon { .. } => {
                matches!(unit.state, MergeUnitState::Conflicted | MergeUnitState::Pending)
            }
            Resolution::Merge { .. } => unit.state == MergeUnitState::Conflicted,
        };
        if !allowed {
            return Err(DomainError::InvalidStateTransition {
                from: unit.state.as_str().to_string(),
                to: "resolved".to_string(),
                reason: "only conflicted or pending merge units can be resolved".to_string(),
            });
        }

        match resolution {
            Resolution::Abandon { reason } => {
                // A pending unit may be mid-merge inside a submit
                let Some(_guard) = self.lock_base(&unit.base_ref).await else {
                    return Ok(self.lock_timeout_result(&unit));
                };
                let mut unit = self.get(unit_id).await?;
                if !matches!(unit.state, MergeUnitState::Conflicted | MergeUnitState::Pending) {
                    return Ok(MergeResult::from_unit(&unit));
                }
                unit.state = MergeUnitState::Abandoned;
                unit.conflict_status = ConflictStatus::Unresolved;
                if reason.is_some() {
                    unit.conflict_details = reason;
                }
                unit.closed_at = Some(Utc::now());
                self.units.save(&unit).await?;
                warn!(merge_unit_id = %unit.id, base_ref = %unit.base_ref, "merge unit abandoned");
                self.publish(&unit);
                Ok(MergeResult::from_unit(&unit))
            }
            Resolution::Merge { resolved_ref } => {
                if resolved_ref.trim().is_empty() {
                    return Err(DomainError::ValidationFailed("resolved_ref is required".to_string()));
                }
                let base_ref = unit.base_ref.clone();
                let Some(_guard) = self.lock_base(&base_ref).await else {
                    return Ok(self.lock_timeout_result(&unit));
                };
                let unit = self.merge_locked(unit, &resolved_ref, true).await?;
                Ok(MergeResult::from_unit(&unit))
            }
        }
    }

    pub async fn get(&self, unit_id: Uuid) -> DomainResult<MergeUnit> {
        self.units
            .get(unit_id)
            .await?
            .ok_or(DomainError::MergeUnitNotFound(unit_id))
    }

    pub async fn get_by_task(&self, task_id: Uuid) -> DomainResult<Option<MergeUnit>> {
        self.units.get_by_task(task_id).await
    }

    /// Units waiting for explicit resolution.
    pub async fn conflicts(&self) -> DomainResult<Vec<MergeUnit>> {
        self.units.list(Some(MergeUnitState::Conflicted)).await
    }

    pub async fn stats(&self) -> DomainResult<MergeStats> {
        let mut stats = MergeStats::default();
        for unit in self.units.list(None).await? {
            match unit.state {
                MergeUnitState::Pending => stats.pending += 1,
                MergeUnitState::Merged => stats.merged += 1,
                MergeUnitState::Conflicted => stats.conflicted += 1,
                MergeUnitState::Abandoned => stats.abandoned += 1,
            }
            if unit.conflict_status == ConflictStatus::Resolved {
                stats.resolved += 1;
            }
        }
        Ok(stats)
    }

    async fn pending_on(&self, base_ref: &str) -> DomainResult<Vec<MergeUnit>> {
        Ok(self
            .units
            .list(Some(MergeUnitState::Pending))
            .await?
            .into_iter()
            .filter(|u| u.base_ref == base_ref)
            .collect())
    }

    /// Wait for the base mutex, bounded by the configured lock wait.
    async fn lock_base(&self, base_ref: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .base_locks
            .entry(base_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        tokio::time::timeout(self.lock_wait, lock.lock_owned()).await.ok()
    }

    /// Surface a lock timeout as a conflict. The unit itself is left as it was.
    fn lock_timeout_result(&self, unit: &MergeUnit) -> MergeResult {
        warn!(
            merge_unit_id = %unit.id,
            base_ref = %unit.base_ref,
            wait_secs = self.lock_wait.as_secs(),
            "timed out waiting for merge lock"
        );
        let mut result = MergeResult::from_unit(unit);
        result.status = ConflictStatus::Detected;
        result.conflict_details = Some(format!(
            "timed out after {}s waiting for the merge lock on '{}'",
            self.lock_wait.as_secs(),
            unit.base_ref
        ));
        result
    }

    /// Merge one unit. The caller holds the base lock.
    async fn merge_locked(&self, mut unit: MergeUnit, produced_ref: &str, resolving: bool) -> DomainResult<MergeUnit> {
        let base_ref = unit.base_ref.clone();
        let head = self.backend.head(&base_ref).await?;
        let key = format!("{}:{}:{}", unit.id, produced_ref, head.as_deref().unwrap_or("-"));

        let backend = self.backend.clone();
        let outcome = self
            .executor
            .execute(CircuitScope::merge(&base_ref), Some(&key), || {
                let backend = backend.clone();
                let base_ref = base_ref.clone();
                let produced_ref = produced_ref.to_string();
                async move { CallOutcome::from_result(backend.merge(&base_ref, &produced_ref).await) }
            })
            .await;

        unit.produced_ref = produced_ref.to_string();
        match outcome {
            Ok(MergeOutcome::Merged { new_head }) => {
                unit.state = MergeUnitState::Merged;
                unit.conflict_status = if resolving {
                    ConflictStatus::Resolved
                } else {
                    ConflictStatus::None
                };
                unit.merged_head = Some(new_head);
                unit.closed_at = Some(Utc::now());
                info!(
                    merge_unit_id = %unit.id,
                    base_ref = %base_ref,
                    new_head = unit.merged_head.as_deref().unwrap_or_default(),
                    "merge unit merged"
                );
            }
            Ok(MergeOutcome::Conflict { paths, details }) => {
                unit.state = MergeUnitState::Conflicted;
                unit.conflict_status = ConflictStatus::Detected;
                unit.conflict_details = Some(details);
                unit.conflicting_paths = paths;
                unit.base_head_at_conflict = head;
                warn!(
                    merge_unit_id = %unit.id,
                    base_ref = %base_ref,
                    paths = ?unit.conflicting_paths,
                    "merge conflict detected"
                );
            }
            Err(RetryError::Fatal(e)) => {
                unit.state = MergeUnitState::Conflicted;
                unit.conflict_status = ConflictStatus::Detected;
                unit.conflict_details = Some(e.to_string());
                unit.base_head_at_conflict = head;
                warn!(merge_unit_id = %unit.id, base_ref = %base_ref, error = %e, "merge failed permanently");
            }
            Err(e) => return Err(e.into()),
        }

        self.units.save(&unit).await?;
        self.publish(&unit);
        Ok(unit)
    }

    fn publish(&self, unit: &MergeUnit) {
        self.events.publish(SchedulerEvent::MergeCompleted {
            merge_unit_id: unit.id,
            base_ref: unit.base_ref.clone(),
            status: unit.conflict_status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryMergeUnitRepository;
    use crate::adapters::merge::SnapshotMergeBackend;
    use crate::domain::models::{ArtifactRef, RetryConfig};
    use crate::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerService};

    struct Harness {
        service: ConvergenceService,
        backend: Arc<SnapshotMergeBackend>,
    }

    fn harness() -> Harness {
        harness_with_wait(Duration::from_secs(5))
    }

    fn harness_with_wait(lock_wait: Duration) -> Harness {
        let backend = Arc::new(SnapshotMergeBackend::new());
        let executor = Arc::new(ResilientExecutor::new(
            &RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter_ms: 0,
                ..RetryConfig::default()
            },
            Arc::new(CircuitBreakerService::new(CircuitBreakerConfig::default())),
        ));
        let service = ConvergenceService::new(
            Arc::new(InMemoryMergeUnitRepository::new()),
            backend.clone(),
            executor,
            Arc::new(EventBus::default()),
            lock_wait,
        );
        Harness { service, backend }
    }

    fn completed(seq: u64, base: &str, produced: &str) -> Task {
        let mut task = Task::new(Uuid::new_v4(), format!("task {seq}"));
        task.status = TaskStatus::Completed;
        task.completion_seq = Some(seq);
        task.artifact = Some(ArtifactRef {
            base_ref: base.to_string(),
            produced_ref: produced.to_string(),
        });
        task
    }

    #[tokio::test]
    async fn test_submit_processes_earlier_completions_first() {
        let h = harness();
        h.backend.commit("main", &[("lib.rs", Some("v0"))]).await;
        h.backend.branch("first", "main").await.unwrap();
        h.backend.commit("first", &[("lib.rs", Some("v1"))]).await;
        h.backend.branch("second", "first").await.unwrap();
        h.backend.commit("second", &[("lib.rs", Some("v2"))]).await;

        let t1 = completed(1, "main", "first");
        let t2 = completed(2, "main", "second");
        h.service.enqueue(&t1).await.unwrap();
        h.service.enqueue(&t2).await.unwrap();

        // Applying "second" first would still fast-forward, but order must follow completion
        let r2 = h.service.submit(&t2, "main", "second").await.unwrap();
        assert_eq!(r2.status, ConflictStatus::None);
        let u1 = h.service.get_by_task(t1.id).await.unwrap().unwrap();
        assert_eq!(u1.state, MergeUnitState::Merged);
        assert_eq!(h.backend.read("main", "lib.rs").await.as_deref(), Some("v2"));

        let r1 = h.service.submit(&t1, "main", "first").await.unwrap();
        assert_eq!(r1.merge_unit_id, u1.id);
        assert_eq!(r1.status, ConflictStatus::None);
    }

    #[tokio::test]
    async fn test_conflict_requires_resolution() {
        let h = harness();
        h.backend.commit("main", &[("a", Some("0"))]).await;
        h.backend.branch("x", "main").await.unwrap();
        h.backend.branch("y", "main").await.unwrap();
        h.backend.commit("x", &[("a", Some("1"))]).await;
        h.backend.commit("y", &[("a", Some("2"))]).await;

        let tx = completed(1, "main", "x");
        let ty = completed(2, "main", "y");
        h.service.submit(&tx, "main", "x").await.unwrap();
        let result = h.service.submit(&ty, "main", "y").await.unwrap();
        assert!(result.is_conflict());
        assert_eq!(result.conflicting_paths, vec!["a".to_string()]);
        assert!(matches!(
            result.clone().into_result(),
            Err(DomainError::MergeConflict { .. })
        ));
        assert_eq!(h.service.conflicts().await.unwrap().len(), 1);

        // Rebased branch resolves it
        h.backend.branch("y-rebased", "main").await.unwrap();
        h.backend.commit("y-rebased", &[("a", Some("12"))]).await;
        let resolved = h
            .service
            .resolve(
                result.merge_unit_id,
                Resolution::Merge {
                    resolved_ref: "y-rebased".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(h.backend.read("main", "a").await.as_deref(), Some("12"));

        let stats = h.service.stats().await.unwrap();
        assert_eq!(stats.merged, 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.conflicted, 0);
    }

    #[tokio::test]
    async fn test_abandon_marks_unresolved() {
        let h = harness();
        h.backend.commit("main", &[("a", Some("0"))]).await;
        h.backend.branch("x", "main").await.unwrap();
        h.backend.branch("y", "main").await.unwrap();
        h.backend.commit("x", &[("a", Some("1"))]).await;
        h.backend.commit("y", &[("a", Some("2"))]).await;
        h.service.submit(&completed(1, "main", "x"), "main", "x").await.unwrap();
        let conflict = h.service.submit(&completed(2, "main", "y"), "main", "y").await.unwrap();

        let abandoned = h
            .service
            .resolve(conflict.merge_unit_id, Resolution::Abandon { reason: None })
            .await
            .unwrap();
        assert_eq!(abandoned.status, ConflictStatus::Unresolved);
        assert!(h
            .service
            .resolve(conflict.merge_unit_id, Resolution::Abandon { reason: None })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_conflict_does_not_block_other_bases() {
        let h = harness();
        h.backend.commit("main", &[("a", Some("0"))]).await;
        h.backend.commit("release", &[("r", Some("0"))]).await;
        h.backend.branch("x", "main").await.unwrap();
        h.backend.branch("y", "main").await.unwrap();
        h.backend.branch("hotfix", "release").await.unwrap();
        h.backend.commit("x", &[("a", Some("1"))]).await;
        h.backend.commit("y", &[("a", Some("2"))]).await;
        h.backend.commit("hotfix", &[("r", Some("1"))]).await;

        h.service.submit(&completed(1, "main", "x"), "main", "x").await.unwrap();
        let conflict = h.service.submit(&completed(2, "main", "y"), "main", "y").await.unwrap();
        assert!(conflict.is_conflict());

        let other = h
            .service
            .submit(&completed(3, "release", "hotfix"), "release", "hotfix")
            .await
            .unwrap();
        assert_eq!(other.status, ConflictStatus::None);
    }

    #[tokio::test]
    async fn test_submit_requires_completed_task() {
        let h = harness();
        let task = Task::new(Uuid::new_v4(), "not done");
        assert!(matches!(
            h.service.submit(&task, "main", "x").await,
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_ref_is_conflicted_not_retried() {
        let h = harness();
        h.backend.commit("main", &[("a", Some("0"))]).await;
        let task = completed(1, "main", "missing");

        let result = h.service.submit(&task, "main", "missing").await.unwrap();
        assert_eq!(result.status, ConflictStatus::Detected);
        assert!(result.conflict_details.unwrap().contains("missing"));

        let unit = h.service.get_by_task(task.id).await.unwrap().unwrap();
        assert_eq!(unit.state, MergeUnitState::Conflicted);
        assert_eq!(h.service.stats().await.unwrap().conflicted, 1);
    }

    #[tokio::test]
    async fn test_broken_earlier_unit_does_not_block_later_submit() {
        let h = harness();
        h.backend.commit("main", &[("a", Some("0"))]).await;
        h.backend.branch("good", "main").await.unwrap();
        h.backend.commit("good", &[("b", Some("1"))]).await;

        let broken = completed(1, "main", "gdoo");
        let good = completed(2, "main", "good");
        h.service.enqueue(&broken).await.unwrap();
        h.service.enqueue(&good).await.unwrap();

        for _ in 0..3 {
            let result = h.service.submit(&good, "main", "good").await.unwrap();
            assert_eq!(result.status, ConflictStatus::None);
        }
        assert_eq!(h.backend.read("main", "b").await.as_deref(), Some("1"));
        let broken_unit = h.service.get_by_task(broken.id).await.unwrap().unwrap();
        assert_eq!(broken_unit.state, MergeUnitState::Conflicted);
    }

    #[tokio::test]
    async fn test_pending_unit_can_be_abandoned_but_not_merged() {
        let h = harness();
        let task = completed(1, "main", "x");
        let unit = h.service.enqueue(&task).await.unwrap().unwrap();

        let err = h
            .service
            .resolve(
                unit.id,
                Resolution::Merge {
                    resolved_ref: "y".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        let result = h
            .service
            .resolve(
                unit.id,
                Resolution::Abandon {
                    reason: Some("branch was deleted".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, ConflictStatus::Unresolved);
        assert_eq!(h.service.get(unit.id).await.unwrap().state, MergeUnitState::Abandoned);
        assert_eq!(h.service.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces_as_detected_and_keeps_unit_pending() {
        let h = harness_with_wait(Duration::from_millis(20));
        h.backend.commit("main", &[("a", Some("0"))]).await;
        h.backend.branch("x", "main").await.unwrap();
        h.backend.commit("x", &[("b", Some("1"))]).await;
        let task = completed(1, "main", "x");

        let held = h.service.lock_base("main").await.unwrap();
        let result = h.service.submit(&task, "main", "x").await.unwrap();
        assert_eq!(result.status, ConflictStatus::Detected);
        assert!(result.conflict_details.unwrap().contains("merge lock"));
        assert_eq!(
            h.service.get_by_task(task.id).await.unwrap().unwrap().state,
            MergeUnitState::Pending
        );

        drop(held);
        let retried = h.service.submit(&task, "main", "x").await.unwrap();
        assert_eq!(retried.status, ConflictStatus::None);
    }
}
