//! Dependency graph store.
//!
//! Keeps an in-memory index of the task DAG: for each task, its blockers,
//! its dependents, and how many blockers are still incomplete. Readiness is
//! answered from the index; edges are persisted through the task repository
//! and this is the only component that writes them.
//!
//! The graph does not touch task status. Methods that can make tasks ready
//! return the newly-ready ids and the task queue flips their status and
//! publishes `TaskReady`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::TaskStatus;
use crate::domain::ports::{DependencyEdge, TaskFilter, TaskRepository};

#[derive(Debug, Default, Clone)]
struct Node {
    depends_on: HashSet<Uuid>,
    dependents: HashSet<Uuid>,
    unsatisfied: usize,
    completed: bool,
}

/// Breadth-first search along dependent edges. Returns the path `from .. to`.
fn find_path(nodes: &HashMap<Uuid, Node>, from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
    let mut parents: HashMap<Uuid, Uuid> = HashMap::new();
    let mut seen = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);

    while let Some(id) = queue.pop_front() {
        if id == to {
            let mut path = vec![to];
            let mut cursor = to;
            while let Some(&parent) = parents.get(&cursor) {
                path.push(parent);
                cursor = parent;
            }
            path.reverse();
            return Some(path);
        }
        if let Some(node) = nodes.get(&id) {
            for &next in &node.dependents {
                if seen.insert(next) {
                    parents.insert(next, id);
                    queue.push_back(next);
                }
            }
        }
    }
    None
}

/// A task that is waiting on incomplete blockers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BlockedTask {
    pub task_id: Uuid,
    pub waiting_on: Vec<Uuid>,
}

pub struct DependencyGraph {
    repo: Arc<dyn TaskRepository>,
    nodes: RwLock<HashMap<Uuid, Node>>,
}

impl DependencyGraph {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self {
            repo,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the index from persisted tasks and edges.
    pub async fn hydrate(repo: Arc<dyn TaskRepository>) -> DomainResult<Self> {
        let tasks = repo.list(TaskFilter::default()).await?;
        let edges = repo.list_dependencies().await?;

        let mut nodes: HashMap<Uuid, Node> = tasks
            .iter()
            .map(|t| {
                (
                    t.id,
                    Node {
                        completed: t.status == TaskStatus::Completed,
                        ..Node::default()
                    },
                )
            })
            .collect();

        for edge in &edges {
            let blocker_done = nodes.get(&edge.blocker).is_some_and(|n| n.completed);
            if let Some(blocker) = nodes.get_mut(&edge.blocker) {
                blocker.dependents.insert(edge.blocked);
            }
            if let Some(blocked) = nodes.get_mut(&edge.blocked) {
                blocked.depends_on.insert(edge.blocker);
                if !blocker_done {
                    blocked.unsatisfied += 1;
                }
            }
        }

        debug!(tasks = nodes.len(), edges = edges.len(), "dependency graph hydrated");
        Ok(Self {
            repo,
            nodes: RwLock::new(nodes),
        })
    }

    /// Insert a task with its blockers and persist the edges.
    ///
    /// Returns whether the task is immediately ready. Fails with
    /// `DependencyCycle` if any new edge would close a cycle, and leaves the
    /// graph unchanged on any error.
    #[instrument(skip(self, depends_on), err)]
    pub async fn add_task(&self, task_id: Uuid, depends_on: &[Uuid]) -> DomainResult<bool> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&task_id) {
            return Err(DomainError::ValidationFailed(format!(
                "task {task_id} is already in the dependency graph"
            )));
        }

        let blockers: HashSet<Uuid> = depends_on.iter().copied().collect();
        for &blocker in &blockers {
            if blocker == task_id {
                return Err(DomainError::DependencyCycle(vec![task_id, task_id]));
            }
            if !nodes.contains_key(&blocker) {
                return Err(DomainError::UnknownDependency {
                    task: task_id,
                    dependency: blocker,
                });
            }
        }
        // A fresh node has no dependents, so the reachability check from it
        // back to any blocker only fails for self-edges handled above.

        let mut written = Vec::new();
        for &blocker in &blockers {
            let edge = DependencyEdge {
                blocker,
                blocked: task_id,
            };
            if let Err(e) = self.repo.add_dependency(edge).await {
                for edge in written {
                    if let Err(undo) = self.repo.remove_dependency(edge).await {
                        warn!(
                            blocker = %edge.blocker,
                            blocked = %edge.blocked,
                            error = %undo,
                            "failed to roll back dependency edge"
                        );
                    }
                }
                return Err(e);
            }
            written.push(edge);
        }

        let unsatisfied = blockers
            .iter()
            .filter(|b| !nodes.get(b).is_some_and(|n| n.completed))
            .count();
        for &blocker in &blockers {
            if let Some(node) = nodes.get_mut(&blocker) {
                node.dependents.insert(task_id);
            }
        }
        nodes.insert(
            task_id,
            Node {
                depends_on: blockers,
                dependents: HashSet::new(),
                unsatisfied,
                completed: false,
            },
        );
        Ok(unsatisfied == 0)
    }

    /// Insert the edge `blocker -> blocked`.
    ///
    /// Returns `true` when the blocked task was ready and no longer is.
    #[instrument(skip(self), err)]
    pub async fn add_dependency(&self, blocker: Uuid, blocked: Uuid) -> DomainResult<bool> {
        let mut nodes = self.nodes.write().await;
        for id in [blocker, blocked] {
            if !nodes.contains_key(&id) {
                return Err(DomainError::TaskNotFound(id));
            }
        }
        if blocker == blocked {
            return Err(DomainError::DependencyCycle(vec![blocker, blocker]));
        }
        if nodes.get(&blocked).is_some_and(|n| n.depends_on.contains(&blocker)) {
            return Ok(false);
        }
        if let Some(path) = find_path(&nodes, blocked, blocker) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(blocker);
            cycle.extend(path);
            return Err(DomainError::DependencyCycle(cycle));
        }

        self.repo.add_dependency(DependencyEdge { blocker, blocked }).await?;

        let blocker_done = nodes.get(&blocker).is_some_and(|n| n.completed);
        if let Some(node) = nodes.get_mut(&blocker) {
            node.dependents.insert(blocked);
        }
        let mut became_blocked = false;
        if let Some(node) = nodes.get_mut(&blocked) {
            node.depends_on.insert(blocker);
            if !blocker_done {
                became_blocked = node.unsatisfied == 0;
                node.unsatisfied += 1;
            }
        }
        Ok(became_blocked)
    }

    /// Drop the edge `blocker -> blocked`.
    ///
    /// Returns `true` when the blocked task became ready.
    #[instrument(skip(self), err)]
    pub async fn remove_dependency(&self, blocker: Uuid, blocked: Uuid) -> DomainResult<bool> {
        let mut nodes = self.nodes.write().await;
        if !nodes.get(&blocked).is_some_and(|n| n.depends_on.contains(&blocker)) {
            return Err(DomainError::ValidationFailed(format!(
                "task {blocked} does not depend on {blocker}"
            )));
        }

        self.repo.remove_dependency(DependencyEdge { blocker, blocked }).await?;

        let blocker_done = nodes.get(&blocker).is_some_and(|n| n.completed);
        if let Some(node) = nodes.get_mut(&blocker) {
            node.dependents.remove(&blocked);
        }
        let mut became_ready = false;
        if let Some(node) = nodes.get_mut(&blocked) {
            node.depends_on.remove(&blocker);
            if !blocker_done {
                node.unsatisfied = node.unsatisfied.saturating_sub(1);
                became_ready = node.unsatisfied == 0 && !node.completed;
            }
        }
        Ok(became_ready)
    }

    /// Mark a task completed and return the dependents whose last blocker it was.
    ///
    /// Calling it again for the same task returns an empty set.
    #[instrument(skip(self), err)]
    pub async fn mark_completed(&self, task_id: Uuid) -> DomainResult<HashSet<Uuid>> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&task_id).ok_or(DomainError::TaskNotFound(task_id))?;
        if node.completed {
            return Ok(HashSet::new());
        }
        node.completed = true;
        let dependents: Vec<Uuid> = node.dependents.iter().copied().collect();

        let mut newly_ready = HashSet::new();
        for dependent in dependents {
            if let Some(node) = nodes.get_mut(&dependent) {
                if node.unsatisfied > 0 {
                    node.unsatisfied -= 1;
                    if node.unsatisfied == 0 && !node.completed {
                        newly_ready.insert(dependent);
                    }
                }
            }
        }
        debug!(%task_id, unblocked = newly_ready.len(), "task completed in graph");
        Ok(newly_ready)
    }

    /// Every blocker of the task is completed.
    pub async fn is_ready(&self, task_id: Uuid) -> DomainResult<bool> {
        let nodes = self.nodes.read().await;
        nodes
            .get(&task_id)
            .map(|n| n.unsatisfied == 0)
            .ok_or(DomainError::TaskNotFound(task_id))
    }

    pub async fn contains(&self, task_id: Uuid) -> bool {
        self.nodes.read().await.contains_key(&task_id)
    }

    /// Blockers of the task that have not completed.
    pub async fn waiting_on(&self, task_id: Uuid) -> DomainResult<Vec<Uuid>> {
        let nodes = self.nodes.read().await;
        let node = nodes.get(&task_id).ok_or(DomainError::TaskNotFound(task_id))?;
        let mut waiting: Vec<Uuid> = node
            .depends_on
            .iter()
            .filter(|b| !nodes.get(b).is_some_and(|n| n.completed))
            .copied()
            .collect();
        waiting.sort();
        Ok(waiting)
    }

    /// Number of incomplete tasks each of `task_ids` directly unblocks.
    pub async fn dependents_counts(&self, task_ids: &[Uuid]) -> HashMap<Uuid, usize> {
        let nodes = self.nodes.read().await;
        task_ids
            .iter()
            .map(|id| {
                let count = nodes.get(id).map_or(0, |n| {
                    n.dependents
                        .iter()
                        .filter(|d| !nodes.get(d).is_some_and(|dn| dn.completed))
                        .count()
                });
                (*id, count)
            })
            .collect()
    }

    /// Incomplete tasks that still wait on at least one blocker.
    pub async fn blocked_tasks(&self) -> Vec<BlockedTask> {
        let nodes = self.nodes.read().await;
        let mut blocked: Vec<BlockedTask> = nodes
            .iter()
            .filter(|(_, n)| !n.completed && n.unsatisfied > 0)
            .map(|(id, n)| {
                let mut waiting_on: Vec<Uuid> = n
                    .depends_on
                    .iter()
                    .filter(|b| !nodes.get(b).is_some_and(|bn| bn.completed))
                    .copied()
                    .collect();
                waiting_on.sort();
                BlockedTask {
                    task_id: *id,
                    waiting_on,
                }
            })
            .collect();
        blocked.sort_by_key(|b| b.task_id);
        blocked
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}
