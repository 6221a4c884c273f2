use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::{DependencyEdge, TaskFilter, TaskRepository};

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: DashMap<Uuid, Task>,
    idempotency: DashMap<String, Uuid>,
    edges: RwLock<BTreeSet<(Uuid, Uuid)>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_dependencies(&self, mut task: Task) -> Task {
        let edges = self.edges.read().await;
        task.depends_on = edges
            .iter()
            .filter(|(_, blocked)| *blocked == task.id)
            .map(|(blocker, _)| *blocker)
            .collect();
        task
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        if let Some(key) = &task.idempotency_key {
            match self.idempotency.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(DomainError::ValidationFailed(format!(
                        "idempotency key '{key}' already used"
                    )))
                }
                Entry::Vacant(slot) => {
                    slot.insert(task.id);
                }
            }
        }
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => Err(DomainError::ValidationFailed(format!(
                "task {} already exists",
                task.id
            ))),
            Entry::Vacant(slot) => {
                let mut stored = task.clone();
                stored.depends_on.clear();
                slot.insert(stored);
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let task = self.tasks.get(&id).map(|t| t.clone());
        match task {
            Some(task) => Ok(Some(self.with_dependencies(task).await)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, task: &Task, expected_version: u64) -> DomainResult<bool> {
        let mut stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or(DomainError::TaskNotFound(task.id))?;
        if stored.version != expected_version {
            return Ok(false);
        }
        let mut next = task.clone();
        next.depends_on.clear();
        *stored = next;
        Ok(true)
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let (_, task) = self.tasks.remove(&id).ok_or(DomainError::TaskNotFound(id))?;
        if let Some(key) = task.idempotency_key {
            self.idempotency.remove(&key);
        }
        self.edges
            .write()
            .await
            .retain(|(blocker, blocked)| *blocker != id && *blocked != id);
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.ticket_id.is_none_or(|id| t.ticket_id == id))
            .filter(|t| {
                filter
                    .claimed_by
                    .as_deref()
                    .is_none_or(|agent| t.claimed_by.as_deref() == Some(agent))
            })
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }

        let edges = self.edges.read().await;
        let mut deps: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (blocker, blocked) in edges.iter() {
            deps.entry(*blocked).or_default().push(*blocker);
        }
        for task in &mut tasks {
            task.depends_on = deps.remove(&task.id).unwrap_or_default();
        }
        Ok(tasks)
    }

    async fn get_by_idempotency_key(&self, key: &str) -> DomainResult<Option<Task>> {
        let id = self.idempotency.get(key).map(|id| *id);
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>> {
        let mut counts = HashMap::new();
        for task in &self.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn max_sequences(&self) -> DomainResult<(u64, u64)> {
        let mut seq = 0;
        let mut completion = 0;
        for task in &self.tasks {
            seq = seq.max(task.sequence);
            completion = completion.max(task.completion_seq.unwrap_or(0));
        }
        Ok((seq, completion))
    }

    async fn add_dependency(&self, edge: DependencyEdge) -> DomainResult<()> {
        for id in [edge.blocker, edge.blocked] {
            if !self.tasks.contains_key(&id) {
                return Err(DomainError::TaskNotFound(id));
            }
        }
        self.edges.write().await.insert((edge.blocker, edge.blocked));
        Ok(())
    }

    async fn remove_dependency(&self, edge: DependencyEdge) -> DomainResult<bool> {
        Ok(self.edges.write().await.remove(&(edge.blocker, edge.blocked)))
    }

    async fn list_dependencies(&self) -> DomainResult<Vec<DependencyEdge>> {
        Ok(self
            .edges
            .read()
            .await
            .iter()
            .map(|(blocker, blocked)| DependencyEdge {
                blocker: *blocker,
                blocked: *blocked,
            })
            .collect())
    }
}
