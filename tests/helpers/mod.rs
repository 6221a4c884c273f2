#![allow(dead_code)]

use std::sync::Arc;

use taskmesh::adapters::merge::SnapshotMergeBackend;
use taskmesh::domain::models::{Config, Task, TaskPriority, Ticket};
use taskmesh::services::{NewTask, Repositories, Scheduler};
use uuid::Uuid;

/// In-memory scheduler with default settings.
pub async fn memory_scheduler() -> Scheduler {
    Scheduler::in_memory(Config::default())
        .await
        .expect("failed to build in-memory scheduler")
}

/// Snapshot backend with `main` holding a single README commit.
pub async fn snapshot_with_main() -> Arc<SnapshotMergeBackend> {
    let backend = Arc::new(SnapshotMergeBackend::new());
    backend.commit("main", &[("README", Some("taskmesh"))]).await;
    backend
}

/// In-memory scheduler merging onto `backend`.
pub async fn scheduler_on(backend: Arc<SnapshotMergeBackend>) -> Scheduler {
    Scheduler::build(Config::default(), Repositories::in_memory(), backend)
        .await
        .expect("failed to build scheduler")
}

pub async fn ticket(scheduler: &Scheduler, title: &str) -> Ticket {
    scheduler
        .tickets()
        .create(title, TaskPriority::Medium)
        .await
        .expect("failed to create ticket")
}

pub async fn task(scheduler: &Scheduler, ticket_id: Uuid, description: &str, depends_on: &[Uuid]) -> Task {
    let mut new = NewTask::new(ticket_id, description);
    for blocker in depends_on {
        new = new.depends_on(*blocker);
    }
    scheduler
        .queue()
        .create_task(new)
        .await
        .expect("failed to create task")
}

pub async fn agent(scheduler: &Scheduler, agent_id: &str, capacity: u32) {
    scheduler
        .workers()
        .register(Some(agent_id), capacity)
        .await
        .expect("failed to register agent");
}
