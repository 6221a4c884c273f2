use std::sync::Arc;

use chrono::{Duration, Utc};
use taskmesh::adapters::merge::SnapshotMergeBackend;
use taskmesh::adapters::sqlite::{
    create_migrated_test_pool, initialize_database, SqliteAgentRepository, SqliteTaskRepository,
    SqliteTicketRepository,
};
use taskmesh::domain::models::{Agent, Assignment, Config, Task, TaskPriority, TaskStatus, Ticket, TicketStatus};
use taskmesh::domain::ports::{AgentRepository, DependencyEdge, TaskFilter, TaskRepository, TicketRepository};
use taskmesh::services::{NewTask, Repositories, Scheduler};
use tempfile::TempDir;

async fn seeded_task(pool: &sqlx::SqlitePool) -> (SqliteTaskRepository, Task) {
    let tickets = SqliteTicketRepository::new(pool.clone());
    let ticket = Ticket::new("storage");
    tickets.create(&ticket).await.expect("failed to insert ticket");

    let tasks = SqliteTaskRepository::new(pool.clone());
    let task = Task::new(ticket.id, "persist me").with_priority(TaskPriority::High);
    tasks.create(&task).await.expect("failed to insert task");
    (tasks, task)
}

#[tokio::test]
async fn test_compare_and_swap_checks_version() {
    let pool = create_migrated_test_pool().await.unwrap();
    let (repo, task) = seeded_task(&pool).await;

    let mut next = task.clone();
    next.status = TaskStatus::Ready;
    next.version = task.version + 1;
    assert!(repo.compare_and_swap(&next, task.version).await.unwrap());

    // A writer still holding the old version loses
    let mut stale = task.clone();
    stale.status = TaskStatus::Cancelled;
    stale.version = task.version + 1;
    assert!(!repo.compare_and_swap(&stale, task.version).await.unwrap());

    let stored = repo.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Ready);
    assert_eq!(stored.version, task.version + 1);
    assert_eq!(stored.priority, TaskPriority::High);
}

#[tokio::test]
async fn test_compare_and_swap_unknown_task_errors() {
    let pool = create_migrated_test_pool().await.unwrap();
    let repo = SqliteTaskRepository::new(pool);
    let ghost = Task::new(uuid::Uuid::new_v4(), "ghost");
    assert!(repo.compare_and_swap(&ghost, 1).await.is_err());
}

#[tokio::test]
async fn test_ticket_writes_check_version() {
    let pool = create_migrated_test_pool().await.unwrap();
    let repo = SqliteTicketRepository::new(pool);
    let ticket = Ticket::new("versioned");
    repo.create(&ticket).await.unwrap();

    let mut archived = ticket.clone();
    archived.status = TicketStatus::Archived;
    archived.version = 2;
    assert!(repo.compare_and_swap(&archived, 1).await.unwrap());

    let mut stale = ticket.clone();
    stale.status = TicketStatus::Done;
    stale.version = 2;
    assert!(!repo.compare_and_swap(&stale, 1).await.unwrap());

    let stored = repo.get(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::Archived);
    assert_eq!(stored.version, 2);

    assert!(repo.compare_and_swap(&Ticket::new("ghost"), 1).await.is_err());
}

#[tokio::test]
async fn test_dependency_edges_fill_depends_on() {
    let pool = create_migrated_test_pool().await.unwrap();
    let (repo, blocker) = seeded_task(&pool).await;
    let blocked = Task::new(blocker.ticket_id, "after");
    repo.create(&blocked).await.unwrap();

    let edge = DependencyEdge {
        blocker: blocker.id,
        blocked: blocked.id,
    };
    repo.add_dependency(edge).await.unwrap();
    assert_eq!(repo.get(blocked.id).await.unwrap().unwrap().depends_on, vec![blocker.id]);
    assert_eq!(repo.list_dependencies().await.unwrap(), vec![edge]);

    let for_ticket = repo.list(TaskFilter::for_ticket(blocker.ticket_id)).await.unwrap();
    assert_eq!(for_ticket.len(), 2);

    assert!(repo.remove_dependency(edge).await.unwrap());
    assert!(repo.get(blocked.id).await.unwrap().unwrap().depends_on.is_empty());
}

#[tokio::test]
async fn test_expired_assignments_and_lease_renewal() {
    let pool = create_migrated_test_pool().await.unwrap();
    let (_, task) = seeded_task(&pool).await;
    let agents = SqliteAgentRepository::new(pool.clone());
    agents.upsert(&Agent::new("a1", 2)).await.unwrap();

    let t0 = Utc::now();
    agents
        .put_assignment(&Assignment::new(task.id, "a1", t0, Duration::seconds(90)))
        .await
        .unwrap();
    assert!(agents.expired_assignments(t0 + Duration::seconds(60)).await.unwrap().is_empty());
    assert_eq!(agents.expired_assignments(t0 + Duration::seconds(90)).await.unwrap().len(), 1);

    let renewed = agents
        .renew_leases("a1", t0 + Duration::seconds(180))
        .await
        .unwrap();
    assert_eq!(renewed, 1);
    assert!(agents.expired_assignments(t0 + Duration::seconds(120)).await.unwrap().is_empty());

    // A later holder's lease survives cleanup by the previous one
    agents.upsert(&Agent::new("a2", 1)).await.unwrap();
    agents
        .put_assignment(&Assignment::new(task.id, "a2", t0, Duration::seconds(90)))
        .await
        .unwrap();
    assert!(!agents.delete_assignment(task.id, "a1").await.unwrap());
    assert_eq!(agents.get_assignment(task.id).await.unwrap().unwrap().agent_id, "a2");

    assert!(agents.delete_assignment(task.id, "a2").await.unwrap());
    assert!(agents.assignments_for_agent("a2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_file_database_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}", dir.path().join("state/taskmesh.db").display());

    let pool = initialize_database(&url, None).await.unwrap();
    let scheduler = Scheduler::build(
        Config::default(),
        Repositories::sqlite(&pool),
        Arc::new(SnapshotMergeBackend::new()),
    )
    .await
    .unwrap();
    let ticket = scheduler.tickets().create("durable", TaskPriority::Low).await.unwrap();
    let task = scheduler
        .queue()
        .create_task(NewTask::new(ticket.id, "survive"))
        .await
        .unwrap();
    drop(scheduler);
    pool.close().await;

    let pool = initialize_database(&url, None).await.unwrap();
    let tasks = SqliteTaskRepository::new(pool.clone());
    let stored = tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Ready);
    assert_eq!(stored.description, "survive");
    pool.close().await;
}
