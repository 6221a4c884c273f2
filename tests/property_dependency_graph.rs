use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use taskmesh::adapters::memory::InMemoryTaskRepository;
use taskmesh::domain::models::Task;
use taskmesh::domain::ports::TaskRepository;
use taskmesh::services::DependencyGraph;
use taskmesh::DomainError;
use uuid::Uuid;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

async fn seeded(size: usize) -> (DependencyGraph, Vec<Uuid>) {
    let repo = Arc::new(InMemoryTaskRepository::new());
    let ticket = Uuid::new_v4();
    let mut ids = Vec::with_capacity(size);
    for i in 0..size {
        let task = Task::new(ticket, format!("task {i}"));
        repo.create(&task).await.expect("failed to insert task");
        ids.push(task.id);
    }
    let repo: Arc<dyn TaskRepository> = repo;
    (DependencyGraph::new(repo), ids)
}

/// Edges only point from lower to higher index, so the graph is acyclic.
fn dag_edges(size: usize, mask: &[bool]) -> Vec<(usize, usize)> {
    let mut edges = Vec::new();
    let mut bit = 0;
    for blocked in 1..size {
        for blocker in 0..blocked {
            if mask.get(bit).copied().unwrap_or(false) {
                edges.push((blocker, blocked));
            }
            bit += 1;
        }
    }
    edges
}

proptest! {
    /// Property: completing a DAG in any topological order readies each task exactly once,
    /// and only after every one of its blockers completed.
    #[test]
    fn prop_each_task_becomes_ready_exactly_once(
        size in 1usize..24,
        mask in prop::collection::vec(prop::bool::weighted(0.3), 276),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 24),
    ) {
        runtime().block_on(async {
            let (graph, ids) = seeded(size).await;
            let edges = dag_edges(size, &mask);
            let mut deps: HashMap<usize, Vec<usize>> = HashMap::new();
            for (blocker, blocked) in &edges {
                deps.entry(*blocked).or_default().push(*blocker);
            }

            let mut ready_count: HashMap<Uuid, usize> = HashMap::new();
            let mut ready: Vec<Uuid> = Vec::new();
            for (i, id) in ids.iter().enumerate() {
                let blockers: Vec<Uuid> = deps.get(&i).map(|b| b.iter().map(|j| ids[*j]).collect()).unwrap_or_default();
                let is_ready = graph
                    .add_task(*id, &blockers)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(is_ready, blockers.is_empty());
                if is_ready {
                    *ready_count.entry(*id).or_default() += 1;
                    ready.push(*id);
                }
            }

            let index: HashMap<Uuid, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            let mut completed: HashSet<usize> = HashSet::new();
            let mut step = 0;
            while !ready.is_empty() {
                let pick = picks[step % picks.len()].index(ready.len());
                step += 1;
                let next = ready.swap_remove(pick);
                completed.insert(index[&next]);

                let unblocked = graph
                    .mark_completed(next)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                for id in unblocked {
                    let blockers = deps.get(&index[&id]).cloned().unwrap_or_default();
                    prop_assert!(
                        blockers.iter().all(|b| completed.contains(b)),
                        "task {} readied before all blockers completed",
                        index[&id]
                    );
                    *ready_count.entry(id).or_default() += 1;
                    ready.push(id);
                }

                // Repeated completion is a no-op
                let repeat = graph
                    .mark_completed(next)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert!(repeat.is_empty());
            }

            prop_assert_eq!(completed.len(), size);
            for id in &ids {
                prop_assert_eq!(ready_count.get(id).copied(), Some(1));
            }
            prop_assert!(graph.blocked_tasks().await.is_empty());
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Property: closing a chain into a loop is rejected and leaves the graph as it was.
    #[test]
    fn prop_closing_a_chain_is_rejected(size in 2usize..16) {
        runtime().block_on(async {
            let (graph, ids) = seeded(size).await;
            graph.add_task(ids[0], &[]).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            for pair in ids.windows(2) {
                graph.add_task(pair[1], &[pair[0]]).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let blocked_before = graph.blocked_tasks().await;

            let err = graph.add_dependency(ids[size - 1], ids[0]).await;
            prop_assert!(matches!(err, Err(DomainError::DependencyCycle(_))));
            prop_assert_eq!(graph.blocked_tasks().await, blocked_before);
            prop_assert!(graph.is_ready(ids[0]).await.map_err(|e| TestCaseError::fail(e.to_string()))?);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
