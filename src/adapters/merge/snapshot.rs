//! In-memory content store with refs, commits and a file-level three-way merge.
//!
//! Used by tests and by the `memory` storage backend. A commit is a full
//! snapshot of `path -> content`; a missing path means the file is absent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{MergeBackend, MergeOutcome};

type Files = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Commit {
    parents: Vec<String>,
    files: Files,
}

#[derive(Debug, Default)]
struct Store {
    commits: HashMap<String, Commit>,
    refs: HashMap<String, String>,
}

impl Store {
    fn resolve(&self, name: &str) -> Option<String> {
        self.refs
            .get(name)
            .cloned()
            .or_else(|| self.commits.contains_key(name).then(|| name.to_string()))
    }

    fn ancestors(&self, head: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([head.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    /// Nearest common ancestor, searching breadth-first from `theirs`.
    fn merge_base(&self, ours: &str, theirs: &str) -> Option<String> {
        let ours_ancestors = self.ancestors(ours);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([theirs.to_string()]);
        while let Some(id) = queue.pop_front() {
            if ours_ancestors.contains(&id) {
                return Some(id);
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        None
    }

    fn insert(&mut self, parents: Vec<String>, files: Files) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.commits.insert(id.clone(), Commit { parents, files });
        id
    }
}

/// Merge `ours` and `theirs` against `base` path by path.
fn three_way(base: &Files, ours: &Files, theirs: &Files) -> Result<Files, Vec<String>> {
    let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
    let mut merged = Files::new();
    let mut conflicts = Vec::new();

    for path in paths {
        let o = base.get(path);
        let a = ours.get(path);
        let b = theirs.get(path);
        let pick = if a == b || b == o {
            a
        } else if a == o {
            b
        } else {
            conflicts.push(path.clone());
            continue;
        };
        if let Some(content) = pick {
            merged.insert(path.clone(), content.clone());
        }
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(conflicts)
    }
}

#[derive(Debug, Default)]
pub struct SnapshotMergeBackend {
    store: RwLock<Store>,
}

impl SnapshotMergeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `changes` on top of `ref_name` (created empty if absent).
    /// `None` content deletes the path. Returns the new commit id.
    pub async fn commit(&self, ref_name: &str, changes: &[(&str, Option<&str>)]) -> String {
        let mut store = self.store.write().await;
        let parent = store.refs.get(ref_name).cloned();
        let mut files = parent
            .as_ref()
            .and_then(|p| store.commits.get(p))
            .map(|c| c.files.clone())
            .unwrap_or_default();
        for (path, content) in changes {
            match content {
                Some(content) => files.insert((*path).to_string(), (*content).to_string()),
                None => files.remove(*path),
            };
        }
        let id = store.insert(parent.into_iter().collect(), files);
        store.refs.insert(ref_name.to_string(), id.clone());
        id
    }

    /// Point `new_ref` at the current head of `from_ref`.
    pub async fn branch(&self, new_ref: &str, from_ref: &str) -> DomainResult<String> {
        let mut store = self.store.write().await;
        let head = store
            .resolve(from_ref)
            .ok_or_else(|| DomainError::UnknownRef(from_ref.to_string()))?;
        store.refs.insert(new_ref.to_string(), head.clone());
        Ok(head)
    }

    pub async fn read(&self, ref_name: &str, path: &str) -> Option<String> {
        let store = self.store.read().await;
        let head = store.resolve(ref_name)?;
        store.commits.get(&head)?.files.get(path).cloned()
    }

    pub async fn files(&self, ref_name: &str) -> Files {
        let store = self.store.read().await;
        store
            .resolve(ref_name)
            .and_then(|head| store.commits.get(&head).map(|c| c.files.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl MergeBackend for SnapshotMergeBackend {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn head(&self, base_ref: &str) -> DomainResult<Option<String>> {
        Ok(self.store.read().await.refs.get(base_ref).cloned())
    }

    async fn merge(&self, base_ref: &str, produced_ref: &str) -> DomainResult<MergeOutcome> {
        let mut store = self.store.write().await;
        let theirs = store
            .resolve(produced_ref)
            .ok_or_else(|| DomainError::UnknownRef(produced_ref.to_string()))?;

        let Some(ours) = store.refs.get(base_ref).cloned() else {
            // Empty base: fast-forward
            store.refs.insert(base_ref.to_string(), theirs.clone());
            return Ok(MergeOutcome::Merged { new_head: theirs });
        };

        let ours_ancestors = store.ancestors(&ours);
        if ours_ancestors.contains(&theirs) {
            return Ok(MergeOutcome::Merged { new_head: ours });
        }
        if store.ancestors(&theirs).contains(&ours) {
            store.refs.insert(base_ref.to_string(), theirs.clone());
            return Ok(MergeOutcome::Merged { new_head: theirs });
        }

        let empty = Files::new();
        let base_files = store
            .merge_base(&ours, &theirs)
            .and_then(|id| store.commits.get(&id).map(|c| c.files.clone()))
            .unwrap_or_else(|| empty.clone());
        let ours_files = store.commits.get(&ours).map_or(&empty, |c| &c.files);
        let theirs_files = store.commits.get(&theirs).map_or(&empty, |c| &c.files);

        match three_way(&base_files, ours_files, theirs_files) {
            Ok(files) => {
                let id = store.insert(vec![ours, theirs], files);
                store.refs.insert(base_ref.to_string(), id.clone());
                Ok(MergeOutcome::Merged { new_head: id })
            }
            Err(paths) => Ok(MergeOutcome::Conflict {
                details: format!("conflicting changes in {}", paths.join(", ")),
                paths,
            }),
        }
    }
}
