use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;

/// Result of integrating a produced ref into a base ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The base now points at `new_head`. Also returned when the produced ref
    /// was already contained in the base.
    Merged { new_head: String },
    /// Nothing was written
    Conflict { paths: Vec<String>, details: String },
}

/// Port for the shared resource tasks converge on (a repository, usually).
///
/// Implementations only move `base_ref` when the merge is clean, and only if
/// the base still points where it pointed when the merge started.
#[async_trait]
pub trait MergeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current head of `base_ref`, `None` if the ref does not exist
    async fn head(&self, base_ref: &str) -> DomainResult<Option<String>>;

    /// Three-way merge of `produced_ref` onto the current head of `base_ref`
    async fn merge(&self, base_ref: &str, produced_ref: &str) -> DomainResult<MergeOutcome>;
}
