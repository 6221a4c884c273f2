//! Merge backends for the convergence service.

pub mod git;
pub mod snapshot;

use std::sync::Arc;

pub use git::{validate_ref_name, GitMergeBackend};
pub use snapshot::SnapshotMergeBackend;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{MergeBackendKind, MergeConfig};
use crate::domain::ports::MergeBackend;

/// Build the backend selected in configuration.
pub fn backend_from_config(config: &MergeConfig) -> DomainResult<Arc<dyn MergeBackend>> {
    match config.backend {
        MergeBackendKind::Snapshot => Ok(Arc::new(SnapshotMergeBackend::new())),
        MergeBackendKind::Git => {
            let path = config.repo_path.as_deref().ok_or_else(|| {
                DomainError::ValidationFailed("merge.repo_path is required for the git backend".to_string())
            })?;
            Ok(Arc::new(GitMergeBackend::new(path)))
        }
    }
}
