//! Merge backend driving the `git` CLI against a bare or working repository.
//!
//! Merges never touch a worktree: `merge-tree --write-tree` computes the
//! result, `commit-tree` records it, and `update-ref` moves the base only if
//! it still points at the commit the merge started from.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{MergeBackend, MergeOutcome};

#[derive(Debug, Clone)]
pub struct GitMergeBackend {
    repo_path: PathBuf,
    committer_name: String,
    committer_email: String,
}

impl GitMergeBackend {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            committer_name: "taskmesh".to_string(),
            committer_email: "taskmesh@localhost".to_string(),
        }
    }

    pub fn with_committer(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.committer_name = name.into();
        self.committer_email = email.into();
        self
    }

    async fn git(&self, args: &[&str]) -> DomainResult<Output> {
        debug!(repo = %self.repo_path.display(), ?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .env("GIT_AUTHOR_NAME", &self.committer_name)
            .env("GIT_AUTHOR_EMAIL", &self.committer_email)
            .env("GIT_COMMITTER_NAME", &self.committer_name)
            .env("GIT_COMMITTER_EMAIL", &self.committer_email)
            .output()
            .await
            .map_err(|e| DomainError::MergeBackend(format!("failed to run git: {e}")))
    }

    async fn git_ok(&self, args: &[&str]) -> DomainResult<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(DomainError::MergeBackend(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn resolve(&self, rev: &str) -> DomainResult<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let output = self.git(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> DomainResult<bool> {
        let output = self
            .git(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(output.status.success())
    }
}

fn full_ref(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{name}")
    }
}

/// Reject ref names that git would refuse or that could be read as options.
pub fn validate_ref_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::ValidationFailed("ref name cannot be empty".to_string()));
    }
    if name.starts_with('-') {
        return Err(DomainError::ValidationFailed(format!(
            "invalid ref name '{name}': must not start with '-'"
        )));
    }
    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return Err(DomainError::ValidationFailed(format!(
            "invalid ref name '{name}': contains a forbidden sequence"
        )));
    }
    if let Some(ch) = name
        .chars()
        .find(|ch| ch.is_ascii_control() || matches!(ch, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(DomainError::ValidationFailed(format!(
            "invalid ref name '{name}': contains disallowed character '{ch}'"
        )));
    }
    if name.ends_with(".lock") || name.ends_with('/') || name.ends_with('.') {
        return Err(DomainError::ValidationFailed(format!(
            "invalid ref name '{name}': bad suffix"
        )));
    }
    Ok(())
}

#[async_trait]
impl MergeBackend for GitMergeBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn head(&self, base_ref: &str) -> DomainResult<Option<String>> {
        validate_ref_name(base_ref)?;
        self.resolve(&full_ref(base_ref)).await
    }

    async fn merge(&self, base_ref: &str, produced_ref: &str) -> DomainResult<MergeOutcome> {
        validate_ref_name(base_ref)?;
        validate_ref_name(produced_ref)?;

        let base = full_ref(base_ref);
        let theirs = self
            .resolve(produced_ref)
            .await?
            .ok_or_else(|| DomainError::UnknownRef(produced_ref.to_string()))?;
        let Some(ours) = self.resolve(&base).await? else {
            self.git_ok(&["update-ref", &base, &theirs, ""]).await?;
            return Ok(MergeOutcome::Merged { new_head: theirs });
        };

        if self.is_ancestor(&theirs, &ours).await? {
            return Ok(MergeOutcome::Merged { new_head: ours });
        }

        let output = self
            .git(&["merge-tree", "--write-tree", "--name-only", "--no-messages", &ours, &theirs])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let mut lines = stdout.lines();
        let tree = lines.next().unwrap_or_default().trim().to_string();

        match output.status.code() {
            Some(0) => {}
            Some(1) => {
                let paths: Vec<String> = lines
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(ToString::to_string)
                    .collect();
                return Ok(MergeOutcome::Conflict {
                    details: format!("conflicting changes in {}", paths.join(", ")),
                    paths,
                });
            }
            _ => {
                return Err(DomainError::MergeBackend(format!(
                    "git merge-tree failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        let message = format!("Merge {produced_ref} into {base_ref}");
        let commit = self
            .git_ok(&["commit-tree", &tree, "-p", &ours, "-p", &theirs, "-m", &message])
            .await?;

        // Moves only if the base still points at `ours`
        if let Err(e) = self.git_ok(&["update-ref", &base, &commit, &ours]).await {
            warn!(base_ref, error = %e, "base moved during merge");
            return Err(e);
        }
        Ok(MergeOutcome::Merged { new_head: commit })
    }
}
