//! Merge units: the output of completed tasks waiting to converge on a base.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// No conflict (merged, or not yet attempted)
    #[default]
    None,
    Detected,
    Resolved,
    /// Abandoned by an operator
    Unresolved,
}

impl ConflictStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Detected => "detected",
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "detected" => Some(Self::Detected),
            "resolved" => Some(Self::Resolved),
            "unresolved" => Some(Self::Unresolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeUnitState {
    /// Waiting for its turn on the base
    Pending,
    /// Integrated into the base
    Merged,
    /// Conflict surfaced; waiting for explicit resolution
    Conflicted,
    /// Closed without merging
    Abandoned,
}

impl MergeUnitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Merged => "merged",
            Self::Conflicted => "conflicted",
            Self::Abandoned => "abandoned",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "merged" => Some(Self::Merged),
            "conflicted" => Some(Self::Conflicted),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeUnit {
    pub id: Uuid,
    pub task_id: Uuid,
    pub base_ref: String,
    pub produced_ref: String,
    pub conflict_status: ConflictStatus,
    pub state: MergeUnitState,
    /// Completion order of the producing task; merges on a base run in this order
    pub completion_seq: u64,
    pub conflict_details: Option<String>,
    pub conflicting_paths: Vec<String>,
    /// Base head the conflict was detected against
    pub base_head_at_conflict: Option<String>,
    pub merged_head: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl MergeUnit {
    pub fn new(
        task_id: Uuid,
        base_ref: impl Into<String>,
        produced_ref: impl Into<String>,
        completion_seq: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            base_ref: base_ref.into(),
            produced_ref: produced_ref.into(),
            conflict_status: ConflictStatus::None,
            state: MergeUnitState::Pending,
            completion_seq,
            conflict_details: None,
            conflicting_paths: Vec::new(),
            base_head_at_conflict: None,
            merged_head: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    pub const fn is_open(&self) -> bool {
        matches!(self.state, MergeUnitState::Pending | MergeUnitState::Conflicted)
    }
}

/// Result returned to the submitter of a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub merge_unit_id: Uuid,
    pub task_id: Uuid,
    pub base_ref: String,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub conflicting_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_head: Option<String>,
}

impl MergeResult {
    pub fn from_unit(unit: &MergeUnit) -> Self {
        Self {
            merge_unit_id: unit.id,
            task_id: unit.task_id,
            base_ref: unit.base_ref.clone(),
            status: unit.conflict_status,
            conflict_details: unit.conflict_details.clone(),
            conflicting_paths: unit.conflicting_paths.clone(),
            new_head: unit.merged_head.clone(),
        }
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self.status, ConflictStatus::Detected)
    }

    /// Turn a detected conflict into `DomainError::MergeConflict`.
    pub fn into_result(self) -> crate::domain::errors::DomainResult<Self> {
        if self.is_conflict() {
            return Err(crate::domain::errors::DomainError::MergeConflict {
                unit_id: self.merge_unit_id,
                details: self.conflict_details.unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

/// Explicit resolution of a conflicted merge unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    /// Merge this ref instead (e.g. a rebased or hand-fixed version)
    Merge { resolved_ref: String },
    /// Close the unit without merging
    Abandon { reason: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub pending: usize,
    pub merged: usize,
    pub conflicted: usize,
    pub abandoned: usize,
    pub resolved: usize,
}
