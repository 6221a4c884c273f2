//! Domain errors for the taskmesh scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Format a cycle path as a human-readable string: `A -> B -> C -> A`.
fn format_cycle_path(path: &[Uuid]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Domain-level errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Ticket not found: {0}")]
    TicketNotFound(Uuid),

    #[error("Merge unit not found: {0}")]
    MergeUnitNotFound(Uuid),

    #[error("Unknown dependency {dependency} for task {task}")]
    UnknownDependency { task: Uuid, dependency: Uuid },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    /// Rejected edge insertion. Always surfaced, never auto-resolved.
    #[error("Task dependency cycle detected: {}", format_cycle_path(.0))]
    DependencyCycle(Vec<Uuid>),

    /// Lost a compare-and-swap race on a task claim. Retried inside `claim_next`.
    #[error("Claim conflict on task {0}")]
    ClaimConflict(Uuid),

    #[error("Agent {agent_id} is stale: no heartbeat since {last_heartbeat_at}")]
    StaleAgent { agent_id: String, last_heartbeat_at: DateTime<Utc> },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Circuit breaker open for {scope}, retry after {retry_after}")]
    CircuitOpen { scope: String, retry_after: DateTime<Utc> },

    #[error("Merge conflict for unit {unit_id}: {details}")]
    MergeConflict { unit_id: Uuid, details: String },

    #[error("Merge backend error: {0}")]
    MergeBackend(String),

    /// A ref the merge backend cannot resolve. Retrying will not make it appear.
    #[error("Unknown ref: {0}")]
    UnknownRef(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict { entity: String, id: String },
}

impl DomainError {
    /// Short machine-readable code used by the HTTP layer.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::TicketNotFound(_) => "TICKET_NOT_FOUND",
            Self::MergeUnitNotFound(_) => "MERGE_UNIT_NOT_FOUND",
            Self::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::DependencyCycle(_) => "CYCLE_DETECTED",
            Self::ClaimConflict(_) => "CLAIM_CONFLICT",
            Self::StaleAgent { .. } => "STALE_AGENT",
            Self::UnknownAgent(_) => "UNKNOWN_AGENT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::MergeConflict { .. } => "MERGE_CONFLICT",
            Self::MergeBackend(_) => "MERGE_BACKEND_ERROR",
            Self::UnknownRef(_) => "UNKNOWN_REF",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
        }
    }

    /// Whether the error is a transient infrastructure failure worth retrying locally.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::ConcurrencyConflict { .. } | Self::MergeBackend(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
