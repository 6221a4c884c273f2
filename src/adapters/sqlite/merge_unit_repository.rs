//! SQLite implementation of the MergeUnitRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, parse_datetime, parse_optional_datetime, parse_uuid, to_i64, to_u64};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ConflictStatus, MergeUnit, MergeUnitState};
use crate::domain::ports::MergeUnitRepository;

#[derive(Clone)]
pub struct SqliteMergeUnitRepository {
    pool: SqlitePool,
}

impl SqliteMergeUnitRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MergeUnitRepository for SqliteMergeUnitRepository {
    async fn save(&self, unit: &MergeUnit) -> DomainResult<()> {
        let paths = serde_json::to_string(&unit.conflicting_paths)?;
        sqlx::query(
            r#"INSERT INTO merge_units (id, task_id, base_ref, produced_ref, conflict_status, state,
                   completion_seq, conflict_details, conflicting_paths, base_head_at_conflict,
                   merged_head, created_at, closed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   produced_ref = excluded.produced_ref,
                   conflict_status = excluded.conflict_status,
                   state = excluded.state,
                   conflict_details = excluded.conflict_details,
                   conflicting_paths = excluded.conflicting_paths,
                   base_head_at_conflict = excluded.base_head_at_conflict,
                   merged_head = excluded.merged_head,
                   closed_at = excluded.closed_at"#,
        )
        .bind(unit.id.to_string())
        .bind(unit.task_id.to_string())
        .bind(&unit.base_ref)
        .bind(&unit.produced_ref)
        .bind(unit.conflict_status.as_str())
        .bind(unit.state.as_str())
        .bind(to_i64(unit.completion_seq))
        .bind(&unit.conflict_details)
        .bind(paths)
        .bind(&unit.base_head_at_conflict)
        .bind(&unit.merged_head)
        .bind(format_datetime(unit.created_at))
        .bind(unit.closed_at.map(format_datetime))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<MergeUnit>> {
        let row: Option<MergeUnitRow> = sqlx::query_as("SELECT * FROM merge_units WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_task(&self, task_id: Uuid) -> DomainResult<Option<MergeUnit>> {
        let row: Option<MergeUnitRow> = sqlx::query_as("SELECT * FROM merge_units WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, state: Option<MergeUnitState>) -> DomainResult<Vec<MergeUnit>> {
        let state = state.map(|s| s.as_str());
        let rows: Vec<MergeUnitRow> = sqlx::query_as(
            "SELECT * FROM merge_units WHERE (? IS NULL OR state = ?) ORDER BY completion_seq ASC, id ASC",
        )
        .bind(state)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct MergeUnitRow {
    id: String,
    task_id: String,
    base_ref: String,
    produced_ref: String,
    conflict_status: String,
    state: String,
    completion_seq: i64,
    conflict_details: Option<String>,
    conflicting_paths: String,
    base_head_at_conflict: Option<String>,
    merged_head: Option<String>,
    created_at: String,
    closed_at: Option<String>,
}

impl TryFrom<MergeUnitRow> for MergeUnit {
    type Error = DomainError;

    fn try_from(row: MergeUnitRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            task_id: parse_uuid(&row.task_id)?,
            base_ref: row.base_ref,
            produced_ref: row.produced_ref,
            conflict_status: ConflictStatus::from_str(&row.conflict_status).ok_or_else(|| {
                DomainError::SerializationError(format!("Invalid conflict status: {}", row.conflict_status))
            })?,
            state: MergeUnitState::from_str(&row.state)
                .ok_or_else(|| DomainError::SerializationError(format!("Invalid merge state: {}", row.state)))?,
            completion_seq: to_u64(row.completion_seq),
            conflict_details: row.conflict_details,
            conflicting_paths: serde_json::from_str(&row.conflicting_paths)?,
            base_head_at_conflict: row.base_head_at_conflict,
            merged_head: row.merged_head,
            created_at: parse_datetime(&row.created_at)?,
            closed_at: parse_optional_datetime(row.closed_at)?,
        })
    }
}
