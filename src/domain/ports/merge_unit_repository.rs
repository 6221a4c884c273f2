use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{MergeUnit, MergeUnitState};

/// Repository port for merge units. At most one unit exists per task.
#[async_trait]
pub trait MergeUnitRepository: Send + Sync {
    /// Insert or overwrite by id
    async fn save(&self, unit: &MergeUnit) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<MergeUnit>>;

    async fn get_by_task(&self, task_id: Uuid) -> DomainResult<Option<MergeUnit>>;

    /// Units in `state` (all when `None`), ordered by completion sequence
    async fn list(&self, state: Option<MergeUnitState>) -> DomainResult<Vec<MergeUnit>>;
}
