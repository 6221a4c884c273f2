use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{MergeUnit, MergeUnitState};
use crate::domain::ports::MergeUnitRepository;

#[derive(Default)]
pub struct InMemoryMergeUnitRepository {
    units: DashMap<Uuid, MergeUnit>,
    by_task: DashMap<Uuid, Uuid>,
}

impl InMemoryMergeUnitRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MergeUnitRepository for InMemoryMergeUnitRepository {
    async fn save(&self, unit: &MergeUnit) -> DomainResult<()> {
        if let Some(existing) = self.by_task.get(&unit.task_id) {
            if *existing != unit.id {
                return Err(DomainError::ValidationFailed(format!(
                    "task {} already has merge unit {}",
                    unit.task_id, *existing
                )));
            }
        }
        self.by_task.insert(unit.task_id, unit.id);
        self.units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<MergeUnit>> {
        Ok(self.units.get(&id).map(|u| u.clone()))
    }

    async fn get_by_task(&self, task_id: Uuid) -> DomainResult<Option<MergeUnit>> {
        let Some(id) = self.by_task.get(&task_id).map(|id| *id) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn list(&self, state: Option<MergeUnitState>) -> DomainResult<Vec<MergeUnit>> {
        let mut units: Vec<MergeUnit> = self
            .units
            .iter()
            .filter(|u| state.is_none_or(|s| u.state == s))
            .map(|u| u.clone())
            .collect();
        units.sort_by_key(|u| (u.completion_seq, u.id));
        Ok(units)
    }
}
