//! In-memory run repository

use async_trait::async_trait;
use shipyard_core::domain::log::LogEntry;
use shipyard_core::domain::run::PipelineRun;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use super::{RepositoryError, RunRepository};

/// Keeps runs for the lifetime of the process
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    logs: RwLock<HashMap<Uuid, Vec<LogEntry>>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
        Ok(self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, RepositoryError> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(runs)
    }

    async fn append_logs(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), RepositoryError> {
        self.logs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .extend(entries);
        Ok(())
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<LogEntry>, RepositoryError> {
        Ok(self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}
