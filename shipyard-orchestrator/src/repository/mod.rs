//! Repository Module
//!
//! Storage for pipeline runs and their log entries. The orchestrator only
//! talks to the `RunRepository` trait; the in-memory store is the default and
//! Postgres is used when a database is configured.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use shipyard_core::domain::log::LogEntry;
use shipyard_core::domain::run::PipelineRun;
use uuid::Uuid;

pub use memory::InMemoryRunRepository;
pub use postgres::PgRunRepository;

/// Repository error type
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed run record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persists runs and their logs
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Inserts or replaces a run record
    async fn save(&self, run: &PipelineRun) -> Result<(), RepositoryError>;

    async fn find(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError>;

    /// All runs, newest first
    async fn list(&self) -> Result<Vec<PipelineRun>, RepositoryError>;

    async fn append_logs(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), RepositoryError>;

    /// Log entries of a run in the order they were written
    async fn logs(&self, id: Uuid) -> Result<Vec<LogEntry>, RepositoryError>;
}
