//! Postgres run repository
//!
//! Run records are stored whole as JSONB next to the columns used for
//! listing; log entries go to their own table.

use async_trait::async_trait;
use shipyard_core::domain::log::{LogEntry, LogLevel};
use shipyard_core::domain::run::{PipelineRun, RunStatus};
use sqlx::PgPool;
use uuid::Uuid;

use super::{RepositoryError, RunRepository};

pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn save(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        let record = serde_json::to_value(run)?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, pipeline, branch, revision, status, requested_at, completed_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, completed_at = EXCLUDED.completed_at, record = EXCLUDED.record
            "#,
        )
        .bind(run.id)
        .bind(&run.pipeline)
        .bind(&run.branch)
        .bind(&run.revision)
        .bind(status_to_string(run.status))
        .bind(run.requested_at)
        .bind(run.completed_at)
        .bind(record)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT record FROM pipeline_runs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(record,)| serde_json::from_value(record))
            .transpose()
            .map_err(RepositoryError::from)
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, RepositoryError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT record FROM pipeline_runs ORDER BY requested_at DESC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(record,)| serde_json::from_value(record).map_err(RepositoryError::from))
            .collect()
    }

    async fn append_logs(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), RepositoryError> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO run_logs (run_id, timestamp, level, message)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(entry.timestamp)
            .bind(level_to_string(entry.level))
            .bind(&entry.message)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<LogEntry>, RepositoryError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT timestamp, level, message
            FROM run_logs
            WHERE run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "Queued",
        RunStatus::InProgress => "InProgress",
        RunStatus::Succeeded => "Succeeded",
        RunStatus::Failed => "Failed",
        RunStatus::Cancelled => "Cancelled",
        RunStatus::Superseded => "Superseded",
    }
}

fn level_to_string(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "Debug",
        LogLevel::Info => "Info",
        LogLevel::Warning => "Warning",
        LogLevel::Error => "Error",
    }
}

fn string_to_level(s: &str) -> LogLevel {
    match s {
        "Debug" => LogLevel::Debug,
        "Info" => LogLevel::Info,
        "Warning" => LogLevel::Warning,
        "Error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    message: String,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            timestamp: row.timestamp,
            level: string_to_level(&row.level),
            message: row.message,
        }
    }
}

