//! Shipyard Orchestrator
//!
//! Runs the Source -> Build pipeline for every accepted change event and
//! serves the run records, logs and stack views over HTTP.

pub mod api;
pub mod config;
pub mod db;
pub mod orchestrator;
pub mod repository;
pub mod source;

pub use config::OrchestratorConfig;
pub use orchestrator::{OrchestratorError, PipelineOrchestrator, derive_binding};
pub use repository::{InMemoryRunRepository, PgRunRepository, RepositoryError, RunRepository};
pub use source::{GitSource, SourceProvider, StaticSource};
