//! Orchestrator configuration
//!
//! Read from the environment at startup. The stack itself is described by a
//! YAML file; everything here is about how the service runs it.

use std::path::PathBuf;

use shipyard_runner::RunnerConfig;

/// Orchestrator service configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Postgres connection string; runs are kept in memory when unset
    pub database_url: Option<String>,

    /// Stack description; the built-in defaults are used when unset
    pub stack_file: Option<PathBuf>,

    /// Where provisioning state is persisted; kept in memory when unset
    pub state_file: Option<PathBuf>,

    /// End older runs without building once a newer revision was fetched
    pub supersede: bool,

    /// How build commands are executed
    pub runner: RunnerConfig,
}

impl OrchestratorConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - ORCHESTRATOR_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - DATABASE_URL (optional)
    /// - SHIPYARD_STACK_FILE (optional)
    /// - SHIPYARD_STATE_FILE (optional)
    /// - SHIPYARD_SUPERSEDE (optional, true | false, default: true)
    /// - plus the runner variables read by `RunnerConfig::from_env`
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let supersede = std::env::var("SHIPYARD_SUPERSEDE")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(true);

        Ok(Self {
            bind_addr,
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            stack_file: std::env::var("SHIPYARD_STACK_FILE").ok().map(PathBuf::from),
            state_file: std::env::var("SHIPYARD_STATE_FILE").ok().map(PathBuf::from),
            supersede,
            runner: RunnerConfig::from_env()?,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if let Some(path) = &self.stack_file {
            if !path.exists() {
                anyhow::bail!("stack file {} does not exist", path.display());
            }
        }

        self.runner.validate()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            stack_file: None,
            state_file: None,
            supersede: true,
            runner: RunnerConfig::default(),
        }
    }
}
