//! Runner configuration
//!
//! Defines how build commands are executed: which executor runs them, how
//! long a single command may take, and whether the deployment effects are
//! required for a build to succeed.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where build commands run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// `sh -c` on the host
    Shell,
    /// Inside a podman container started from the build image
    Container,
    /// Commands are logged and reported successful without running
    DryRun,
}

impl FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Ok(ExecutorKind::Shell),
            "container" | "podman" => Ok(ExecutorKind::Container),
            "dry-run" | "dryrun" => Ok(ExecutorKind::DryRun),
            other => anyhow::bail!("unknown executor '{}'", other),
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Shell => write!(f, "shell"),
            ExecutorKind::Container => write!(f, "container"),
            ExecutorKind::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub executor: ExecutorKind,

    /// Maximum time a single command can run before it is killed
    pub command_timeout: Duration,

    /// Require the revision image push and deployment update for success
    pub require_effects: bool,

    /// Base directory for per-run workspaces
    pub workspace_base: PathBuf,

    /// Build container image (container executor only)
    pub build_image: String,

    /// Run the build container privileged so it can use a docker daemon
    pub privileged: bool,
}

impl RunnerConfig {
    /// Creates a new configuration with defaults
    pub fn new(executor: ExecutorKind) -> Self {
        Self {
            executor,
            command_timeout: Duration::from_secs(1800), // 30 minutes
            require_effects: true,
            workspace_base: std::env::temp_dir().join("shipyard"),
            build_image: "aws/codebuild/standard:7.0".to_string(),
            privileged: true,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - SHIPYARD_EXECUTOR (optional, shell | container | dry-run, default: shell)
    /// - SHIPYARD_COMMAND_TIMEOUT (optional, seconds, default: 1800)
    /// - SHIPYARD_REQUIRE_EFFECTS (optional, true | false, default: true)
    /// - SHIPYARD_WORKSPACE (optional, default: $TMPDIR/shipyard)
    /// - SHIPYARD_BUILD_IMAGE (optional)
    /// - SHIPYARD_PRIVILEGED (optional, true | false, default: true)
    pub fn from_env() -> anyhow::Result<Self> {
        let executor = match std::env::var("SHIPYARD_EXECUTOR") {
            Ok(value) => value.parse()?,
            Err(_) => ExecutorKind::Shell,
        };

        let mut config = Self::new(executor);

        if let Some(timeout) = std::env::var("SHIPYARD_COMMAND_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.command_timeout = Duration::from_secs(timeout);
        }

        if let Some(require) = std::env::var("SHIPYARD_REQUIRE_EFFECTS")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
        {
            config.require_effects = require;
        }

        if let Ok(workspace) = std::env::var("SHIPYARD_WORKSPACE") {
            config.workspace_base = PathBuf::from(workspace);
        }

        if let Ok(image) = std::env::var("SHIPYARD_BUILD_IMAGE") {
            config.build_image = image;
        }

        if let Some(privileged) = std::env::var("SHIPYARD_PRIVILEGED")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
        {
            config.privileged = privileged;
        }

        Ok(config)
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_require_effects(mut self, require: bool) -> Self {
        self.require_effects = require;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command_timeout.is_zero() {
            anyhow::bail!("command_timeout must be greater than 0");
        }

        if self.workspace_base.as_os_str().is_empty() {
            anyhow::bail!("workspace_base cannot be empty");
        }

        if self.executor == ExecutorKind::Container && self.build_image.is_empty() {
            anyhow::bail!("build_image is required for the container executor");
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(ExecutorKind::Shell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.executor, ExecutorKind::Shell);
        assert_eq!(config.command_timeout, Duration::from_secs(1800));
        assert!(config.require_effects);
        assert!(config.privileged);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = RunnerConfig::default();
        config.command_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::new(ExecutorKind::Container);
        assert!(config.validate().is_ok());
        config.build_image = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!("shell".parse::<ExecutorKind>().unwrap(), ExecutorKind::Shell);
        assert_eq!("Podman".parse::<ExecutorKind>().unwrap(), ExecutorKind::Container);
        assert_eq!("dry-run".parse::<ExecutorKind>().unwrap(), ExecutorKind::DryRun);
        assert!("kubernetes".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn test_builders() {
        let config = RunnerConfig::default()
            .with_command_timeout(Duration::from_secs(5))
            .with_require_effects(false);
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert!(!config.require_effects);
    }
}
