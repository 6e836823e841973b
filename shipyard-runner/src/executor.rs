//! Command executors
//!
//! A `CommandExecutor` runs one build command with the resolved environment
//! and reports its exit status and output. The runner owns sequencing,
//! timeouts and cancellation; executors only run what they are given.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::config::{ExecutorKind, RunnerConfig};
use crate::podman::{ContainerExecutor, check_podman_available};

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs build commands
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Sets up the environment for a run before its first command
    async fn prepare(&self, _run_id: Uuid, _workdir: &Path) -> Result<()> {
        Ok(())
    }

    /// Executes one command
    ///
    /// Dropping the returned future must stop the command.
    async fn execute(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        workdir: &Path,
    ) -> Result<CommandOutput>;

    /// Releases whatever `prepare` set up
    async fn finish(&self, _run_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Creates the executor selected by the configuration
pub fn create_executor(config: &RunnerConfig) -> Result<Arc<dyn CommandExecutor>> {
    match config.executor {
        ExecutorKind::Shell => Ok(Arc::new(ShellExecutor::new())),
        ExecutorKind::Container => {
            check_podman_available()?;
            Ok(Arc::new(ContainerExecutor::new(
                config.build_image.clone(),
                config.privileged,
            )))
        }
        ExecutorKind::DryRun => Ok(Arc::new(ScriptedExecutor::new())),
    }
}

// =============================================================================
// Shell
// =============================================================================

/// Environment variables passed through from the host
const INHERITED_VARS: &[&str] = &["PATH", "HOME"];

/// Runs commands with `sh -c` on the host
///
/// The environment is cleared apart from `PATH` and `HOME`, so commands only
/// see values that were explicitly bound.
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        workdir: &Path,
    ) -> Result<CommandOutput> {
        debug!("Executing in {}: {}", workdir.display(), command);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for var in INHERITED_VARS {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.envs(env);

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn `sh -c {}`", command))?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// =============================================================================
// Scripted
// =============================================================================

/// Canned behavior for commands matching a pattern
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Exit { code: i32, stderr: String },
    /// Never completes; only a timeout or cancellation ends it
    Hang,
    /// The process cannot be started
    SpawnError(String),
}

/// Replays canned results instead of running commands
///
/// With no rules every command succeeds, which is what the dry-run executor
/// uses. Rules match on a substring of the command and the first match wins.
/// Every command is recorded in order.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Vec<(String, ScriptedResponse)>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with `code`
    pub fn fail_on(mut self, pattern: &str, code: i32, stderr: &str) -> Self {
        self.rules.push((
            pattern.to_string(),
            ScriptedResponse::Exit {
                code,
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    /// Commands containing `pattern` never complete
    pub fn hang_on(mut self, pattern: &str) -> Self {
        self.rules
            .push((pattern.to_string(), ScriptedResponse::Hang));
        self
    }

    /// Commands containing `pattern` fail to start
    pub fn spawn_error_on(mut self, pattern: &str, message: &str) -> Self {
        self.rules.push((
            pattern.to_string(),
            ScriptedResponse::SpawnError(message.to_string()),
        ));
        self
    }

    /// Commands executed so far, as received
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        command: &str,
        _env: &BTreeMap<String, String>,
        _workdir: &Path,
    ) -> Result<CommandOutput> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());

        let response = self
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            None => Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            }),
            Some(ScriptedResponse::Exit { code, stderr }) => Ok(CommandOutput {
                exit_code: Some(code),
                stdout: String::new(),
                stderr,
            }),
            Some(ScriptedResponse::Hang) => std::future::pending().await,
            Some(ScriptedResponse::SpawnError(message)) => anyhow::bail!("{}", message),
        }
    }
}
