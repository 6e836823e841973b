//! Podman build containers
//!
//! Handles the container lifecycle for a build:
//! - Checking podman availability
//! - Starting one build container per run with the workspace mounted
//! - Executing commands in it with the bound environment
//! - Removing it when the run finishes

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::{CommandExecutor, CommandOutput};

/// Mount point of the run workspace inside the container
const WORKSPACE_MOUNT: &str = "/workspace";

/// Checks if podman is installed and available
pub fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

struct RunContainer {
    name: String,
    /// Host directory mounted at `/workspace`
    workspace: String,
}

/// Runs build commands inside a per-run podman container
pub struct ContainerExecutor {
    image: String,
    privileged: bool,

    /// Active containers: run id -> container
    containers: Mutex<HashMap<Uuid, RunContainer>>,
}

impl ContainerExecutor {
    pub fn new(image: String, privileged: bool) -> Self {
        Self {
            image,
            privileged,
            containers: Mutex::new(HashMap::new()),
        }
    }

    fn container_name(run_id: Uuid) -> String {
        format!("shipyard-build-{}", run_id)
    }

    /// Finds the container whose workspace contains `workdir`
    ///
    /// Returns the container name and `workdir` translated to the mount.
    fn locate(&self, workdir: &Path) -> Result<(String, String)> {
        let containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        let workdir = workdir.to_string_lossy();

        containers
            .values()
            .find_map(|c| {
                workdir.strip_prefix(c.workspace.as_str()).map(|rest| {
                    let inner = format!("{}{}", WORKSPACE_MOUNT, rest);
                    (c.name.clone(), inner)
                })
            })
            .ok_or_else(|| anyhow::anyhow!("No build container for {}", workdir))
    }
}

#[async_trait]
impl CommandExecutor for ContainerExecutor {
    async fn prepare(&self, run_id: Uuid, workdir: &Path) -> Result<()> {
        let name = Self::container_name(run_id);
        let workspace = workdir.to_string_lossy().to_string();

        std::fs::create_dir_all(workdir).context("Failed to create workspace directory")?;

        info!("Creating build container {} from image {}", name, self.image);

        // Keep the container alive; commands are run through `podman exec`
        let mut cmd = tokio::process::Command::new("podman");
        cmd.arg("run").arg("-d").arg("--name").arg(&name);
        if self.privileged {
            cmd.arg("--privileged");
        }
        let output = cmd
            .arg("--entrypoint")
            .arg("/bin/sh")
            .arg("-v")
            .arg(format!("{}:{}", workspace, WORKSPACE_MOUNT))
            .arg("-w")
            .arg(WORKSPACE_MOUNT)
            .arg(&self.image)
            .arg("-c")
            .arg("sleep infinity")
            .output()
            .await
            .context("Failed to execute podman run command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let error_msg = format!(
                "Failed to start build container from {}: exit_code={}, stderr='{}'",
                self.image,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            error!("{}", error_msg);
            anyhow::bail!("{}", error_msg);
        }

        info!(
            "Build container {} started with ID: {}",
            name,
            stdout.trim()
        );

        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, RunContainer { name, workspace });

        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        workdir: &Path,
    ) -> Result<CommandOutput> {
        let (container, inner_dir) = self.locate(workdir)?;
        debug!("Executing in container {}: {}", container, command);

        let mut cmd = tokio::process::Command::new("podman");
        cmd.arg("exec").arg("-w").arg(&inner_dir);
        for (name, value) in env {
            cmd.arg("-e").arg(format!("{}={}", name, value));
        }
        let output = cmd
            .arg(&container)
            .arg("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute podman exec command")?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Stops and removes the run's container
    async fn finish(&self, run_id: Uuid) -> Result<()> {
        let Some(container) = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id)
        else {
            return Ok(());
        };

        let rm_output = tokio::process::Command::new("podman")
            .arg("rm")
            .arg("-f")
            .arg(&container.name)
            .output()
            .await;

        match rm_output {
            Ok(output) if output.status.success() => {
                debug!("Container {} removed", container.name);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Failed to remove container {}: {}", container.name, stderr);
            }
            Err(e) => {
                warn!("Failed to remove container {}: {}", container.name, e);
            }
        }

        Ok(())
    }
}
