//! Pipeline orchestrator
//!
//! Drives each run through the fixed Source -> Build stage graph:
//! - Source fetches are serialized, so a new trigger does not start fetching
//!   until the previous run's source artifact is recorded
//! - At most one Build stage runs at a time
//! - A queued run whose revision is no longer the newest fetched one is
//!   superseded instead of built
//! - Effects of every build are recorded in the provisioner's ledger

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shipyard_core::StageGraphError;
use shipyard_core::domain::artifact::Artifact;
use shipyard_core::domain::binding::EnvironmentBinding;
use shipyard_core::domain::buildspec::BuildSpec;
use shipyard_core::domain::log::LogEntry;
use shipyard_core::domain::resource::ResourceHandles;
use shipyard_core::domain::run::{BuildState, PipelineRun, RunFailure, RunStatus, StageStatus};
use shipyard_core::domain::stage::{PipelineDefinition, StageName};
use shipyard_core::dto::trigger::TriggerEvent;
use shipyard_core::error::FailureCause;
use shipyard_provisioner::{AccessBinder, ResourceProvisioner, StackConfig};
use shipyard_runner::{BuildContext, BuildRequest, BuildStageRunner, CommandExecutor};

use crate::config::OrchestratorConfig;
use crate::repository::{RepositoryError, RunRepository};
use crate::source::SourceProvider;

/// Orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("invalid pipeline: {0}")]
    StageGraph(#[from] StageGraphError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Builds the environment of a build
///
/// Built-in names come from the provisioned handles and the revision, then
/// the build spec's declared variables and secret references are added.
pub fn derive_binding(
    handles: &ResourceHandles,
    revision: &str,
    spec: &BuildSpec,
) -> EnvironmentBinding {
    let mut binding =
        EnvironmentBinding::builtin(&handles.registry.uri, &handles.cluster.name, revision);
    for (name, value) in spec.declared_variables() {
        binding.insert(name, value);
    }
    for (name, reference) in spec.declared_secrets() {
        binding.insert_secret(name, reference);
    }
    binding
}

/// An accepted trigger waiting to run
struct Admitted {
    run: PipelineRun,
    /// Arrival order, starting at 1
    sequence: u64,
    cancel: watch::Receiver<bool>,
}

pub struct PipelineOrchestrator {
    pipeline: PipelineDefinition,
    /// Build spec path relative to the source checkout
    buildspec: String,
    provisioner: Arc<ResourceProvisioner>,
    binder: Arc<AccessBinder>,
    source: Arc<dyn SourceProvider>,
    runner: BuildStageRunner,
    repository: Arc<dyn RunRepository>,
    workspace: PathBuf,
    supersede: bool,

    source_gate: tokio::sync::Mutex<()>,
    build_slot: Semaphore,
    sequence: AtomicU64,
    /// Highest sequence whose source fetch completed
    latest_fetched: AtomicU64,

    /// Cancellation senders of runs that have not finished
    cancellations: std::sync::Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &OrchestratorConfig,
        stack: &StackConfig,
        provisioner: Arc<ResourceProvisioner>,
        binder: Arc<AccessBinder>,
        source: Arc<dyn SourceProvider>,
        executor: Arc<dyn CommandExecutor>,
        repository: Arc<dyn RunRepository>,
    ) -> Result<Self, OrchestratorError> {
        let pipeline = PipelineDefinition::standard(&stack.pipeline.name, &stack.pipeline.branch);
        pipeline.validate()?;

        let runner = BuildStageRunner::new(
            executor,
            binder.clone(),
            provisioner.clone(),
            config.runner.clone(),
        );

        Ok(Self {
            pipeline,
            buildspec: stack.pipeline.buildspec.clone(),
            provisioner,
            binder,
            source,
            runner,
            repository,
            workspace: config.runner.workspace_base.clone(),
            supersede: config.supersede,
            source_gate: tokio::sync::Mutex::new(()),
            build_slot: Semaphore::new(1),
            sequence: AtomicU64::new(0),
            latest_fetched: AtomicU64::new(0),
            cancellations: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    pub fn provisioner(&self) -> &Arc<ResourceProvisioner> {
        &self.provisioner
    }

    pub fn binder(&self) -> &Arc<AccessBinder> {
        &self.binder
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Handles a change event and runs it to completion
    ///
    /// Returns `None` when the event is for a branch the pipeline ignores.
    pub async fn on_trigger(
        &self,
        event: TriggerEvent,
    ) -> Result<Option<PipelineRun>, OrchestratorError> {
        let Some(admitted) = self.admit(&event).await? else {
            return Ok(None);
        };
        Ok(Some(self.execute(admitted).await))
    }

    /// Handles a change event in the background
    ///
    /// Returns the queued run record immediately.
    pub async fn enqueue(
        self: &Arc<Self>,
        event: TriggerEvent,
    ) -> Result<Option<PipelineRun>, OrchestratorError> {
        let Some(admitted) = self.admit(&event).await? else {
            return Ok(None);
        };
        let queued = admitted.run.clone();

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(admitted).await;
        });

        Ok(Some(queued))
    }

    /// Signals a run that has not finished to stop
    ///
    /// Returns the record as it was when the signal was sent, still `Queued`
    /// or `InProgress`. The run moves to `Cancelled` once its current command
    /// or wait is interrupted; poll the run to observe it.
    pub async fn cancel(&self, id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        let run = self.get_run(id).await?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} is already {}",
                id, run.status
            )));
        }

        let signalled = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .is_some_and(|tx| tx.send(true).is_ok());

        if !signalled {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} is not active",
                id
            )));
        }

        info!("Cancellation requested for run {}", id);
        Ok(run)
    }

    async fn admit(&self, event: &TriggerEvent) -> Result<Option<Admitted>, OrchestratorError> {
        let branch = event.branch_name();
        if branch != self.pipeline.branch {
            info!(
                "Ignoring change on branch '{}' (pipeline follows '{}')",
                branch, self.pipeline.branch
            );
            return Ok(None);
        }

        let revision = event
            .checked_revision()
            .map_err(OrchestratorError::InvalidTrigger)?;

        let run = PipelineRun::new(&self.pipeline.name, branch, revision);
        self.repository.save(&run).await?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(false);
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id, tx);

        info!("Run {} queued for {} at {}", run.id, branch, revision);
        Ok(Some(Admitted {
            run,
            sequence,
            cancel: rx,
        }))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_run(&self, id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.repository
            .find(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// All runs, newest first
    pub async fn list_runs(&self) -> Result<Vec<PipelineRun>, OrchestratorError> {
        Ok(self.repository.list().await?)
    }

    pub async fn run_logs(&self, id: Uuid) -> Result<Vec<LogEntry>, OrchestratorError> {
        // Verify run exists first
        self.get_run(id).await?;
        Ok(self.repository.logs(id).await?)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute(&self, admitted: Admitted) -> PipelineRun {
        let Admitted {
            mut run,
            sequence,
            cancel,
        } = admitted;
        let ctx = BuildContext::with_cancellation(run.id, cancel);

        self.run_stages(&mut run, sequence, &ctx).await;

        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run.id);
        self.save(&run, &ctx).await;
        self.cleanup(run.id).await;

        info!("Run {} finished: {}", run.id, run.status);
        run
    }

    async fn run_stages(&self, run: &mut PipelineRun, sequence: u64, ctx: &BuildContext) {
        // Source stage, one fetch at a time
        let artifact = {
            let _gate = tokio::select! {
                gate = self.source_gate.lock() => gate,
                _ = ctx.cancelled() => return self.cancel_run(run, ctx, None),
            };
            if ctx.is_cancelled() {
                return self.cancel_run(run, ctx, None);
            }

            run.start_stage(StageName::Source);
            ctx.log_info(format!("Fetching source at {}", run.revision));
            self.save(run, ctx).await;

            let destination = self.workspace.join(run.id.to_string()).join("source");
            let fetched = tokio::select! {
                fetched = self.source.fetch(&run.revision, &destination) => fetched,
                _ = ctx.cancelled() => return self.cancel_run(run, ctx, Some(StageName::Source)),
            };

            match fetched {
                Ok(artifact) => {
                    ctx.log_info(format!("Produced {}", artifact.qualified_name()));
                    run.source_artifact = Some(artifact.clone());
                    run.complete_stage(StageName::Source, StageStatus::Succeeded);
                    self.latest_fetched.fetch_max(sequence, Ordering::SeqCst);
                    self.save(run, ctx).await;
                    artifact
                }
                Err(cause) => {
                    error!("Source stage of run {} failed: {}", run.id, cause);
                    ctx.log_error(format!("Source stage failed: {}", cause));
                    run.fail(RunFailure {
                        stage: StageName::Source,
                        phase: None,
                        cause,
                    });
                    return;
                }
            }
        };

        // Build stage, one build at a time
        let permit = tokio::select! {
            permit = self.build_slot.acquire() => permit,
            _ = ctx.cancelled() => return self.cancel_run(run, ctx, None),
        };
        let Ok(_permit) = permit else {
            // The semaphore is never closed while the orchestrator is alive
            error!("Build slot closed; abandoning run {}", run.id);
            run.finish(RunStatus::Cancelled);
            return;
        };
        if ctx.is_cancelled() {
            return self.cancel_run(run, ctx, None);
        }

        if self.supersede && self.latest_fetched.load(Ordering::SeqCst) > sequence {
            info!("Run {} superseded by a newer revision", run.id);
            ctx.log_warning("Superseded by a newer revision; build skipped");
            run.finish(RunStatus::Superseded);
            return;
        }

        run.start_stage(StageName::Build);
        self.save(run, ctx).await;

        let request = match self.build_request(&artifact) {
            Ok(request) => request,
            Err(cause) => {
                error!("Build stage of run {} could not start: {}", run.id, cause);
                ctx.log_error(format!("Build stage failed: {}", cause));
                run.fail(RunFailure {
                    stage: StageName::Build,
                    phase: None,
                    cause,
                });
                return;
            }
        };

        let outcome = self.runner.run(ctx, &request).await;

        if !outcome.effects.is_empty() {
            if let Err(e) = self.provisioner.record_effects(
                run.id,
                &run.revision,
                &outcome.effects,
                outcome.succeeded(),
            ) {
                warn!("Failed to record effects of run {}: {}", run.id, e);
            }
        }

        let state = outcome.state.clone();
        run.build = Some(outcome);

        match state {
            BuildState::Succeeded => {
                run.complete_stage(StageName::Build, StageStatus::Succeeded);
                run.finish(RunStatus::Succeeded);
            }
            BuildState::Failed { phase, cause } => run.fail(RunFailure {
                stage: StageName::Build,
                phase: Some(phase),
                cause,
            }),
            BuildState::Cancelled { .. } => {
                run.complete_stage(StageName::Build, StageStatus::Cancelled);
                run.finish(RunStatus::Cancelled);
            }
            other => {
                error!("Build of run {} returned in state {}", run.id, other);
                run.complete_stage(StageName::Build, StageStatus::Failed);
                run.finish(RunStatus::Failed);
            }
        }
    }

    fn build_request(&self, artifact: &Artifact) -> Result<BuildRequest, FailureCause> {
        let handles = self
            .provisioner
            .handles()
            .ok_or_else(|| FailureCause::Provisioning {
                message: "stack is not provisioned".to_string(),
            })?;

        let path = artifact.location().join(&self.buildspec);
        let spec = BuildSpec::from_file(&path).map_err(|e| FailureCause::PhaseExecution {
            command: format!("load {}", self.buildspec),
            exit_code: None,
            detail: Some(e.to_string()),
        })?;

        Ok(BuildRequest {
            phases: spec.phases(),
            binding: derive_binding(&handles, artifact.revision(), &spec),
            workdir: artifact.location().to_path_buf(),
            handles,
            revision: artifact.revision().to_string(),
        })
    }

    fn cancel_run(&self, run: &mut PipelineRun, ctx: &BuildContext, stage: Option<StageName>) {
        info!("Run {} cancelled", run.id);
        ctx.log_warning("Run cancelled");
        if let Some(stage) = stage {
            run.complete_stage(stage, StageStatus::Cancelled);
        }
        run.finish(RunStatus::Cancelled);
    }

    /// Saves the run and flushes its buffered log entries
    async fn save(&self, run: &PipelineRun, ctx: &BuildContext) {
        if let Err(e) = self.repository.save(run).await {
            error!("Failed to save run {}: {}", run.id, e);
        }

        let logs = ctx.drain_logs();
        if logs.is_empty() {
            return;
        }
        if let Err(e) = self.repository.append_logs(run.id, logs).await {
            error!("Failed to save logs of run {}: {}", run.id, e);
        }
    }

    /// Removes the run's workspace
    async fn cleanup(&self, id: Uuid) {
        let dir = self.workspace.join(id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed workspace {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", dir.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::domain::binding::BindingValue;
    use shipyard_runner::ScriptedExecutor;

    use crate::repository::InMemoryRunRepository;
    use crate::source::StaticSource;

    fn orchestrator(workspace: &std::path::Path) -> PipelineOrchestrator {
        let mut config = OrchestratorConfig::default();
        config.runner.workspace_base = workspace.to_path_buf();
        PipelineOrchestrator::new(
            &config,
            &StackConfig::default(),
            Arc::new(ResourceProvisioner::new()),
            Arc::new(AccessBinder::new()),
            Arc::new(StaticSource::new()),
            Arc::new(ScriptedExecutor::new()),
            Arc::new(InMemoryRunRepository::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_derive_binding() {
        let provisioner = ResourceProvisioner::new();
        let handles = provisioner.provision(&StackConfig::default()).unwrap();
        let spec = BuildSpec::from_yaml(
            r#"
version: 0.2
env:
  variables:
    AWS_DEFAULT_REGION: us-east-1
  secrets:
    DATABASE_URL: "microservice-config:DATABASE_URL"
phases:
  build:
    commands:
      - echo $REPOSITORY_URI
"#,
        )
        .unwrap();

        let binding = derive_binding(&handles, "abc123", &spec);

        assert_eq!(binding.plain("REPOSITORY_URI"), Some(handles.registry.uri.as_str()));
        assert_eq!(binding.plain("CLUSTER_NAME"), Some("microservice-cluster"));
        assert_eq!(binding.plain("RESOLVED_SOURCE_VERSION"), Some("abc123"));
        assert_eq!(binding.plain("AWS_DEFAULT_REGION"), Some("us-east-1"));
        assert!(matches!(
            binding.get("DATABASE_URL"),
            Some(BindingValue::Secret(r)) if r.key == "DATABASE_URL"
        ));
    }

    #[tokio::test]
    async fn test_other_branches_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let run = orchestrator
            .on_trigger(TriggerEvent::new("refs/heads/develop", "abc123"))
            .await
            .unwrap();

        assert!(run.is_none());
        assert!(orchestrator.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_revision_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let err = orchestrator
            .on_trigger(TriggerEvent::new("main", "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTrigger(_)));
    }

    #[tokio::test]
    async fn test_option_like_revision_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        for revision in ["--upload-pack=touch /tmp/pwned", "abc123; id"] {
            let err = orchestrator
                .on_trigger(TriggerEvent::new("main", revision))
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidTrigger(_)));
        }
        assert!(orchestrator.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let err = orchestrator.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unprovisioned_stack_fails_build_stage() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let run = orchestrator
            .on_trigger(TriggerEvent::new("main", "abc123"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.failure.unwrap();
        assert_eq!(failure.stage, StageName::Build);
        assert_eq!(failure.cause.label(), "ProvisioningError");
        assert!(run.build.is_none());
        // Workspace is cleaned up after the run
        assert!(!dir.path().join(run.id.to_string()).exists());
    }
}
