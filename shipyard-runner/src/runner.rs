//! Build stage runner
//!
//! Executes install -> pre_build -> build -> post_build against a build
//! environment. Before anything runs, every referenced binding must be
//! present and every registry or cluster operation must be authorized for
//! the build identity; either check failing ends the run with zero side
//! effects. After that, phases and their commands run strictly in order and
//! the first failure is absorbing.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use shipyard_core::domain::binding::EnvironmentBinding;
use shipyard_core::domain::buildspec::{BuildPhase, PhaseName};
use shipyard_core::domain::grant::{Authorizer, Capability, ResourceRef};
use shipyard_core::domain::resource::ResourceHandles;
use shipyard_core::domain::run::{BuildOutcome, BuildState, CommandRecord, Effect};
use shipyard_core::domain::secret::SecretResolver;
use shipyard_core::error::FailureCause;

use crate::command::{CommandKind, classify, is_compound};
use crate::config::RunnerConfig;
use crate::context::BuildContext;
use crate::executor::{CommandExecutor, CommandOutput};

/// Exit code reported for commands killed by the timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Longest stderr excerpt kept in a failure cause
const MAX_DETAIL_LEN: usize = 2000;

/// Everything the build stage needs for one run
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Phases in execution order
    pub phases: Vec<BuildPhase>,
    pub binding: EnvironmentBinding,
    /// Source checkout the commands run in
    pub workdir: PathBuf,
    pub handles: ResourceHandles,
    /// Revision being built; the image tag that must be pushed and deployed
    pub revision: String,
}

/// A command ready to run
struct PlannedCommand {
    /// As declared in the build spec
    declared: String,
    /// With plain bindings expanded and secrets masked
    display: String,
    kinds: Vec<CommandKind>,
    /// Several commands chained with `&&`, `||`, `;` or `|`
    compound: bool,
}

struct PlannedPhase {
    phase: BuildPhase,
    commands: Vec<PlannedCommand>,
}

/// How a single command ended
enum CommandEnd {
    Completed(CommandOutput),
    TimedOut,
    SpawnFailed(String),
    Cancelled,
}

/// Resolved secret values, replaced with `****` in everything logged
#[derive(Debug)]
struct SecretMask {
    values: Vec<String>,
}

impl SecretMask {
    fn new(binding: &EnvironmentBinding, env: &BTreeMap<String, String>) -> Self {
        let mut values: Vec<String> = binding
            .secret_refs()
            .filter_map(|(name, _)| env.get(name))
            .filter(|value| !value.is_empty())
            .cloned()
            .collect();
        // Longest first, so a value containing another is masked whole
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        Self { values }
    }

    fn apply(&self, text: &str) -> String {
        self.values
            .iter()
            .fold(text.to_string(), |masked, value| {
                masked.replace(value.as_str(), "****")
            })
    }
}

/// Runs the build stage
pub struct BuildStageRunner {
    executor: Arc<dyn CommandExecutor>,
    authorizer: Arc<dyn Authorizer>,
    secrets: Arc<dyn SecretResolver>,
    config: RunnerConfig,
}

impl BuildStageRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        authorizer: Arc<dyn Authorizer>,
        secrets: Arc<dyn SecretResolver>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            executor,
            authorizer,
            secrets,
            config,
        }
    }

    /// Runs every phase of `request` and returns the terminal outcome
    pub async fn run(&self, ctx: &BuildContext, request: &BuildRequest) -> BuildOutcome {
        let mut outcome = BuildOutcome::new(BuildState::Pending);
        info!("Build started for run {} at {}", ctx.run_id, request.revision);
        ctx.log_info(format!("Build started for revision {}", request.revision));

        if let Err((phase, cause)) = self.check_bindings(request) {
            return self.fail(ctx, outcome, phase, cause);
        }

        let plan = self.plan(request);

        if let Err((phase, cause)) = self.preflight(request, &plan) {
            return self.fail(ctx, outcome, phase, cause);
        }

        let env = match self.resolve_environment(request) {
            Ok(env) => env,
            Err(cause) => return self.fail(ctx, outcome, PhaseName::Install, cause),
        };
        let mask = SecretMask::new(&request.binding, &env);

        if ctx.is_cancelled() {
            ctx.log_warning("Build cancelled before it started");
            outcome.state = BuildState::Cancelled { phase: None };
            return outcome;
        }

        if let Err(e) = self.executor.prepare(ctx.run_id, &request.workdir).await {
            let cause = FailureCause::PhaseExecution {
                command: "prepare build environment".to_string(),
                exit_code: None,
                detail: Some(e.to_string()),
            };
            return self.fail(ctx, outcome, PhaseName::Install, cause);
        }

        self.execute_phases(ctx, request, &plan, &env, &mask, &mut outcome)
            .await;

        if let Err(e) = self.executor.finish(ctx.run_id).await {
            warn!("Failed to release build environment for {}: {}", ctx.run_id, e);
        }

        if !outcome.state.is_terminal() {
            outcome.state = match self.check_required_effects(request, &outcome.effects) {
                Ok(()) => BuildState::Succeeded,
                Err(cause) => {
                    error!("Build for {} is missing an effect: {}", ctx.run_id, cause);
                    ctx.log_error(cause.to_string());
                    BuildState::Failed {
                        phase: PhaseName::PostBuild,
                        cause,
                    }
                }
            };
        }

        match &outcome.state {
            BuildState::Succeeded => {
                info!("Build for run {} succeeded", ctx.run_id);
                ctx.log_info("Build succeeded");
            }
            state => {
                info!("Build for run {} ended {}", ctx.run_id, state);
                if outcome.is_partial() {
                    ctx.log_warning(format!(
                        "Build left {} incomplete effect(s) behind",
                        outcome.effects.len()
                    ));
                }
            }
        }

        outcome
    }

    fn fail(
        &self,
        ctx: &BuildContext,
        mut outcome: BuildOutcome,
        phase: PhaseName,
        cause: FailureCause,
    ) -> BuildOutcome {
        error!("Build for run {} failed in {}: {}", ctx.run_id, phase, cause);
        ctx.log_error(format!("Phase {} failed: {}", phase, cause));
        outcome.state = BuildState::Failed { phase, cause };
        outcome
    }

    /// Every referenced name must be bound before anything runs
    fn check_bindings(&self, request: &BuildRequest) -> Result<(), (PhaseName, FailureCause)> {
        for phase in &request.phases {
            for command in &phase.commands {
                if let Some(name) = request.binding.first_missing(command) {
                    return Err((phase.name, FailureCause::BindingMissing { name }));
                }
            }
        }
        Ok(())
    }

    fn plan(&self, request: &BuildRequest) -> Vec<PlannedPhase> {
        request
            .phases
            .iter()
            .map(|phase| PlannedPhase {
                phase: phase.clone(),
                commands: phase
                    .commands
                    .iter()
                    .map(|declared| {
                        let display = request.binding.expand_plain(declared);
                        let kinds = classify(&display);
                        PlannedCommand {
                            declared: declared.clone(),
                            compound: is_compound(&display),
                            display,
                            kinds,
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Checks every grant the plan needs before any command runs
    fn preflight(
        &self,
        request: &BuildRequest,
        plan: &[PlannedPhase],
    ) -> Result<(), (PhaseName, FailureCause)> {
        let identity = &request.handles.build_identity;
        for planned in plan {
            for command in &planned.commands {
                for kind in &command.kinds {
                    let (resource, capability) = kind.required_grant(&request.handles);
                    self.authorizer
                        .check(identity, &resource, capability)
                        .map_err(|cause| (planned.phase.name, cause))?;
                }
            }
        }
        Ok(())
    }

    /// Resolves secret-backed bindings; requires read on each secret
    fn resolve_environment(
        &self,
        request: &BuildRequest,
    ) -> Result<BTreeMap<String, String>, FailureCause> {
        let identity = &request.handles.build_identity;
        for (_, reference) in request.binding.secret_refs() {
            self.authorizer.check(
                identity,
                &ResourceRef::secret(&reference.secret),
                Capability::Read,
            )?;
        }
        request.binding.resolve(self.secrets.as_ref())
    }

    async fn execute_phases(
        &self,
        ctx: &BuildContext,
        request: &BuildRequest,
        plan: &[PlannedPhase],
        env: &BTreeMap<String, String>,
        mask: &SecretMask,
        outcome: &mut BuildOutcome,
    ) {
        for planned in plan {
            let phase = planned.phase.name;
            outcome.state = BuildState::running(phase);
            outcome.visited.push(phase);
            info!("Run {} entering phase {}", ctx.run_id, phase);
            ctx.log_info(format!("Entering phase {}", phase));

            for (runtime, version) in &planned.phase.runtime_versions {
                ctx.log_info(format!("Runtime {}: {}", runtime, version));
            }

            for command in &planned.commands {
                if ctx.is_cancelled() {
                    self.cancel(ctx, outcome, phase);
                    return;
                }

                ctx.log_info(format!("$ {}", command.display));
                let started_at = Utc::now();
                let started = Instant::now();

                let end = self.execute_command(ctx, &command.declared, env, request).await;

                let exit_code = match &end {
                    CommandEnd::Completed(output) => output.exit_code,
                    CommandEnd::TimedOut => Some(TIMEOUT_EXIT_CODE),
                    CommandEnd::SpawnFailed(_) | CommandEnd::Cancelled => None,
                };
                outcome.commands.push(CommandRecord {
                    phase,
                    command: command.declared.clone(),
                    exit_code,
                    started_at,
                    duration_ms: started.elapsed().as_millis() as u64,
                });

                let cause = match end {
                    CommandEnd::Completed(output) => {
                        log_output(ctx, &output, mask);
                        if output.success() {
                            outcome
                                .effects
                                .extend(command.kinds.iter().filter_map(CommandKind::effect));
                            continue;
                        }
                        if command.compound {
                            record_possible_effects(ctx, outcome, command);
                        }
                        self.command_failure(request, command, &output, mask)
                    }
                    CommandEnd::TimedOut => {
                        record_possible_effects(ctx, outcome, command);
                        FailureCause::PhaseExecution {
                            command: command.display.clone(),
                            exit_code: Some(TIMEOUT_EXIT_CODE),
                            detail: Some(format!(
                                "timed out after {}s",
                                self.config.command_timeout.as_secs()
                            )),
                        }
                    }
                    CommandEnd::SpawnFailed(message) => FailureCause::PhaseExecution {
                        command: command.display.clone(),
                        exit_code: None,
                        detail: Some(mask.apply(&message)),
                    },
                    CommandEnd::Cancelled => {
                        record_possible_effects(ctx, outcome, command);
                        self.cancel(ctx, outcome, phase);
                        return;
                    }
                };

                error!("Run {} failed in {}: {}", ctx.run_id, phase, cause);
                ctx.log_error(format!("Phase {} failed: {}", phase, cause));
                outcome.state = BuildState::Failed { phase, cause };
                return;
            }

            debug!("Run {} completed phase {}", ctx.run_id, phase);
        }
    }

    async fn execute_command(
        &self,
        ctx: &BuildContext,
        command: &str,
        env: &BTreeMap<String, String>,
        request: &BuildRequest,
    ) -> CommandEnd {
        let execution = tokio::time::timeout(
            self.config.command_timeout,
            self.executor.execute(command, env, &request.workdir),
        );

        // Losing the race drops the execution future, which kills the process
        tokio::select! {
            result = execution => match result {
                Ok(Ok(output)) => CommandEnd::Completed(output),
                Ok(Err(e)) => CommandEnd::SpawnFailed(e.to_string()),
                Err(_) => CommandEnd::TimedOut,
            },
            _ = ctx.cancelled() => CommandEnd::Cancelled,
        }
    }

    fn cancel(&self, ctx: &BuildContext, outcome: &mut BuildOutcome, phase: PhaseName) {
        warn!("Run {} cancelled during {}", ctx.run_id, phase);
        ctx.log_warning(format!("Build cancelled during phase {}", phase));
        outcome.state = BuildState::Cancelled { phase: Some(phase) };
    }

    /// Maps a non-zero exit to a failure cause
    ///
    /// A failed credential step means the registry or cluster rejected the
    /// build identity.
    fn command_failure(
        &self,
        request: &BuildRequest,
        command: &PlannedCommand,
        output: &CommandOutput,
        mask: &SecretMask,
    ) -> FailureCause {
        let detail = excerpt(&mask.apply(&output.stderr));

        if let Some(step) = command.kinds.iter().find(|k| k.is_credential_step()) {
            let (resource, capability) = step.required_grant(&request.handles);
            return FailureCause::Authorization {
                principal: request.handles.build_identity.clone(),
                resource,
                capability,
                detail: Some(detail.unwrap_or_else(|| {
                    format!("`{}` was rejected", command.display)
                })),
            };
        }

        FailureCause::PhaseExecution {
            command: command.display.clone(),
            exit_code: output.exit_code,
            detail,
        }
    }

    /// The revision image must be pushed and deployed for the build to count
    fn check_required_effects(
        &self,
        request: &BuildRequest,
        effects: &[Effect],
    ) -> Result<(), FailureCause> {
        if !self.config.require_effects {
            return Ok(());
        }

        let registry = &request.handles.registry;
        let revision_image = |image: &shipyard_core::domain::resource::ImageRef| {
            registry.owns(image) && image.tag == request.revision
        };

        let pushed = effects.iter().any(|e| match e {
            Effect::ImagePushed { image } => revision_image(image),
            _ => false,
        });
        if !pushed {
            return Err(FailureCause::EffectMissing {
                effect: format!("push of {}:{}", registry.uri, request.revision),
            });
        }

        let deployed = effects.iter().any(|e| match e {
            Effect::DeploymentUpdated { image, .. } => revision_image(image),
            _ => false,
        });
        if !deployed {
            return Err(FailureCause::EffectMissing {
                effect: format!("deployment update to {}:{}", registry.uri, request.revision),
            });
        }

        Ok(())
    }
}

fn excerpt(stderr: &str) -> Option<String> {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() <= MAX_DETAIL_LEN {
        return Some(trimmed.to_string());
    }
    // Keep the tail; the cause of a failure is usually printed last
    let mut start = trimmed.len() - MAX_DETAIL_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    Some(format!("...{}", &trimmed[start..]))
}

fn log_output(ctx: &BuildContext, output: &CommandOutput, mask: &SecretMask) {
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        ctx.log_info(mask.apply(line));
    }
    for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
        ctx.log_warning(mask.apply(line));
    }
}

/// Keeps the effects of a command that stopped part way
///
/// A chained command or an interrupted process may have pushed or applied
/// something before it ended, so its effects count as possibly applied and
/// the run reports them as partial.
fn record_possible_effects(
    ctx: &BuildContext,
    outcome: &mut BuildOutcome,
    command: &PlannedCommand,
) {
    for effect in command.kinds.iter().filter_map(CommandKind::effect) {
        warn!("Run {} may have {} before failing", ctx.run_id, effect);
        ctx.log_warning(format!("Possibly applied before failure: {}", effect));
        outcome.effects.push(effect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::domain::grant::{Principal, ResourceKind};
    use shipyard_core::domain::resource::{
        ClusterHandle, ImageRef, NetworkHandle, RegistryHandle, RemovalPolicy,
    };
    use shipyard_core::domain::secret::{SecretKeyRef, SecretRef, SecretValue};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::watch;
    use uuid::Uuid;

    use crate::executor::{ScriptedExecutor, ShellExecutor};

    const REGISTRY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/node-data-microservice";
    const LOGIN: &str = "aws ecr get-login-password --region $AWS_DEFAULT_REGION | docker login --username AWS --password-stdin $AWS_ACCOUNT_ID.dkr.ecr.$AWS_DEFAULT_REGION.amazonaws.com";
    const SET_IMAGE: &str = "kubectl set image deployment/data-microservice microservice=$REPOSITORY_URI:$RESOLVED_SOURCE_VERSION";

    /// Grants held in a list
    struct GrantList(Mutex<Vec<(ResourceRef, Capability)>>);

    impl GrantList {
        fn full() -> Self {
            Self(Mutex::new(vec![
                (ResourceRef::registry("node-data-microservice"), Capability::Push),
                (ResourceRef::registry("node-data-microservice"), Capability::Pull),
                (ResourceRef::cluster("microservice-cluster"), Capability::Deploy),
                (ResourceRef::secret("microservice-config"), Capability::Read),
            ]))
        }

        fn without(self, resource: ResourceRef, capability: Capability) -> Self {
            self.0
                .lock()
                .unwrap()
                .retain(|(r, c)| !(r == &resource && *c == capability));
            self
        }
    }

    impl Authorizer for GrantList {
        fn check(
            &self,
            principal: &Principal,
            resource: &ResourceRef,
            capability: Capability,
        ) -> Result<(), FailureCause> {
            if self
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|(r, c)| r == resource && *c == capability)
            {
                Ok(())
            } else {
                Err(FailureCause::unauthorized(principal, resource, capability))
            }
        }
    }

    struct Secrets;

    impl SecretResolver for Secrets {
        fn resolve(&self, reference: &SecretKeyRef) -> Result<SecretValue, FailureCause> {
            Ok(SecretValue::new(format!("value-of-{}", reference.key)))
        }
    }

    fn handles() -> ResourceHandles {
        ResourceHandles {
            network: NetworkHandle {
                id: Uuid::new_v4(),
                name: "microservice-vpc".to_string(),
                availability_zones: 2,
                nat_gateways: 1,
            },
            registry: RegistryHandle {
                id: Uuid::new_v4(),
                name: "node-data-microservice".to_string(),
                uri: REGISTRY.to_string(),
                policy: RemovalPolicy::Destroy,
            },
            cluster: ClusterHandle {
                id: Uuid::new_v4(),
                name: "microservice-cluster".to_string(),
                endpoint: "https://microservice-cluster.us-east-1.eks.amazonaws.com".to_string(),
                version: "1.27".to_string(),
            },
            secret: SecretRef::new("microservice-config"),
            build_identity: Principal::new("microservice-build-role"),
        }
    }

    fn phases() -> Vec<BuildPhase> {
        let mut install = BuildPhase::new(PhaseName::Install, vec![]);
        install
            .runtime_versions
            .insert("nodejs".to_string(), "20".to_string());
        vec![
            install,
            BuildPhase::new(
                PhaseName::PreBuild,
                vec!["echo Logging in to the registry...".to_string(), LOGIN.to_string()],
            ),
            BuildPhase::new(
                PhaseName::Build,
                vec![
                    "docker build -t $REPOSITORY_URI:latest .".to_string(),
                    "docker tag $REPOSITORY_URI:latest $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION"
                        .to_string(),
                ],
            ),
            BuildPhase::new(
                PhaseName::PostBuild,
                vec![
                    "docker push $REPOSITORY_URI:latest".to_string(),
                    "docker push $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION".to_string(),
                    "aws eks update-kubeconfig --name $CLUSTER_NAME --region $AWS_DEFAULT_REGION"
                        .to_string(),
                    "kubectl apply -f deployment.yaml".to_string(),
                    SET_IMAGE.to_string(),
                ],
            ),
        ]
    }

    fn request(phases: Vec<BuildPhase>) -> BuildRequest {
        let mut binding =
            EnvironmentBinding::builtin(REGISTRY, "microservice-cluster", "abc123");
        binding.insert("AWS_DEFAULT_REGION", "us-east-1");
        binding.insert("AWS_ACCOUNT_ID", "123456789012");
        BuildRequest {
            phases,
            binding,
            workdir: std::env::temp_dir(),
            handles: handles(),
            revision: "abc123".to_string(),
        }
    }

    fn runner(executor: Arc<ScriptedExecutor>, grants: GrantList) -> BuildStageRunner {
        BuildStageRunner::new(
            executor,
            Arc::new(grants),
            Arc::new(Secrets),
            RunnerConfig::default().with_command_timeout(Duration::from_secs(5)),
        )
    }

    fn executed_in(executor: &ScriptedExecutor, phase: &BuildPhase) -> usize {
        executor
            .executed()
            .iter()
            .filter(|c| phase.commands.contains(c))
            .count()
    }

    #[tokio::test]
    async fn test_successful_build_visits_phases_in_order() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = runner(executor.clone(), GrantList::full());
        let ctx = BuildContext::new(Uuid::new_v4());

        let outcome = runner.run(&ctx, &request(phases())).await;

        assert_eq!(outcome.state, BuildState::Succeeded);
        assert_eq!(outcome.visited, PhaseName::ORDER.to_vec());
        let declared: Vec<String> = phases().into_iter().flat_map(|p| p.commands).collect();
        assert_eq!(executor.executed(), declared);
        assert_eq!(outcome.commands.len(), declared.len());
        assert!(outcome.commands.iter().all(|c| c.succeeded()));

        assert_eq!(outcome.pushed_images().count(), 2);
        assert!(outcome.effects.contains(&Effect::DeploymentUpdated {
            deployment: "data-microservice".to_string(),
            container: "microservice".to_string(),
            image: ImageRef::new(REGISTRY, "abc123"),
        }));
        assert!(!outcome.is_partial());

        let logs = ctx.drain_logs();
        assert!(logs.iter().any(|l| l.message == "Runtime nodejs: 20"));
        assert!(logs
            .iter()
            .any(|l| l.message == format!("$ docker push {}:abc123", REGISTRY)));
    }

    #[tokio::test]
    async fn test_failure_is_absorbing() {
        let executor = Arc::new(ScriptedExecutor::new().fail_on("docker build", 2, "no Dockerfile"));
        let runner = runner(executor.clone(), GrantList::full());

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases()))
            .await;

        match &outcome.state {
            BuildState::Failed {
                phase: PhaseName::Build,
                cause: FailureCause::PhaseExecution {
                    command,
                    exit_code,
                    detail,
                },
            } => {
                assert_eq!(command, &format!("docker build -t {}:latest .", REGISTRY));
                assert_eq!(*exit_code, Some(2));
                assert_eq!(detail.as_deref(), Some("no Dockerfile"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(
            outcome.visited,
            vec![PhaseName::Install, PhaseName::PreBuild, PhaseName::Build]
        );
        // The failing command is the last one run
        assert_eq!(executor.executed().len(), 3);
        assert_eq!(executed_in(&executor, &phases()[3]), 0);
        assert!(outcome.effects.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binding_runs_nothing() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = runner(executor.clone(), GrantList::full());
        let mut request = request(phases());
        request.binding = EnvironmentBinding::builtin(REGISTRY, "microservice-cluster", "abc123");

        let outcome = runner.run(&BuildContext::new(Uuid::new_v4()), &request).await;

        assert_eq!(
            outcome.state,
            BuildState::Failed {
                phase: PhaseName::PreBuild,
                cause: FailureCause::BindingMissing {
                    name: "AWS_DEFAULT_REGION".to_string()
                },
            }
        );
        assert!(executor.executed().is_empty());
        assert!(outcome.visited.is_empty());
    }

    #[tokio::test]
    async fn test_missing_deploy_grant_fails_before_any_command() {
        let executor = Arc::new(ScriptedExecutor::new());
        let grants = GrantList::full()
            .without(ResourceRef::cluster("microservice-cluster"), Capability::Deploy);
        let runner = runner(executor.clone(), grants);

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases()))
            .await;

        match &outcome.state {
            BuildState::Failed {
                phase: PhaseName::PostBuild,
                cause: FailureCause::Authorization {
                    resource,
                    capability,
                    ..
                },
            } => {
                assert_eq!(resource.kind, ResourceKind::Cluster);
                assert_eq!(*capability, Capability::Deploy);
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_login_is_authorization_failure() {
        let executor = Arc::new(
            ScriptedExecutor::new().fail_on("docker login", 1, "Error: Cannot perform an interactive login"),
        );
        let runner = runner(executor.clone(), GrantList::full());

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases()))
            .await;

        match &outcome.state {
            BuildState::Failed {
                phase: PhaseName::PreBuild,
                cause: FailureCause::Authorization { resource, detail, .. },
            } => {
                assert_eq!(resource, &ResourceRef::registry("node-data-microservice"));
                assert!(detail.as_deref().unwrap_or("").contains("interactive login"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(outcome.state.to_string(), "Failed(PreBuilding, AuthorizationError)");
        assert_eq!(executed_in(&executor, &phases()[2]), 0);
        assert_eq!(executed_in(&executor, &phases()[3]), 0);
        assert!(outcome.effects.is_empty());
    }

    #[tokio::test]
    async fn test_push_to_foreign_repository_is_unauthorized() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = runner(executor.clone(), GrantList::full());
        let mut phases = phases();
        phases[3]
            .commands
            .insert(0, "docker push docker.io/someone/else:$RESOLVED_SOURCE_VERSION".to_string());

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases))
            .await;

        match &outcome.state {
            BuildState::Failed {
                phase: PhaseName::PostBuild,
                cause: FailureCause::Authorization { resource, capability, .. },
            } => {
                assert_eq!(resource, &ResourceRef::registry("docker.io/someone/else"));
                assert_eq!(*capability, Capability::Push);
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_cluster_update_failure_leaves_partial_effects() {
        let executor = Arc::new(
            ScriptedExecutor::new().fail_on("kubectl set image", 1, "deployments.apps \"data-microservice\" not found"),
        );
        let runner = runner(executor, GrantList::full());

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases()))
            .await;

        assert!(matches!(
            outcome.state,
            BuildState::Failed {
                phase: PhaseName::PostBuild,
                cause: FailureCause::PhaseExecution { exit_code: Some(1), .. },
            }
        ));
        assert!(outcome.is_partial());
        let tags: Vec<&str> = outcome.pushed_images().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["latest", "abc123"]);
        assert!(!outcome
            .effects
            .iter()
            .any(|e| matches!(e, Effect::DeploymentUpdated { .. })));
    }

    #[tokio::test]
    async fn test_timeout_reports_exit_124() {
        let executor = Arc::new(ScriptedExecutor::new().hang_on("docker build"));
        let runner = BuildStageRunner::new(
            executor,
            Arc::new(GrantList::full()),
            Arc::new(Secrets),
            RunnerConfig::default().with_command_timeout(Duration::from_millis(50)),
        );

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases()))
            .await;

        assert!(matches!(
            outcome.state,
            BuildState::Failed {
                phase: PhaseName::Build,
                cause: FailureCause::PhaseExecution {
                    exit_code: Some(TIMEOUT_EXIT_CODE),
                    ..
                },
            }
        ));
        assert_eq!(outcome.commands.last().unwrap().exit_code, Some(124));
    }

    #[tokio::test]
    async fn test_spawn_error_has_no_exit_code() {
        let executor = Arc::new(ScriptedExecutor::new().spawn_error_on("docker tag", "sh: not found"));
        let runner = runner(executor, GrantList::full());

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases()))
            .await;

        match outcome.state {
            BuildState::Failed {
                phase: PhaseName::Build,
                cause: FailureCause::PhaseExecution { exit_code, detail, .. },
            } => {
                assert_eq!(exit_code, None);
                assert_eq!(detail.as_deref(), Some("sh: not found"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_command() {
        let executor = Arc::new(ScriptedExecutor::new().hang_on("docker build"));
        let runner = Arc::new(runner(executor.clone(), GrantList::full()));
        let (tx, rx) = watch::channel(false);
        let ctx = BuildContext::with_cancellation(Uuid::new_v4(), rx);

        let handle = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.run(&ctx, &request(phases())).await })
        };

        while !executor.executed().iter().any(|c| c.starts_with("docker build")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome.state,
            BuildState::Cancelled {
                phase: Some(PhaseName::Build)
            }
        );
        assert_eq!(executed_in(&executor, &phases()[3]), 0);
    }

    #[tokio::test]
    async fn test_required_effects() {
        let mut phases = phases();
        phases[3].commands.retain(|c| c != SET_IMAGE);

        let runner_strict = runner(Arc::new(ScriptedExecutor::new()), GrantList::full());
        let outcome = runner_strict
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases.clone()))
            .await;
        assert!(matches!(
            outcome.state,
            BuildState::Failed {
                phase: PhaseName::PostBuild,
                cause: FailureCause::EffectMissing { .. },
            }
        ));
        assert!(outcome.is_partial());

        let relaxed = BuildStageRunner::new(
            Arc::new(ScriptedExecutor::new()),
            Arc::new(GrantList::full()),
            Arc::new(Secrets),
            RunnerConfig::default().with_require_effects(false),
        );
        let outcome = relaxed
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases))
            .await;
        assert_eq!(outcome.state, BuildState::Succeeded);
    }

    #[tokio::test]
    async fn test_secret_binding_requires_read_grant() {
        let executor = Arc::new(ScriptedExecutor::new());
        let grants = GrantList::full()
            .without(ResourceRef::secret("microservice-config"), Capability::Read);
        let runner = runner(executor.clone(), grants);
        let mut request = request(phases());
        request.binding.insert_secret(
            "DATABASE_URL",
            SecretKeyRef::parse("microservice-config:DATABASE_URL").unwrap(),
        );

        let outcome = runner.run(&BuildContext::new(Uuid::new_v4()), &request).await;

        assert!(matches!(
            outcome.state,
            BuildState::Failed {
                phase: PhaseName::Install,
                cause: FailureCause::Authorization { .. },
            }
        ));
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_secret_values_are_masked_in_logs() {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = runner(executor, GrantList::full());
        let mut request = request(phases());
        request.binding.insert_secret(
            "DATABASE_URL",
            SecretKeyRef::parse("microservice-config:DATABASE_URL").unwrap(),
        );
        request.phases[1].commands.push("echo $DATABASE_URL".to_string());
        let ctx = BuildContext::new(Uuid::new_v4());

        let outcome = runner.run(&ctx, &request).await;

        assert_eq!(outcome.state, BuildState::Succeeded);
        let logs = ctx.drain_logs();
        assert!(logs.iter().any(|l| l.message == "$ echo ****"));
        assert!(!logs.iter().any(|l| l.message.contains("value-of-DATABASE_URL")));
    }

    #[tokio::test]
    async fn test_secret_values_are_masked_in_command_output() {
        let runner = BuildStageRunner::new(
            Arc::new(ShellExecutor::new()),
            Arc::new(GrantList::full()),
            Arc::new(Secrets),
            RunnerConfig::default().with_command_timeout(Duration::from_secs(5)),
        );
        let mut request = request(vec![BuildPhase::new(
            PhaseName::Build,
            vec![
                "echo $DATABASE_URL".to_string(),
                "echo \"db=$DATABASE_URL\" >&2; exit 3".to_string(),
            ],
        )]);
        request.binding.insert_secret(
            "DATABASE_URL",
            SecretKeyRef::parse("microservice-config:DATABASE_URL").unwrap(),
        );
        let ctx = BuildContext::new(Uuid::new_v4());

        let outcome = runner.run(&ctx, &request).await;

        match &outcome.state {
            BuildState::Failed {
                phase: PhaseName::Build,
                cause: FailureCause::PhaseExecution { exit_code, detail, .. },
            } => {
                assert_eq!(*exit_code, Some(3));
                assert_eq!(detail.as_deref(), Some("db=****"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        let logs = ctx.drain_logs();
        assert!(logs.iter().any(|l| l.message == "****"));
        assert!(logs.iter().any(|l| l.message == "db=****"));
        assert!(!logs.iter().any(|l| l.message.contains("value-of-DATABASE_URL")));
    }

    #[tokio::test]
    async fn test_wrapped_push_requires_push_grant() {
        let executor = Arc::new(ScriptedExecutor::new());
        let grants = GrantList::full()
            .without(ResourceRef::registry("node-data-microservice"), Capability::Push);
        let runner = runner(executor.clone(), grants);
        let mut phases = phases();
        phases[3].commands[0] = "docker image push $REPOSITORY_URI:latest".to_string();
        phases[3].commands[1] =
            "sudo /usr/bin/docker push $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION".to_string();

        let outcome = runner
            .run(&BuildContext::new(Uuid::new_v4()), &request(phases))
            .await;

        match &outcome.state {
            BuildState::Failed {
                phase: PhaseName::PostBuild,
                cause: FailureCause::Authorization { resource, capability, .. },
            } => {
                assert_eq!(resource, &ResourceRef::registry("node-data-microservice"));
                assert_eq!(*capability, Capability::Push);
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_compound_push_keeps_possible_effects() {
        let executor = Arc::new(
            ScriptedExecutor::new().fail_on("docker push", 1, "denied: requested access to the resource is denied"),
        );
        let runner = runner(executor.clone(), GrantList::full());
        let mut phases = phases();
        phases[3].commands.remove(0);
        phases[3].commands[0] =
            "docker push $REPOSITORY_URI:latest && docker push $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION"
                .to_string();
        let ctx = BuildContext::new(Uuid::new_v4());

        let outcome = runner.run(&ctx, &request(phases)).await;

        assert!(matches!(
            outcome.state,
            BuildState::Failed {
                phase: PhaseName::PostBuild,
                cause: FailureCause::PhaseExecution { exit_code: Some(1), .. },
            }
        ));
        assert!(outcome.is_partial());
        let tags: Vec<&str> = outcome.pushed_images().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["latest", "abc123"]);
        assert!(!ran_kubectl(&executor));

        let logs = ctx.drain_logs();
        assert!(logs
            .iter()
            .any(|l| l.message == format!("Possibly applied before failure: pushed {}:latest", REGISTRY)));
    }

    fn ran_kubectl(executor: &ScriptedExecutor) -> bool {
        executor.executed().iter().any(|c| c.starts_with("kubectl"))
    }
}
