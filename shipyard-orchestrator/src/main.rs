use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shipyard_core::domain::secret::SecretRef;
use shipyard_orchestrator::{
    GitSource, InMemoryRunRepository, OrchestratorConfig, PgRunRepository, PipelineOrchestrator,
    RunRepository, api, db,
};
use shipyard_provisioner::secrets::DEFAULT_KEY;
use shipyard_provisioner::{AccessBinder, ResourceProvisioner, StackConfig, grant_build_access};
use shipyard_runner::create_executor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "shipyard_orchestrator=info,shipyard_runner=info,shipyard_provisioner=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Shipyard Orchestrator...");

    let config = OrchestratorConfig::from_env().context("Failed to load configuration")?;
    config.validate()?;

    let stack = match &config.stack_file {
        Some(path) => {
            tracing::info!("Loading stack from {}", path.display());
            StackConfig::from_file(path)?
        }
        None => StackConfig::default(),
    };

    // Provision the stack and wire the build identity's grants
    let provisioner = Arc::new(match &config.state_file {
        Some(path) => ResourceProvisioner::with_state_file(path)?,
        None => ResourceProvisioner::new(),
    });
    let handles = provisioner
        .provision(&stack)
        .context("Failed to provision stack")?;

    let binder = Arc::new(AccessBinder::new());
    grant_build_access(&binder, &handles)?;

    if let Some(outputs) = provisioner.outputs() {
        tracing::info!(
            "Stack ready: registry {}, cluster {}",
            outputs.registry_uri,
            outputs.cluster_name
        );
    }

    // The source token lives outside the stack
    let source_config = &stack.pipeline.source;
    let token = match &source_config.token_secret {
        Some(secret) => {
            match std::env::var("SHIPYARD_SOURCE_TOKEN") {
                Ok(token) => provisioner.put_external_secret(
                    secret,
                    BTreeMap::from([(DEFAULT_KEY.to_string(), token)]),
                )?,
                Err(_) if provisioner.secret_keys(secret).is_none() => tracing::warn!(
                    "SHIPYARD_SOURCE_TOKEN is not set and secret '{}' is unknown; source fetches will fail",
                    secret
                ),
                Err(_) => {}
            }
            Some(SecretRef::new(secret).key(DEFAULT_KEY))
        }
        None => None,
    };
    let source = Arc::new(GitSource::new(
        source_config.clone_url(),
        token,
        provisioner.clone(),
    ));

    let executor = create_executor(&config.runner)?;
    tracing::info!("Build commands run with the {} executor", config.runner.executor);

    let repository: Arc<dyn RunRepository> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgRunRepository::new(pool))
        }
        None => {
            tracing::info!("DATABASE_URL not set; runs are kept in memory");
            Arc::new(InMemoryRunRepository::new())
        }
    };

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        &config,
        &stack,
        provisioner,
        binder,
        source,
        executor,
        repository,
    )?);
    tracing::info!(
        "Pipeline '{}' follows branch '{}'",
        stack.pipeline.name,
        stack.pipeline.branch
    );

    // Build router with all API endpoints
    let app = api::create_router(orchestrator);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
