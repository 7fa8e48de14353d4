use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tracing::info;

use taskdeck_agent::dispatch::{CardPlanner, IntentDispatcher, IntentHandler};
use taskdeck_agent::llm::OpenAiCompatibleProvider;
use taskdeck_agent::orchestrator::{Orchestrator, OrchestratorConfig};
use taskdeck_agent::tools::ToolCatalog;
use taskdeck_core::config::{AppConfig, ConfigError, LoadOptions};
use taskdeck_core::errors::ToolError;
use taskdeck_core::intents::{AutomationTier, ExecutionClass, IntentRegistry};
use taskdeck_core::messaging::MessageSender;
use taskdeck_db::repositories::{
    AuditRepository, CardRepository, SqlAuditRepository, SqlCardRepository,
};
use taskdeck_db::{connect_with_settings, migrations, DbPool};

use crate::cards::{self, CardsState};
use crate::converse::{self, ConverseState};
use crate::handlers::{
    EmptyDirectoryHandler, LogOnlySender, SendIntentExecutor, ServerCardPlanner,
};
use crate::health;
use crate::runs::{self, RunsState};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub registry: Arc<IntentRegistry>,
    pub catalog: Arc<ToolCatalog>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm provider setup failed: {0}")]
    LlmProvider(#[source] ToolError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let registry = Arc::new(IntentRegistry::builtin());
    let catalog = Arc::new(ToolCatalog::builtin());
    info!(
        event_name = "system.bootstrap.registry_loaded",
        contracts = registry.len(),
        "intent contract registry loaded"
    );

    Ok(Application { config, db_pool, registry, catalog })
}

/// Assembles the full HTTP surface from a bootstrapped application.
pub fn router(app: &Application) -> Result<Router, BootstrapError> {
    let cards_repo = Arc::new(SqlCardRepository::new(app.db_pool.clone()));
    let audit_repo = Arc::new(SqlAuditRepository::new(app.db_pool.clone()));
    let sender: Arc<dyn MessageSender> = Arc::new(LogOnlySender::new(
        app.config.messaging.channel.clone(),
        app.config.messaging.fallback_channel.clone(),
    ));

    let planner =
        Arc::new(ServerCardPlanner::new(Arc::clone(&cards_repo) as Arc<dyn CardRepository>));
    let mut dispatcher = IntentDispatcher::new(
        Arc::clone(&app.registry),
        Arc::clone(&app.catalog),
        Arc::clone(&planner) as Arc<dyn CardPlanner>,
    );
    let directory: Arc<dyn IntentHandler> = Arc::new(EmptyDirectoryHandler);
    for contract in app.registry.contracts() {
        if contract.effective_tier() == AutomationTier::L0 {
            dispatcher.register_handler(contract.intent_key, Arc::clone(&directory));
        }
    }

    // Approved intent plans execute through these; L2-A keys with no
    // executor fail closed at execution time.
    let send_executor: Arc<dyn IntentHandler> =
        Arc::new(SendIntentExecutor::new(Arc::clone(&sender)));
    let mut executors: HashMap<String, Arc<dyn IntentHandler>> = HashMap::new();
    for contract in app.registry.contracts() {
        if contract.execution_class == Some(ExecutionClass::A)
            && contract.intent_key.starts_with("message.exec.")
        {
            executors.insert(contract.intent_key.to_string(), Arc::clone(&send_executor));
        }
    }

    let provider =
        OpenAiCompatibleProvider::from_config(&app.config.llm).map_err(BootstrapError::LlmProvider)?;
    let orchestrator = Orchestrator::new(
        Arc::new(provider),
        Arc::new(dispatcher),
        Arc::clone(&app.catalog),
        OrchestratorConfig {
            max_iterations: app.config.agent.max_iterations,
            history_turns: app.config.agent.history_turns,
        },
    );

    let secret = app.config.auth.secret.clone();
    let router = Router::new()
        .merge(cards::router(CardsState {
            cards: cards_repo,
            audit: Arc::clone(&audit_repo) as Arc<dyn AuditRepository>,
            sender,
            registry: Arc::clone(&app.registry),
            executors: Arc::new(executors),
            secret: secret.clone(),
        }))
        .merge(runs::router(RunsState { audit: audit_repo, secret: secret.clone() }))
        .merge(converse::router(ConverseState {
            orchestrator: Arc::new(orchestrator),
            registry: Arc::clone(&app.registry),
            planner,
            secret,
        }))
        .merge(health::router(app.db_pool.clone()));

    Ok(router)
}
