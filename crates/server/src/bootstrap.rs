use std::sync::Arc;

use boardwright_agent::{AgentRuntime, AnthropicClient, RuntimeDeps, RuntimeSettings, ToolRegistry};
use boardwright_core::config::AppConfig;
use boardwright_db::{
    connect_with_config, migrations, DbPool, SqlSkillRepository, SqlTaskRepository,
    SqlUsageLedger,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model client setup failed: {0:#}")]
    ModelClient(#[source] anyhow::Error),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_config(&config.database)
        .await
        .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let model = AnthropicClient::from_config(&config.llm).map_err(BootstrapError::ModelClient)?;
    let ledger = Arc::new(SqlUsageLedger::new(db_pool.clone(), config.agent.budget_ceiling_usd));
    let tools = ToolRegistry::with_think();

    info!(
        event_name = "system.bootstrap.runtime_ready",
        model = %config.llm.model,
        max_iterations = config.agent.max_iterations,
        budget_ceiling_usd = ?config.agent.budget_ceiling_usd,
        tools = ?tools.names(),
        "agent runtime assembled"
    );

    let runtime = AgentRuntime::new(RuntimeDeps {
        model: Arc::new(model),
        tools: Arc::new(tools),
        tasks: Arc::new(SqlTaskRepository::new(db_pool.clone())),
        skills: Arc::new(SqlSkillRepository::new(db_pool.clone())),
        budget: ledger.clone(),
        usage_sink: ledger,
        settings: RuntimeSettings::from_config(&config),
    });

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}
