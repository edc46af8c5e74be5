use std::sync::Arc;

use propline_agent::{build_client, ExtractionInvoker, IntakeRuntime};
use propline_core::audit::TracingAuditSink;
use propline_core::config::{AppConfig, ConfigError, LoadOptions};
use propline_db::{
    connect_with_settings, migrations, DbPool, DualStoreWriter, SqlGraphStore,
    SqlIntakeRepository,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub graph_pool: DbPool,
    pub runtime: Arc<IntakeRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("graph store connection failed: {0}")]
    GraphConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("extraction client could not be built: {0}")]
    Llm(#[source] anyhow::Error),
}

#[cfg_attr(not(test), allow(dead_code))]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        llm_provider = config.llm.provider.as_str(),
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    let graph_pool = connect_with_settings(
        &config.graph.url,
        config.graph.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::GraphConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "relational and graph stores connected"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    migrations::run_pending(&graph_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let writer = DualStoreWriter::new(
        Arc::new(SqlIntakeRepository::new(db_pool.clone())),
        Arc::new(SqlGraphStore::new(graph_pool.clone())),
        config.graph.max_retries,
    );
    let client = build_client(&config.llm).map_err(BootstrapError::Llm)?;
    let invoker = ExtractionInvoker::from_config(client, &config.llm);
    let runtime = IntakeRuntime::new(
        writer,
        invoker,
        Arc::new(TracingAuditSink),
        config.intake.reset_keyword.clone(),
    );

    Ok(Application { config, db_pool, graph_pool, runtime: Arc::new(runtime) })
}
