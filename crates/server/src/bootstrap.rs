use gtmlake_core::config::{AppConfig, ConfigError};
use gtmlake_db::{connect_with_settings, migrations, DbPool};
use gtmlake_pipeline::Components;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub components: Components,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        consumer_group = %config.processor.consumer_group,
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let components = Components::new(db_pool.clone(), config.clone());
    info!(
        event_name = "system.bootstrap.components_ready",
        correlation_id = "bootstrap",
        embedding_provider = config.embedding.provider.as_str(),
        embedding_dimension = config.embedding.dimension,
        "pipeline components assembled"
    );

    Ok(Application { config, db_pool, components })
}
