mod bootstrap;
mod health;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use gtmlake_core::config::{AppConfig, LoadOptions};
use gtmlake_pipeline::{RetentionTotals, WorkerError, WorkerStats};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use gtmlake_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.db_pool.clone(), Arc::clone(&app.components.dead_letters)),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retention_task: JoinHandle<RetentionTotals> =
        tokio::spawn(app.components.retention_task().run(shutdown_rx.clone()));
    let worker = app.components.worker(&app.config.processor.worker_id);
    let consumer_group = worker.consumer_group().to_string();
    let mut worker_task: JoinHandle<Result<WorkerStats, WorkerError>> =
        tokio::spawn(worker.run(shutdown_rx));

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        consumer_group = %consumer_group,
        worker_id = %app.config.processor.worker_id,
        "gtmlake-server started"
    );

    let finished_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
        joined = &mut worker_task => Some(joined),
    };
    let _ = shutdown_tx.send(true);

    let outcome = match finished_early {
        Some(joined) => joined?,
        None => {
            tracing::info!(
                event_name = "system.server.stopping",
                correlation_id = "shutdown",
                "gtmlake-server stopping; draining in-flight record"
            );
            let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
            match tokio::time::timeout(grace, &mut worker_task).await {
                Ok(joined) => joined?,
                Err(_) => {
                    worker_task.abort();
                    retention_task.abort();
                    app.db_pool.close().await;
                    return Err(anyhow!(
                        "worker did not stop within {}s of the shutdown signal",
                        grace.as_secs()
                    ));
                }
            }
        }
    };

    match tokio::time::timeout(Duration::from_secs(5), retention_task).await {
        Ok(Ok(totals)) => tracing::debug!(
            event_name = "system.server.retention_stopped",
            correlation_id = "shutdown",
            sweeps = totals.sweeps,
            removed_records = totals.removed_records,
            "retention task joined"
        ),
        Ok(Err(error)) => tracing::warn!(
            event_name = "system.server.retention_join_failed",
            correlation_id = "shutdown",
            error = %error,
            "retention task ended abnormally"
        ),
        Err(_) => tracing::warn!(
            event_name = "system.server.retention_join_timeout",
            correlation_id = "shutdown",
            "retention task did not stop in time"
        ),
    }

    app.db_pool.close().await;
    match outcome {
        Ok(stats) => {
            tracing::info!(
                event_name = "system.server.stopped",
                correlation_id = "shutdown",
                processed = stats.processed,
                dead_lettered = stats.dead_lettered,
                "gtmlake-server stopped"
            );
            Ok(())
        }
        Err(error) => {
            let requires_resync = error.requires_resync();
            let error = error.into_application(&consumer_group);
            tracing::error!(
                event_name = "system.server.worker_failed",
                correlation_id = "shutdown",
                error_class = error.error_class(),
                requires_resync = requires_resync,
                error = %error,
                "partition worker stopped with an error"
            );
            Err(error.into())
        }
    }
}
