pub mod ask;
pub mod config;
pub mod dead_letter;
pub mod doctor;
pub mod drain;
pub mod ingest;
pub mod migrate;
pub mod resync;
pub mod retention;
pub mod smoke;

use gtmlake_core::config::{AppConfig, LoadOptions};
use gtmlake_db::{connect_with_settings, migrations, DbPool};
use gtmlake_pipeline::Components;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME: u8 = 3;
pub const EXIT_DATABASE: u8 = 4;
pub const EXIT_MIGRATION: u8 = 5;
pub const EXIT_OPERATION: u8 = 6;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::outcome(command, "ok", None, message.into(), None, 0)
    }

    /// Success carrying a structured payload under `data`.
    pub fn success_with(command: &str, message: impl Into<String>, data: impl Serialize) -> Self {
        Self::outcome(command, "ok", None, message.into(), serde_json::to_value(data).ok(), 0)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::outcome(command, "error", Some(error_class), message.into(), None, exit_code)
    }

    pub fn failure_with(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
        data: impl Serialize,
    ) -> Self {
        Self::outcome(
            command,
            "error",
            Some(error_class),
            message.into(),
            serde_json::to_value(data).ok(),
            exit_code,
        )
    }

    fn outcome(
        command: &str,
        status: &str,
        error_class: Option<&str>,
        message: String,
        data: Option<Value>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: status.to_string(),
            error_class: error_class.map(str::to_string),
            message,
            data,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            EXIT_CONFIG,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            EXIT_RUNTIME,
        )
    })
}

/// Connects, applies pending migrations and assembles the pipeline.
pub(crate) async fn open_components(
    command: &str,
    config: &AppConfig,
) -> Result<(DbPool, Components), CommandResult> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| {
        CommandResult::failure(command, "db_connectivity", error.to_string(), EXIT_DATABASE)
    })?;
    migrations::run_pending(&pool).await.map_err(|error| {
        CommandResult::failure(command, "migration", error.to_string(), EXIT_MIGRATION)
    })?;
    let components = Components::new(pool.clone(), config.clone());
    Ok((pool, components))
}

/// Shared skeleton: load config, build a runtime, open the pipeline, run `body`,
/// close the pool.
pub(crate) fn with_components<F, Fut>(command: &str, body: F) -> CommandResult
where
    F: FnOnce(Components) -> Fut,
    Fut: std::future::Future<Output = CommandResult>,
{
    let config = match load_config(command) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime(command) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let (pool, components) = match open_components(command, &config).await {
            Ok(opened) => opened,
            Err(failure) => return failure,
        };
        let result = body(components).await;
        pool.close().await;
        result
    })
}
