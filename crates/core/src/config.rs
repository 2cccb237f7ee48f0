use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::processing::RetryPolicyConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub processor: ProcessorConfig,
    pub embedding: EmbeddingConfig,
    pub query: QueryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Partitioned log retention and partitioning.
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub retention_hours: u64,
    pub retention_max_records: u64,
    pub fallback_partitions: u32,
    /// How often a running server sweeps expired log records.
    pub retention_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub consumer_group: String,
    pub worker_id: String,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub retry_max_delay_ms: u64,
    pub embedding_timeout_ms: u64,
    pub lease_duration_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub dimension: usize,
}

#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub result_limit: usize,
    pub similarity_top_k: usize,
    pub storage_timeout_ms: u64,
    pub storage_retry_backoff_ms: u64,
    pub min_similarity_score: f32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    Hashing,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub consumer_group: Option<String>,
    pub worker_id: Option<String>,
    pub embedding_provider: Option<EmbeddingProviderKind>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://gtmlake.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            log: LogConfig {
                retention_hours: 168,
                retention_max_records: 100_000,
                fallback_partitions: crate::canonical::DEFAULT_FALLBACK_PARTITIONS,
                retention_interval_secs: 300,
            },
            processor: ProcessorConfig {
                consumer_group: "gtm-data-lake-group".to_string(),
                worker_id: format!("worker-{}", std::process::id()),
                max_attempts: 3,
                retry_base_delay_ms: 200,
                retry_backoff_multiplier: 2,
                retry_max_delay_ms: 10_000,
                embedding_timeout_ms: 2_000,
                lease_duration_ms: 30_000,
                poll_interval_ms: 500,
                batch_size: 100,
            },
            embedding: EmbeddingConfig { provider: EmbeddingProviderKind::Hashing, dimension: 384 },
            query: QueryConfig {
                result_limit: 50,
                similarity_top_k: 10,
                storage_timeout_ms: 5_000,
                storage_retry_backoff_ms: 250,
                min_similarity_score: 0.0,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hashing => "hashing",
            Self::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for EmbeddingProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(ConfigError::Validation(format!(
                "unsupported embedding provider `{other}` (expected hashing|disabled)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl ProcessorConfig {
    pub fn retry_policy(&self) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryPolicyConfig::default()
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("gtmlake.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(log) = patch.log {
            set(&mut self.log.retention_hours, log.retention_hours);
            set(&mut self.log.retention_max_records, log.retention_max_records);
            set(&mut self.log.fallback_partitions, log.fallback_partitions);
            set(&mut self.log.retention_interval_secs, log.retention_interval_secs);
        }

        if let Some(processor) = patch.processor {
            set(&mut self.processor.consumer_group, processor.consumer_group);
            set(&mut self.processor.worker_id, processor.worker_id);
            set(&mut self.processor.max_attempts, processor.max_attempts);
            set(&mut self.processor.retry_base_delay_ms, processor.retry_base_delay_ms);
            set(&mut self.processor.retry_backoff_multiplier, processor.retry_backoff_multiplier);
            set(&mut self.processor.retry_max_delay_ms, processor.retry_max_delay_ms);
            set(&mut self.processor.embedding_timeout_ms, processor.embedding_timeout_ms);
            set(&mut self.processor.lease_duration_ms, processor.lease_duration_ms);
            set(&mut self.processor.poll_interval_ms, processor.poll_interval_ms);
            set(&mut self.processor.batch_size, processor.batch_size);
        }

        if let Some(embedding) = patch.embedding {
            set(&mut self.embedding.provider, embedding.provider);
            set(&mut self.embedding.dimension, embedding.dimension);
        }

        if let Some(query) = patch.query {
            set(&mut self.query.result_limit, query.result_limit);
            set(&mut self.query.similarity_top_k, query.similarity_top_k);
            set(&mut self.query.storage_timeout_ms, query.storage_timeout_ms);
            set(&mut self.query.storage_retry_backoff_ms, query.storage_retry_backoff_ms);
            set(&mut self.query.min_similarity_score, query.min_similarity_score);
        }

        if let Some(server) = patch.server {
            set(&mut self.server.bind_address, server.bind_address);
            set(&mut self.server.health_check_port, server.health_check_port);
            set(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("GTMLAKE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("GTMLAKE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse("GTMLAKE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse("GTMLAKE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("GTMLAKE_LOG_RETENTION_HOURS") {
            self.log.retention_hours = parse("GTMLAKE_LOG_RETENTION_HOURS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_LOG_RETENTION_MAX_RECORDS") {
            self.log.retention_max_records = parse("GTMLAKE_LOG_RETENTION_MAX_RECORDS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_LOG_FALLBACK_PARTITIONS") {
            self.log.fallback_partitions = parse("GTMLAKE_LOG_FALLBACK_PARTITIONS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_LOG_RETENTION_INTERVAL_SECS") {
            self.log.retention_interval_secs =
                parse("GTMLAKE_LOG_RETENTION_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("GTMLAKE_PROCESSOR_CONSUMER_GROUP") {
            self.processor.consumer_group = value;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_WORKER_ID") {
            self.processor.worker_id = value;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_MAX_ATTEMPTS") {
            self.processor.max_attempts = parse("GTMLAKE_PROCESSOR_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_RETRY_BASE_DELAY_MS") {
            self.processor.retry_base_delay_ms =
                parse("GTMLAKE_PROCESSOR_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_EMBEDDING_TIMEOUT_MS") {
            self.processor.embedding_timeout_ms =
                parse("GTMLAKE_PROCESSOR_EMBEDDING_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_LEASE_DURATION_MS") {
            self.processor.lease_duration_ms =
                parse("GTMLAKE_PROCESSOR_LEASE_DURATION_MS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_POLL_INTERVAL_MS") {
            self.processor.poll_interval_ms = parse("GTMLAKE_PROCESSOR_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_PROCESSOR_BATCH_SIZE") {
            self.processor.batch_size = parse("GTMLAKE_PROCESSOR_BATCH_SIZE", &value)?;
        }

        if let Some(value) = read_env("GTMLAKE_EMBEDDING_PROVIDER") {
            self.embedding.provider = value.parse()?;
        }
        if let Some(value) = read_env("GTMLAKE_EMBEDDING_DIMENSION") {
            self.embedding.dimension = parse("GTMLAKE_EMBEDDING_DIMENSION", &value)?;
        }

        if let Some(value) = read_env("GTMLAKE_QUERY_RESULT_LIMIT") {
            self.query.result_limit = parse("GTMLAKE_QUERY_RESULT_LIMIT", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_QUERY_SIMILARITY_TOP_K") {
            self.query.similarity_top_k = parse("GTMLAKE_QUERY_SIMILARITY_TOP_K", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_QUERY_STORAGE_TIMEOUT_MS") {
            self.query.storage_timeout_ms = parse("GTMLAKE_QUERY_STORAGE_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("GTMLAKE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("GTMLAKE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse("GTMLAKE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("GTMLAKE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse("GTMLAKE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("GTMLAKE_LOGGING_LEVEL").or_else(|| read_env("GTMLAKE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("GTMLAKE_LOGGING_FORMAT").or_else(|| read_env("GTMLAKE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        set(&mut self.database.url, overrides.database_url);
        set(&mut self.logging.level, overrides.log_level);
        set(&mut self.processor.consumer_group, overrides.consumer_group);
        set(&mut self.processor.worker_id, overrides.worker_id);
        set(&mut self.embedding.provider, overrides.embedding_provider);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_log(&self.log)?;
        validate_processor(&self.processor)?;
        validate_embedding(&self.embedding)?;
        validate_query(&self.query)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("gtmlake.toml"), PathBuf::from("config/gtmlake.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_log(log: &LogConfig) -> Result<(), ConfigError> {
    if log.retention_hours == 0 {
        return Err(ConfigError::Validation(
            "log.retention_hours must be greater than zero".to_string(),
        ));
    }
    if log.retention_max_records == 0 {
        return Err(ConfigError::Validation(
            "log.retention_max_records must be greater than zero".to_string(),
        ));
    }
    if log.fallback_partitions == 0 || log.fallback_partitions > 1024 {
        return Err(ConfigError::Validation(
            "log.fallback_partitions must be in range 1..=1024".to_string(),
        ));
    }
    if log.retention_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "log.retention_interval_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_processor(processor: &ProcessorConfig) -> Result<(), ConfigError> {
    if processor.consumer_group.trim().is_empty() {
        return Err(ConfigError::Validation(
            "processor.consumer_group must not be empty".to_string(),
        ));
    }
    if processor.worker_id.trim().is_empty() {
        return Err(ConfigError::Validation("processor.worker_id must not be empty".to_string()));
    }
    if processor.max_attempts == 0 || processor.max_attempts > 20 {
        return Err(ConfigError::Validation(
            "processor.max_attempts must be in range 1..=20".to_string(),
        ));
    }
    if processor.retry_base_delay_ms > processor.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "processor.retry_base_delay_ms must not exceed processor.retry_max_delay_ms"
                .to_string(),
        ));
    }
    if processor.embedding_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "processor.embedding_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if processor.lease_duration_ms < 1_000 {
        return Err(ConfigError::Validation(
            "processor.lease_duration_ms must be at least 1000".to_string(),
        ));
    }
    if processor.batch_size == 0 {
        return Err(ConfigError::Validation(
            "processor.batch_size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_embedding(embedding: &EmbeddingConfig) -> Result<(), ConfigError> {
    if embedding.dimension == 0 || embedding.dimension > 4096 {
        return Err(ConfigError::Validation(
            "embedding.dimension must be in range 1..=4096".to_string(),
        ));
    }
    Ok(())
}

fn validate_query(query: &QueryConfig) -> Result<(), ConfigError> {
    if query.result_limit == 0 {
        return Err(ConfigError::Validation(
            "query.result_limit must be greater than zero".to_string(),
        ));
    }
    if query.similarity_top_k == 0 {
        return Err(ConfigError::Validation(
            "query.similarity_top_k must be greater than zero".to_string(),
        ));
    }
    if query.storage_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "query.storage_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if !(-1.0..=1.0).contains(&query.min_similarity_score) {
        return Err(ConfigError::Validation(
            "query.min_similarity_score must be in range -1.0..=1.0".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    log: Option<LogPatch>,
    processor: Option<ProcessorPatch>,
    embedding: Option<EmbeddingPatch>,
    query: Option<QueryPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LogPatch {
    retention_hours: Option<u64>,
    retention_max_records: Option<u64>,
    fallback_partitions: Option<u32>,
    retention_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessorPatch {
    consumer_group: Option<String>,
    worker_id: Option<String>,
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    retry_max_delay_ms: Option<u64>,
    embedding_timeout_ms: Option<u64>,
    lease_duration_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    batch_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    provider: Option<EmbeddingProviderKind>,
    dimension: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryPatch {
    result_limit: Option<usize>,
    similarity_top_k: Option<usize>,
    storage_timeout_ms: Option<u64>,
    storage_retry_backoff_ms: Option<u64>,
    min_similarity_score: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, EmbeddingProviderKind, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.log.retention_hours == 168, "retention defaults to one week")?;
        ensure(config.log.retention_interval_secs == 300, "retention sweeps every five minutes")?;
        ensure(config.embedding.dimension == 384, "embedding dimension defaults to 384")?;
        ensure(
            config.processor.consumer_group == "gtm-data-lake-group",
            "consumer group has a stable default",
        )?;
        ensure(matches!(config.logging.format, LogFormat::Compact), "compact logs by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_GTMLAKE_GROUP", "analytics-replay");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("gtmlake.toml");
            fs::write(
                &path,
                r#"
[log]
retention_interval_secs = 60

[processor]
consumer_group = "${TEST_GTMLAKE_GROUP}"
max_attempts = 5

[embedding]
provider = "disabled"
dimension = 64
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.processor.consumer_group == "analytics-replay",
                "consumer group should be interpolated from environment",
            )?;
            ensure(config.processor.max_attempts == 5, "max attempts should come from file")?;
            ensure(
                config.log.retention_interval_secs == 60,
                "retention interval should come from file",
            )?;
            ensure(
                config.embedding.provider == EmbeddingProviderKind::Disabled,
                "embedding provider should come from file",
            )?;
            ensure(config.embedding.dimension == 64, "dimension should come from file")
        })();

        clear_vars(&["TEST_GTMLAKE_GROUP"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("GTMLAKE_LOG_LEVEL", "warn");
        env::set_var("GTMLAKE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["GTMLAKE_LOG_LEVEL", "GTMLAKE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("GTMLAKE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("GTMLAKE_PROCESSOR_CONSUMER_GROUP", "group-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("gtmlake.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[processor]
consumer_group = "group-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.processor.consumer_group == "group-from-env",
                "env consumer group should win over file and defaults",
            )
        })();

        clear_vars(&["GTMLAKE_DATABASE_URL", "GTMLAKE_PROCESSOR_CONSUMER_GROUP"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("GTMLAKE_PROCESSOR_MAX_ATTEMPTS", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("processor.max_attempts")
            );
            ensure(has_message, "validation failure should mention processor.max_attempts")
        })();

        clear_vars(&["GTMLAKE_PROCESSOR_MAX_ATTEMPTS"]);
        result
    }

    #[test]
    fn malformed_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("GTMLAKE_EMBEDDING_DIMENSION", "wide");

        let result = (|| -> Result<(), String> {
            match AppConfig::load(LoadOptions::default()) {
                Err(ConfigError::InvalidEnvOverride { key, value }) => {
                    ensure(key == "GTMLAKE_EMBEDDING_DIMENSION", "key should be reported")?;
                    ensure(value == "wide", "value should be reported")
                }
                Ok(_) => Err("expected invalid override error".to_string()),
                Err(other) => Err(format!("unexpected error: {other}")),
            }
        })();

        clear_vars(&["GTMLAKE_EMBEDDING_DIMENSION"]);
        result
    }
}
