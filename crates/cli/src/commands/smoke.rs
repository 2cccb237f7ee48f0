use std::time::Instant;

use std::sync::Arc;
use std::time::Duration;

use crate::commands::{CommandResult, EXIT_OPERATION};
use gtmlake_core::config::{AppConfig, LoadOptions};
use gtmlake_core::domain::event::EventType;
use gtmlake_core::domain::query::QueryStatus;
use gtmlake_core::Canonicalizer;
use gtmlake_db::repositories::{InMemoryStorage, Storage};
use gtmlake_db::{connect_with_settings, migrations};
use gtmlake_pipeline::{
    build_embedder, EnrichmentProcessor, KeywordIntentClassifier, QueryRuntime,
    QueryRuntimeConfig,
};
use serde::Serialize;
use serde_json::json;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("pipeline_roundtrip"));
            checks.push(skipped("db_connectivity"));
            checks.push(skipped("migration_visibility"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(skipped("pipeline_roundtrip"));
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("migration_visibility"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let roundtrip_started = Instant::now();
    let roundtrip = runtime.block_on(pipeline_roundtrip(&config));
    checks.push(SmokeCheck {
        name: "pipeline_roundtrip",
        status: if roundtrip.is_ok() { SmokeStatus::Pass } else { SmokeStatus::Fail },
        elapsed_ms: roundtrip_started.elapsed().as_millis() as u64,
        message: match roundtrip {
            Ok(message) | Err(message) => message,
        },
    });

    let db_started = Instant::now();
    let db_result = runtime.block_on(async {
        connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
    });

    let pool = match db_result {
        Ok(pool) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Pass,
                elapsed_ms: db_started.elapsed().as_millis() as u64,
                message: format!("connected using `{}`", config.database.url),
            });
            pool
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Fail,
                elapsed_ms: db_started.elapsed().as_millis() as u64,
                message: format!("failed to connect: {error}"),
            });
            checks.push(skipped("migration_visibility"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let migration_started = Instant::now();
    let migration_result = runtime.block_on(async { migrations::run_pending(&pool).await });
    runtime.block_on(async {
        pool.close().await;
    });

    match migration_result {
        Ok(()) => checks.push(SmokeCheck {
            name: "migration_visibility",
            status: SmokeStatus::Pass,
            elapsed_ms: migration_started.elapsed().as_millis() as u64,
            message: "migrations are visible and executable".to_string(),
        }),
        Err(error) => checks.push(SmokeCheck {
            name: "migration_visibility",
            status: SmokeStatus::Fail,
            elapsed_ms: migration_started.elapsed().as_millis() as u64,
            message: format!("migration execution failed: {error}"),
        }),
    }

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

/// Normalizes, enriches and answers a question about one synthetic meeting using
/// in-memory stores, so the configured database is never written.
async fn pipeline_roundtrip(config: &AppConfig) -> Result<String, String> {
    let envelope = Canonicalizer::default()
        .normalize(
            &json!({
                "event_id": "smoke-cal-1",
                "title": "Smoke check pricing review",
                "start_time": "2026-01-05T15:00:00Z",
                "end_time": "2026-01-05T15:30:00Z",
                "attendees": [{"email": "buyer@smoke-test.example", "role": "CTO"}],
                "organizer": "seller@smoke-test.example",
                "company_domain": "smoke-test.example"
            }),
            EventType::CalendarEvent,
        )
        .map_err(|error| format!("sample event rejected: {error}"))?;

    let embedder = build_embedder(&config.embedding);
    let processor = EnrichmentProcessor::new(
        Arc::clone(&embedder),
        Duration::from_millis(config.processor.embedding_timeout_ms),
    );
    let record = processor.process(&envelope).await.map_err(|error| error.to_string())?;

    let storage = Arc::new(InMemoryStorage::with_dimension(config.embedding.dimension));
    storage.write_raw(&envelope).await.map_err(|error| error.to_string())?;
    storage
        .upsert_catalog(record.event_id(), &record.catalog_fields())
        .await
        .map_err(|error| error.to_string())?;
    if let Some(embedding) = &record.embedding {
        storage.upsert_vector(record.event_id(), embedding).await.map_err(|e| e.to_string())?;
    }

    let runtime = QueryRuntime::new(
        storage,
        Arc::new(KeywordIntentClassifier::default()),
        embedder,
        QueryRuntimeConfig::from(&config.query),
    );
    let response = runtime.ask("meetings with smoke-test.example").await;
    match (response.status, response.rows.len()) {
        (QueryStatus::Answered, 1) => Ok(format!(
            "sample meeting answered (vector {})",
            if record.embedding.is_some() { "stored" } else { "skipped" }
        )),
        (status, rows) => Err(format!("expected one answered row, got {status:?} with {rows}")),
    }
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult {
        exit_code: if failed { EXIT_OPERATION } else { 0 },
        output: format!("{human}\n{machine}"),
    }
}
