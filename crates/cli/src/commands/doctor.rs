use gtmlake_core::config::{AppConfig, EmbeddingProviderKind, LoadOptions};
use gtmlake_db::connect_with_settings;
use gtmlake_db::repositories::{DeadLetterSink, SqlDeadLetterSink};
use gtmlake_pipeline::build_embedder;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_embedding_provider(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["embedding_provider", "database_connectivity", "dead_letter_backlog"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_embedding_provider(config: &AppConfig) -> DoctorCheck {
    let name = "embedding_provider";
    if config.embedding.provider == EmbeddingProviderKind::Disabled {
        return DoctorCheck {
            name,
            status: CheckStatus::Pass,
            details: "embeddings disabled; records are cataloged without vectors".to_string(),
        };
    }

    let embedder = build_embedder(&config.embedding);
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name,
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    match runtime.block_on(embedder.embed("doctor check: pricing review with procurement")) {
        Ok(vector) if vector.len() == config.embedding.dimension => DoctorCheck {
            name,
            status: CheckStatus::Pass,
            details: format!(
                "{} provider returned a {}-dimensional vector",
                config.embedding.provider.as_str(),
                vector.len()
            ),
        },
        Ok(vector) => DoctorCheck {
            name,
            status: CheckStatus::Fail,
            details: format!(
                "provider returned {} dimensions, configured {}",
                vector.len(),
                config.embedding.dimension
            ),
        },
        Err(error) => DoctorCheck { name, status: CheckStatus::Fail, details: error.to_string() },
    }
}

/// Connectivity first; the backlog check only runs against a reachable database.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "dead_letter_backlog",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let backlog = match SqlDeadLetterSink::new(pool.clone()).pending_count().await {
            Ok(0) => DoctorCheck {
                name: "dead_letter_backlog",
                status: CheckStatus::Pass,
                details: "no pending dead letters".to_string(),
            },
            Ok(pending) => DoctorCheck {
                name: "dead_letter_backlog",
                status: CheckStatus::Pass,
                details: format!(
                    "{pending} pending dead letter(s); inspect with `gtmlake dead-letter list`"
                ),
            },
            Err(error) => DoctorCheck {
                name: "dead_letter_backlog",
                status: CheckStatus::Fail,
                details: format!("dead letter table unavailable (run `gtmlake migrate`): {error}"),
            },
        };
        pool.close().await;

        vec![
            DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            backlog,
        ]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
