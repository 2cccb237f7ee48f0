use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use gtmlake_cli::commands::{ask, dead_letter, drain, ingest, migrate, resync, retention, smoke};
use serde_json::{json, Value};
use tempfile::TempDir;

#[test]
fn migrate_returns_success_with_valid_env() {
    let dir = TempDir::new().expect("temp dir");
    with_env(&[("GTMLAKE_DATABASE_URL", &database_url(dir.path()))], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("GTMLAKE_DATABASE_URL", "postgres://localhost/gtm")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn ingest_reports_rejected_payloads_without_dropping_valid_ones() {
    let dir = TempDir::new().expect("temp dir");
    let events = dir.path().join("events.json");
    let mut broken = meeting("cal-2", "globex.com");
    broken["attendees"] = json!([]);
    fs::write(&events, json!([meeting("cal-1", "acme.com"), broken]).to_string())
        .expect("write events");

    with_env(&[("GTMLAKE_DATABASE_URL", &database_url(dir.path()))], || {
        let result = ingest::run("calendar_event", &events);
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "validation");
        assert_eq!(payload["data"]["published"], 1);
        assert_eq!(payload["data"]["rejected"][0]["index"], 1);
        assert_eq!(payload["data"]["rejected"][0]["field"], "attendees");
    });
}

#[test]
fn ingest_rejects_unknown_event_types() {
    with_env(&[], || {
        let result = ingest::run("crm_deal", Path::new("unused.json"));
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "invalid_input");
    });
}

#[test]
fn ingest_drain_and_ask_answer_from_the_catalog() {
    let dir = TempDir::new().expect("temp dir");
    let events = dir.path().join("events.json");
    let batch = json!([meeting("cal-1", "acme.com"), meeting("cal-2", "globex.com")]);
    fs::write(&events, batch.to_string()).expect("write events");

    with_env(
        &[
            ("GTMLAKE_DATABASE_URL", &database_url(dir.path())),
            ("GTMLAKE_EMBEDDING_DIMENSION", "64"),
        ],
        || {
            let ingested = ingest::run("calendar_event", &events);
            assert_eq!(ingested.exit_code, 0, "{}", ingested.output);
            let again = parse_payload(&ingest::run("calendar_event", &events).output);
            assert_eq!(again["data"]["duplicates"], 2);

            let drained = parse_payload(&drain::run(100).output);
            assert_eq!(drained["status"], "ok");
            assert_eq!(drained["data"]["processed"], 2);
            assert_eq!(drained["data"]["vectors_written"], 2);

            let answered = ask::run("meetings with acme.com");
            assert_eq!(answered.exit_code, 0);
            let payload = parse_payload(&answered.output);
            assert_eq!(payload["data"]["status"], "answered");
            assert_eq!(payload["data"]["rows"].as_array().map(Vec::len), Some(1));
            assert_eq!(payload["data"]["rows"][0]["event_id"], "cal-1");

            let rebuilt = parse_payload(&resync::run().output);
            assert_eq!(rebuilt["status"], "ok");
            assert_eq!(rebuilt["data"]["records_rebuilt"], 2);
            assert_eq!(rebuilt["data"]["offsets_reset"], 0);
        },
    );
}

#[test]
fn retention_trims_partitions_to_the_configured_cap() {
    let dir = TempDir::new().expect("temp dir");
    let events = dir.path().join("events.json");
    let batch = json!([meeting("cal-1", "acme.com"), meeting("cal-2", "acme.com")]);
    fs::write(&events, batch.to_string()).expect("write events");

    with_env(
        &[
            ("GTMLAKE_DATABASE_URL", &database_url(dir.path())),
            ("GTMLAKE_LOG_RETENTION_MAX_RECORDS", "1"),
        ],
        || {
            assert_eq!(ingest::run("calendar_event", &events).exit_code, 0);

            let swept = retention::run();
            assert_eq!(swept.exit_code, 0, "{}", swept.output);
            let payload = parse_payload(&swept.output);
            assert_eq!(payload["data"]["removed_records"], 1);
            assert_eq!(payload["data"]["partitions_advanced"], 1);

            let drained = parse_payload(&drain::run(100).output);
            assert_eq!(drained["data"]["processed"], 1);
        },
    );
}

#[test]
fn ask_without_cues_returns_a_clarification() {
    let dir = TempDir::new().expect("temp dir");
    with_env(&[("GTMLAKE_DATABASE_URL", &database_url(dir.path()))], || {
        let result = ask::run("what should I do next?");
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["data"]["status"], "clarification");
        assert!(payload["message"].as_str().unwrap_or_default().contains("meetings"));
    });
}

#[test]
fn dead_letter_commands_handle_an_empty_backlog() {
    let dir = TempDir::new().expect("temp dir");
    with_env(&[("GTMLAKE_DATABASE_URL", &database_url(dir.path()))], || {
        let listed = parse_payload(&dead_letter::list(false, 10).output);
        assert_eq!(listed["status"], "ok");
        assert_eq!(listed["data"], json!([]));

        let replayed = dead_letter::replay("missing-id");
        assert_eq!(replayed.exit_code, 6);
        assert_eq!(parse_payload(&replayed.output)["error_class"], "not_found");
    });
}

#[test]
fn smoke_returns_success_report_with_valid_env() {
    let dir = TempDir::new().expect("temp dir");
    with_env(&[("GTMLAKE_DATABASE_URL", &database_url(dir.path()))], || {
        let result = smoke::run();
        assert_eq!(result.exit_code, 0, "expected successful smoke report: {}", result.output);

        let payload = parse_payload(last_line(&result.output));
        assert_eq!(payload["command"], "smoke");
        assert_eq!(payload["status"], "pass");
    });
}

#[test]
fn smoke_returns_failure_when_config_invalid() {
    with_env(&[("GTMLAKE_EMBEDDING_DIMENSION", "0")], || {
        let result = smoke::run();
        assert_eq!(result.exit_code, 6, "expected smoke failure code");

        let payload = parse_payload(last_line(&result.output));
        assert_eq!(payload["command"], "smoke");
        assert_eq!(payload["status"], "fail");
    });
}

fn meeting(event_id: &str, domain: &str) -> Value {
    json!({
        "event_id": event_id,
        "title": format!("{domain} pricing review"),
        "description": "Walk through the enterprise tier",
        "start_time": "2026-10-13T15:00:00Z",
        "end_time": "2026-10-13T16:00:00Z",
        "attendees": [{"email": format!("jane@{domain}"), "role": "CTO"}],
        "organizer": "sam@seller.io",
        "company_domain": domain
    })
}

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", dir.join("gtmlake.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn last_line(output: &str) -> &str {
    output.lines().last().unwrap_or_default()
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "GTMLAKE_DATABASE_URL",
        "GTMLAKE_DATABASE_MAX_CONNECTIONS",
        "GTMLAKE_DATABASE_TIMEOUT_SECS",
        "GTMLAKE_LOG_RETENTION_HOURS",
        "GTMLAKE_LOG_RETENTION_MAX_RECORDS",
        "GTMLAKE_LOG_FALLBACK_PARTITIONS",
        "GTMLAKE_LOG_RETENTION_INTERVAL_SECS",
        "GTMLAKE_PROCESSOR_CONSUMER_GROUP",
        "GTMLAKE_PROCESSOR_WORKER_ID",
        "GTMLAKE_PROCESSOR_MAX_ATTEMPTS",
        "GTMLAKE_PROCESSOR_EMBEDDING_TIMEOUT_MS",
        "GTMLAKE_EMBEDDING_PROVIDER",
        "GTMLAKE_EMBEDDING_DIMENSION",
        "GTMLAKE_QUERY_RESULT_LIMIT",
        "GTMLAKE_SERVER_BIND_ADDRESS",
        "GTMLAKE_SERVER_HEALTH_CHECK_PORT",
        "GTMLAKE_LOGGING_LEVEL",
        "GTMLAKE_LOGGING_FORMAT",
        "GTMLAKE_LOG_LEVEL",
        "GTMLAKE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
