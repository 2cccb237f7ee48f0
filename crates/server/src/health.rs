use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use gtmlake_db::repositories::DeadLetterSink;
use gtmlake_db::DbPool;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self { db_pool, dead_letters }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub dead_letters: HealthCheck,
    pub pending_dead_letters: Option<u64>,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

/// Ready only when the database answers. Pending dead letters are reported but do
/// not make the service unready.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let (dead_letters, pending_dead_letters) = match state.dead_letters.pending_count().await {
        Ok(pending) => (
            HealthCheck { status: "ready", detail: format!("{pending} pending dead letters") },
            Some(pending),
        ),
        Err(error) => (
            HealthCheck {
                status: "degraded",
                detail: format!("dead letter count failed: {error}"),
            },
            None,
        ),
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "gtmlake-server runtime initialized".to_string(),
        },
        database,
        dead_letters,
        pending_dead_letters,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::{extract::State, Json};
    use chrono::{TimeZone, Utc};
    use gtmlake_core::canonical::Canonicalizer;
    use gtmlake_core::domain::event::EventType;
    use gtmlake_core::errors::ProcessingError;
    use gtmlake_core::processing::DeadLetterRecord;
    use gtmlake_db::repositories::{DeadLetterSink, SqlDeadLetterSink};
    use gtmlake_db::{connect_with_settings, migrations, DbPool};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};

    async fn migrated_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn state(pool: &DbPool) -> HealthState {
        HealthState::new(pool.clone(), Arc::new(SqlDeadLetterSink::new(pool.clone())))
    }

    #[tokio::test]
    async fn health_returns_ready_with_pending_dead_letters() {
        let pool = migrated_pool().await;
        let envelope = Canonicalizer::default()
            .normalize_at(
                &json!({
                    "user_id": "u-1",
                    "session_id": "sess-1",
                    "timestamp": "2026-10-13T09:00:00Z",
                    "company_domain": "acme.com"
                }),
                EventType::ProductUsage,
                Utc.with_ymd_and_hms(2026, 10, 13, 9, 5, 0).unwrap(),
            )
            .expect("valid usage event");
        SqlDeadLetterSink::new(pool.clone())
            .record(&DeadLetterRecord::new(
                "group",
                0,
                envelope,
                &ProcessingError::Permanent("bad".to_string()),
                1,
            ))
            .await
            .expect("record");

        let (status, Json(payload)) = health(State(state(&pool))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.pending_dead_letters, Some(1));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = migrated_pool().await;
        let state = state(&pool);
        pool.close().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.dead_letters.status, "degraded");
        assert_eq!(payload.pending_dead_letters, None);
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn router_serves_health_as_json() {
        let pool = migrated_pool().await;

        let response = router(state(&pool))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("application/json"));

        pool.close().await;
    }
}
