use chrono::{TimeZone, Utc};
use serde_json::json;

use gtmlake_core::domain::event::{Envelope, EventType};
use gtmlake_core::Canonicalizer;

use crate::{connect_with_settings, migrations, DbPool};

pub(crate) async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool should connect");
    migrations::run_pending(&pool).await.expect("migrations should run");
    pool
}

pub(crate) fn calendar_envelope(event_id: &str, domain: &str) -> Envelope {
    let raw = json!({
        "event_id": event_id,
        "title": format!("{domain} discovery call"),
        "start_time": "2026-10-13T15:00:00Z",
        "end_time": "2026-10-13T16:00:00Z",
        "attendees": [
            {"email": format!("jane@{domain}"), "name": "Jane Doe", "role": "CTO"}
        ],
        "organizer": "sam@seller.io",
        "company_domain": domain
    });
    Canonicalizer::default()
        .normalize_at(&raw, EventType::CalendarEvent, Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap())
        .expect("valid calendar event")
}
