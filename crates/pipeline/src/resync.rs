//! Recovery tools: rebuilding derived layers from the raw store, and replaying
//! dead-lettered envelopes through the log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use gtmlake_core::domain::event::EventId;
use gtmlake_db::repositories::{
    DeadLetterSink, LogError, PartitionLog, PublishReceipt, RepositoryError, Storage,
    StorageError,
};

use crate::processor::EnrichmentProcessor;

const RESYNC_PAGE_SIZE: u32 = 200;

#[derive(Debug, Error)]
pub enum ResyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Log(#[from] LogError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub consumer_group: String,
    pub records_rebuilt: u64,
    pub vectors_written: u64,
    pub skipped: Vec<EventId>,
    pub offsets_reset: u64,
}

/// Re-derives catalog and vector entries from every raw record, then moves the group's
/// lagging offsets up to each partition's low watermark. Safe to run repeatedly.
pub async fn resync(
    consumer_group: &str,
    log: &dyn PartitionLog,
    storage: &dyn Storage,
    processor: &EnrichmentProcessor,
) -> Result<ResyncReport, ResyncError> {
    let mut report =
        ResyncReport { consumer_group: consumer_group.to_string(), ..ResyncReport::default() };
    let mut cursor: Option<EventId> = None;

    loop {
        let page = storage.list_raw(cursor.as_ref(), RESYNC_PAGE_SIZE).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(last.event_id.clone());

        for envelope in &page {
            let enriched = match processor.process(envelope).await {
                Ok(enriched) => enriched,
                Err(error) => {
                    warn!(
                        event_name = "pipeline.resync.skipped",
                        event_id = %envelope.event_id,
                        reason = %error,
                        "raw record could not be re-derived"
                    );
                    report.skipped.push(envelope.event_id.clone());
                    continue;
                }
            };
            storage.upsert_catalog(enriched.event_id(), &enriched.catalog_fields()).await?;
            if let Some(embedding) = &enriched.embedding {
                storage.upsert_vector(enriched.event_id(), embedding).await?;
                report.vectors_written += 1;
            }
            report.records_rebuilt += 1;
        }
    }

    report.offsets_reset = log.reset_to_low_watermark(consumer_group).await?;
    info!(
        event_name = "pipeline.resync.completed",
        consumer_group = %consumer_group,
        records_rebuilt = report.records_rebuilt,
        offsets_reset = report.offsets_reset,
        "consumer group resynced from raw store"
    );
    Ok(report)
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("dead letter `{0}` not found")]
    NotFound(String),
    #[error("dead letter `{0}` was already replayed")]
    AlreadyReplayed(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Log(#[from] LogError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub dead_letter_id: String,
    pub event_id: EventId,
    pub topic: String,
    pub offset: u64,
    pub replayed_at: DateTime<Utc>,
}

/// Republishes a dead-lettered envelope and stamps it replayed. The envelope is
/// appended even though the identical payload is already on the log.
pub async fn replay_dead_letter(
    id: &str,
    dead_letters: &dyn DeadLetterSink,
    log: &dyn PartitionLog,
    at: DateTime<Utc>,
) -> Result<ReplayOutcome, ReplayError> {
    let record =
        dead_letters.find(id).await?.ok_or_else(|| ReplayError::NotFound(id.to_string()))?;
    if record.replayed_at.is_some() {
        return Err(ReplayError::AlreadyReplayed(id.to_string()));
    }

    let PublishReceipt { topic, offset, .. } = log.republish(&record.envelope).await?;
    if !dead_letters.mark_replayed(id, at).await? {
        return Err(ReplayError::AlreadyReplayed(id.to_string()));
    }

    info!(
        event_name = "pipeline.dead_letter.replayed",
        dead_letter_id = %id,
        event_id = %record.event_id,
        topic = %topic,
        offset = offset,
        "dead letter republished"
    );
    Ok(ReplayOutcome {
        dead_letter_id: id.to_string(),
        event_id: record.event_id,
        topic,
        offset,
        replayed_at: at,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use gtmlake_core::config::AppConfig;
    use gtmlake_core::domain::event::{EventId, EventType};
    use gtmlake_core::errors::ProcessingError;
    use gtmlake_core::processing::DeadLetterRecord;
    use gtmlake_db::repositories::{
        DeadLetterSink, PartitionLog, RetentionPolicy, SqlPartitionLog, SqlStorage, Storage,
    };

    use super::{replay_dead_letter, resync, ReplayError};
    use crate::assembly::Components;
    use crate::embedding::HashingEmbedder;
    use crate::processor::tests::{calendar, lead};
    use crate::processor::EnrichmentProcessor;
    use crate::test_support::{setup_pool, sql_stores, DIMENSION};

    fn processor() -> EnrichmentProcessor {
        EnrichmentProcessor::new(Arc::new(HashingEmbedder::new(DIMENSION)), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn resync_rebuilds_catalog_and_clears_offset_out_of_range() {
        let pool = setup_pool().await;
        let log = SqlPartitionLog::new(pool.clone()).with_retention(RetentionPolicy {
            max_age: Duration::from_secs(3600),
            max_records: 1,
        });
        let storage = SqlStorage::new(pool).with_dimension(DIMENSION);

        let events =
            [calendar("cal-1", "acme.com", "CTO"), calendar("cal-2", "acme.com", "VP Sales")];
        for event in &events {
            log.publish(event).await.expect("publish");
            storage.write_raw(event).await.expect("raw");
        }
        storage.write_raw(&lead("agent-1", "acme.com", 3.0)).await.expect("raw");
        log.commit_offset("group", events[0].topic(), &events[0].partition_key, 0, None)
            .await
            .expect("commit");
        log.enforce_retention(Utc::now()).await.expect("retention");

        let report = resync("group", &log, &storage, &processor()).await.expect("resync");

        assert_eq!(report.records_rebuilt, 2);
        assert_eq!(report.vectors_written, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.offsets_reset, 1);
        assert!(storage.get_catalog(&events[1].event_id).await.expect("catalog").is_some());
        let committed = log
            .committed_offset("group", events[0].topic(), &events[0].partition_key)
            .await
            .expect("offset");
        assert_eq!(committed, Some(1));

        let again = resync("group", &log, &storage, &processor()).await.expect("second resync");
        assert_eq!(again.records_rebuilt, 2);
        assert_eq!(again.offsets_reset, 0);
    }

    #[tokio::test]
    async fn resync_keeps_the_newest_revision_of_an_event() {
        let mut config = AppConfig::default();
        config.embedding.dimension = DIMENSION;
        let components = Components::new(setup_pool().await, config);
        let ingestion = components.ingestion();
        let mut worker = components.worker("worker-a");
        let mut meeting = json!({
            "event_id": "cal-9",
            "title": "acme.com pricing review",
            "start_time": "2026-10-13T15:00:00Z",
            "end_time": "2026-10-13T16:00:00Z",
            "attendees": [{"email": "jane@acme.com", "role": "CTO"}],
            "organizer": "sam@seller.io",
            "company_domain": "acme.com"
        });

        ingestion.ingest(&meeting, EventType::CalendarEvent).await.expect("first revision");
        worker.run_once(10).await.expect("drain first revision");
        meeting["title"] = json!("Revised pricing review");
        let receipt =
            ingestion.ingest(&meeting, EventType::CalendarEvent).await.expect("second revision");
        assert!(!receipt.duplicate);
        worker.run_once(10).await.expect("drain second revision");

        let report = resync(
            &components.config.processor.consumer_group,
            components.log.as_ref(),
            components.storage.as_ref(),
            &components.processor(),
        )
        .await
        .expect("resync");

        assert_eq!(report.records_rebuilt, 1);
        let entry = components
            .storage
            .get_catalog(&EventId("cal-9".into()))
            .await
            .expect("catalog")
            .expect("entry");
        assert_eq!(entry.fields.get("title"), Some(&json!("Revised pricing review")));
    }

    #[tokio::test]
    async fn replay_republishes_and_marks_the_dead_letter() {
        let stores = sql_stores().await;
        let event = calendar("cal-1", "acme.com", "CTO");
        let receipt = stores.log.publish(&event).await.expect("publish");
        let record = DeadLetterRecord::new(
            "group",
            receipt.offset,
            event.clone(),
            &ProcessingError::Transient("embedding timed out".into()),
            3,
        );
        stores.dead_letters.record(&record).await.expect("record");

        let replay = |id: String| {
            let dead_letters = Arc::clone(&stores.dead_letters);
            let log = Arc::clone(&stores.log);
            async move {
                replay_dead_letter(&id, dead_letters.as_ref(), log.as_ref(), Utc::now()).await
            }
        };

        let outcome = replay(record.id.clone()).await.expect("replay");

        assert_eq!(outcome.offset, 1);
        assert_eq!(stores.dead_letters.pending_count().await.expect("count"), 0);
        let again = replay(record.id.clone()).await;
        assert!(matches!(again, Err(ReplayError::AlreadyReplayed(_))));
        let missing = replay("nope".to_string()).await;
        assert!(matches!(missing, Err(ReplayError::NotFound(_))));
    }
}
