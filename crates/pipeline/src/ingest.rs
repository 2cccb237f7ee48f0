use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use gtmlake_core::canonical::Canonicalizer;
use gtmlake_core::domain::event::{Envelope, EventId, EventType, PartitionKey};
use gtmlake_core::errors::{ApplicationError, ValidationError};
use gtmlake_db::repositories::{LogError, PartitionLog};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("publish failed: {0}")]
    Log(#[from] LogError),
}

impl From<IngestError> for ApplicationError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Validation(error) => Self::Validation(error),
            IngestError::Log(error) => Self::Persistence(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub event_id: EventId,
    pub event_type: EventType,
    pub topic: String,
    pub partition_key: PartitionKey,
    pub offset: u64,
    pub duplicate: bool,
}

/// Ingestion boundary: validate, normalize, publish. Nothing reaches the log unless it
/// passed validation, and a successful return means the envelope is durable.
pub struct IngestionService {
    canonicalizer: Canonicalizer,
    log: Arc<dyn PartitionLog>,
}

impl IngestionService {
    pub fn new(log: Arc<dyn PartitionLog>, canonicalizer: Canonicalizer) -> Self {
        Self { canonicalizer, log }
    }

    pub async fn ingest(
        &self,
        raw_payload: &Value,
        declared_type: EventType,
    ) -> Result<IngestReceipt, IngestError> {
        let envelope = self.canonicalizer.normalize(raw_payload, declared_type).map_err(|error| {
            warn!(
                event_name = "pipeline.ingest.rejected",
                event_type = %declared_type,
                field = %error.field,
                reason = %error.reason,
                "payload failed validation"
            );
            error
        })?;
        self.publish(&envelope).await
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<IngestReceipt, IngestError> {
        let receipt = self.log.publish(envelope).await?;

        if receipt.duplicate {
            debug!(
                event_name = "pipeline.ingest.duplicate",
                event_id = %envelope.event_id,
                topic = %receipt.topic,
                offset = receipt.offset,
                "identical envelope already on the log"
            );
        } else {
            info!(
                event_name = "pipeline.ingest.published",
                event_id = %envelope.event_id,
                topic = %receipt.topic,
                partition_key = %receipt.partition_key,
                offset = receipt.offset,
                "envelope published"
            );
        }

        Ok(IngestReceipt {
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type,
            topic: receipt.topic,
            partition_key: receipt.partition_key,
            offset: receipt.offset,
            duplicate: receipt.duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use gtmlake_core::canonical::Canonicalizer;
    use gtmlake_core::domain::event::EventType;
    use gtmlake_db::repositories::{PartitionLog, SqlPartitionLog};

    use super::{IngestError, IngestionService};
    use crate::test_support::setup_pool;

    fn meeting() -> serde_json::Value {
        json!({
            "event_id": "cal-1",
            "title": "Acme discovery",
            "start_time": "2026-10-13T15:00:00Z",
            "end_time": "2026-10-13T16:00:00Z",
            "attendees": [{"email": "jane@acme.com", "role": "CTO"}],
            "organizer": "sam@seller.io",
            "company_domain": "Acme.com"
        })
    }

    #[tokio::test]
    async fn valid_payload_is_published_to_its_topic() {
        let log: Arc<dyn PartitionLog> = Arc::new(SqlPartitionLog::new(setup_pool().await));
        let service = IngestionService::new(Arc::clone(&log), Canonicalizer::default());

        let receipt = service.ingest(&meeting(), EventType::CalendarEvent).await.expect("ingest");

        assert_eq!(receipt.topic, "gtm.calendar_events");
        assert_eq!(receipt.partition_key.0, "acme.com");
        assert_eq!(receipt.offset, 0);
        assert!(!receipt.duplicate);
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_the_log() {
        let log: Arc<dyn PartitionLog> = Arc::new(SqlPartitionLog::new(setup_pool().await));
        let service = IngestionService::new(Arc::clone(&log), Canonicalizer::default());
        let mut payload = meeting();
        payload["attendees"] = json!([]);

        let error = service.ingest(&payload, EventType::CalendarEvent).await.expect_err("invalid");

        assert!(matches!(error, IngestError::Validation(ref e) if e.field == "attendees"));
        let partitions =
            log.partitions(&["gtm.calendar_events".to_string()]).await.expect("partitions");
        assert!(partitions.is_empty());
    }

    #[tokio::test]
    async fn reingesting_the_same_event_is_a_no_op() {
        let log: Arc<dyn PartitionLog> = Arc::new(SqlPartitionLog::new(setup_pool().await));
        let service = IngestionService::new(Arc::clone(&log), Canonicalizer::default());

        service.ingest(&meeting(), EventType::CalendarEvent).await.expect("first");
        let again = service.ingest(&meeting(), EventType::CalendarEvent).await.expect("second");

        assert!(again.duplicate);
        assert_eq!(again.offset, 0);
    }
}
