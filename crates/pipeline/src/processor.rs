use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use gtmlake_core::capability::EmbeddingProvider;
use gtmlake_core::domain::event::Envelope;
use gtmlake_core::domain::record::EnrichedRecord;
use gtmlake_core::enrich::{derive_fields, embedding_text, extract_entities, semantic_check};
use gtmlake_core::errors::ProcessingError;

/// Turns an envelope into an [`EnrichedRecord`]. Pure apart from the embedding call,
/// so reprocessing the same envelope is always safe.
#[derive(Clone)]
pub struct EnrichmentProcessor {
    embedder: Arc<dyn EmbeddingProvider>,
    embedding_timeout: Duration,
}

impl EnrichmentProcessor {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, embedding_timeout: Duration) -> Self {
        Self { embedder, embedding_timeout }
    }

    pub async fn process(&self, envelope: &Envelope) -> Result<EnrichedRecord, ProcessingError> {
        semantic_check(envelope)?;

        let derived = derive_fields(envelope);
        let entities = extract_entities(&envelope.payload);
        let embedding = match embedding_text(&envelope.payload) {
            Some(text) if envelope.event_type.supports_embedding() => {
                self.embed(envelope, &text).await?
            }
            _ => None,
        };

        Ok(EnrichedRecord { envelope: envelope.clone(), entities, derived, embedding })
    }

    /// A timeout is transient and retried. An unavailable provider degrades to no vector.
    async fn embed(
        &self,
        envelope: &Envelope,
        text: &str,
    ) -> Result<Option<Vec<f32>>, ProcessingError> {
        match tokio::time::timeout(self.embedding_timeout, self.embedder.embed(text)).await {
            Err(_) => Err(ProcessingError::Transient(format!(
                "embedding timed out after {}ms",
                self.embedding_timeout.as_millis()
            ))),
            Ok(Err(unavailable)) => {
                warn!(
                    event_name = "pipeline.processor.embedding_unavailable",
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    reason = %unavailable,
                    "storing record without a vector entry"
                );
                Ok(None)
            }
            Ok(Ok(vector)) => Ok(Some(vector)),
        }
    }
}
