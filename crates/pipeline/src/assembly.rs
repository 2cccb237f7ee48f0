//! Builds the pipeline's components from loaded configuration. Both the server and
//! the CLI go through here so they agree on stores, retention and capabilities.

use std::sync::Arc;
use std::time::Duration;

use gtmlake_core::capability::{EmbeddingProvider, IntentClassifier};
use gtmlake_core::config::AppConfig;
use gtmlake_core::domain::event::EventType;
use gtmlake_core::processing::RetryPolicy;
use gtmlake_core::Canonicalizer;
use gtmlake_db::repositories::{
    DeadLetterSink, PartitionLog, RetentionPolicy, SqlDeadLetterSink, SqlPartitionLog,
    SqlStorage, Storage,
};
use gtmlake_db::{DbPool, Subscription, SubscriptionOptions};

use crate::classifier::KeywordIntentClassifier;
use crate::embedding::build_embedder;
use crate::ingest::IngestionService;
use crate::processor::EnrichmentProcessor;
use crate::retention::RetentionTask;
use crate::runtime::{QueryRuntime, QueryRuntimeConfig};
use crate::worker::PartitionWorker;

#[derive(Clone)]
pub struct Components {
    pub config: AppConfig,
    pub log: Arc<dyn PartitionLog>,
    pub storage: Arc<dyn Storage>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub classifier: Arc<dyn IntentClassifier>,
}

impl Components {
    pub fn new(pool: DbPool, config: AppConfig) -> Self {
        let log = SqlPartitionLog::new(pool.clone())
            .with_retention(RetentionPolicy::from(&config.log));
        let storage = SqlStorage::new(pool.clone()).with_dimension(config.embedding.dimension);

        Self {
            log: Arc::new(log),
            storage: Arc::new(storage),
            dead_letters: Arc::new(SqlDeadLetterSink::new(pool)),
            embedder: build_embedder(&config.embedding),
            classifier: Arc::new(KeywordIntentClassifier::default()),
            config,
        }
    }

    pub fn ingestion(&self) -> IngestionService {
        IngestionService::new(
            Arc::clone(&self.log),
            Canonicalizer::new(self.config.log.fallback_partitions),
        )
    }

    pub fn processor(&self) -> EnrichmentProcessor {
        EnrichmentProcessor::new(
            Arc::clone(&self.embedder),
            Duration::from_millis(self.config.processor.embedding_timeout_ms),
        )
    }

    /// A worker subscribed to every topic under the configured consumer group.
    /// Leases are taken in the name of `worker_id`.
    pub fn worker(&self, worker_id: &str) -> PartitionWorker {
        let processor_config = &self.config.processor;
        let topics =
            EventType::ALL.iter().map(|event_type| event_type.topic().to_string()).collect();
        let mut options = SubscriptionOptions::new(processor_config.consumer_group.clone(), topics)
            .with_lease(worker_id, Duration::from_millis(processor_config.lease_duration_ms));
        options.batch_size = processor_config.batch_size;
        options.poll_interval = Duration::from_millis(processor_config.poll_interval_ms);

        PartitionWorker::new(
            Subscription::new(Arc::clone(&self.log), options),
            self.processor(),
            Arc::clone(&self.storage),
            Arc::clone(&self.dead_letters),
            RetryPolicy::new(processor_config.retry_policy()),
        )
    }

    pub fn retention_task(&self) -> RetentionTask {
        RetentionTask::new(
            Arc::clone(&self.log),
            Duration::from_secs(self.config.log.retention_interval_secs),
        )
    }

    pub fn query_runtime(&self) -> QueryRuntime {
        QueryRuntime::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.classifier),
            Arc::clone(&self.embedder),
            QueryRuntimeConfig::from(&self.config.query),
        )
    }
}
