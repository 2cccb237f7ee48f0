//! Consumer-group worker: pulls records from the partitions it owns, enriches them,
//! writes raw then catalog then vector, and commits the source offset last.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use gtmlake_core::domain::event::Envelope;
use gtmlake_core::errors::{ApplicationError, ProcessingError};
use gtmlake_core::processing::{DeadLetterRecord, RetryDecision, RetryPolicy};
use gtmlake_db::repositories::{
    DeadLetterSink, LogError, LogRecord, RepositoryError, Storage, StorageError,
};
use gtmlake_db::Subscription;

use crate::processor::EnrichmentProcessor;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("dead-letter sink unavailable: {0}")]
    DeadLetter(#[from] RepositoryError),
}

impl WorkerError {
    /// The group fell behind retention and must be resynced before it can resume.
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::Log(LogError::OffsetOutOfRange { .. }))
    }

    pub fn into_application(self, consumer_group: &str) -> ApplicationError {
        match self {
            Self::Log(LogError::OffsetOutOfRange {
                topic,
                partition_key,
                requested,
                low_watermark,
            }) => ApplicationError::OffsetOutOfRange {
                consumer_group: consumer_group.to_string(),
                topic,
                partition_key: partition_key.0,
                requested,
                low_watermark,
            },
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub vectors_written: u64,
}

impl WorkerStats {
    fn absorb(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.dead_lettered += other.dead_lettered;
        self.retries += other.retries;
        self.vectors_written += other.vectors_written;
    }
}

pub struct PartitionWorker {
    subscription: Subscription,
    processor: EnrichmentProcessor,
    storage: Arc<dyn Storage>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
}

impl PartitionWorker {
    pub fn new(
        subscription: Subscription,
        processor: EnrichmentProcessor,
        storage: Arc<dyn Storage>,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self { subscription, processor, storage, dead_letters, retry }
    }

    pub fn consumer_group(&self) -> &str {
        self.subscription.consumer_group()
    }

    /// Handles whatever is available right now, at most `max_records`, then returns.
    pub async fn run_once(&mut self, max_records: usize) -> Result<WorkerStats, WorkerError> {
        let mut stats = WorkerStats::default();
        while (stats.processed + stats.dead_lettered) < max_records as u64 {
            let Some(record) = self.next_record(false).await? else {
                break;
            };
            stats.absorb(&self.handle(record).await?);
        }
        Ok(stats)
    }

    /// Gives up every partition lease this worker holds.
    pub async fn release(&mut self) -> Result<(), WorkerError> {
        self.subscription.close().await.map_err(WorkerError::from)
    }

    /// Runs until `shutdown` flips to `true`. A record that is already being handled
    /// always finishes before the worker stops.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerStats, WorkerError> {
        let mut stats = WorkerStats::default();
        info!(
            event_name = "pipeline.worker.started",
            consumer_group = %self.consumer_group(),
            "partition worker started"
        );

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            let record = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                record = self.next_record(true) => record,
            };
            match record {
                Ok(Some(record)) => match self.handle(record).await {
                    Ok(handled) => stats.absorb(&handled),
                    Err(error) => break Err(error),
                },
                Ok(None) => {}
                Err(error) => break Err(error),
            }
        };

        if let Err(error) = self.subscription.close().await {
            warn!(
                event_name = "pipeline.worker.release_failed",
                consumer_group = %self.consumer_group(),
                error = %error,
                "could not release partition leases on shutdown"
            );
        }
        info!(
            event_name = "pipeline.worker.stopped",
            consumer_group = %self.consumer_group(),
            processed = stats.processed,
            dead_lettered = stats.dead_lettered,
            "partition worker stopped"
        );
        outcome.map(|()| stats)
    }

    async fn next_record(&mut self, wait: bool) -> Result<Option<LogRecord>, WorkerError> {
        let next = if wait {
            self.subscription.next().await.map(Some)
        } else {
            self.subscription.try_next().await
        };
        next.map_err(|error| {
            if let LogError::OffsetOutOfRange { topic, partition_key, requested, low_watermark } =
                &error
            {
                error!(
                    event_name = "pipeline.worker.offset_out_of_range",
                    consumer_group = %self.subscription.consumer_group(),
                    topic = %topic,
                    partition_key = %partition_key,
                    requested = *requested,
                    low_watermark = *low_watermark,
                    "consumer group fell behind retention; resync required"
                );
            }
            WorkerError::from(error)
        })
    }

    async fn handle(&mut self, record: LogRecord) -> Result<WorkerStats, WorkerError> {
        let mut stats = WorkerStats::default();
        let mut attempt = 1;

        loop {
            match self.process_and_store(&record.envelope).await {
                Ok(vector_written) => {
                    stats.processed += 1;
                    stats.vectors_written += u64::from(vector_written);
                    break;
                }
                Err(failure) => match self.retry.decide(attempt, &failure) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            event_name = "pipeline.worker.retrying",
                            event_id = %record.envelope.event_id,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            reason = %failure,
                            "transient processing failure"
                        );
                        stats.retries += 1;
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DeadLetter => {
                        let dead_letter = DeadLetterRecord::new(
                            self.subscription.consumer_group(),
                            record.offset,
                            record.envelope.clone(),
                            &failure,
                            attempt,
                        );
                        self.dead_letters.record(&dead_letter).await?;
                        error!(
                            event_name = "pipeline.worker.dead_lettered",
                            event_id = %record.envelope.event_id,
                            consumer_group = %dead_letter.consumer_group,
                            topic = %record.topic,
                            partition_key = %record.partition_key,
                            offset = record.offset,
                            error_class = %dead_letter.error_class,
                            attempts = attempt,
                            reason = %dead_letter.reason,
                            "record routed to dead-letter sink"
                        );
                        stats.dead_lettered += 1;
                        break;
                    }
                },
            }
        }

        match self.subscription.commit(&record).await {
            Ok(()) => Ok(stats),
            // The partition moved to another worker, which resumes from the last commit.
            Err(LogError::LeaseLost { .. }) => Ok(stats),
            Err(error) => Err(error.into()),
        }
    }

    async fn process_and_store(&self, envelope: &Envelope) -> Result<bool, ProcessingError> {
        let enriched = self.processor.process(envelope).await?;

        self.storage.write_raw(&enriched.envelope).await.map_err(storage_failure)?;
        self.storage
            .upsert_catalog(enriched.event_id(), &enriched.catalog_fields())
            .await
            .map_err(storage_failure)?;

        match &enriched.embedding {
            Some(embedding) => {
                self.storage
                    .upsert_vector(enriched.event_id(), embedding)
                    .await
                    .map_err(storage_failure)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn storage_failure(error: StorageError) -> ProcessingError {
    match error {
        StorageError::DimensionMismatch { .. } | StorageError::Encode(_) => {
            ProcessingError::Permanent(error.to_string())
        }
        StorageError::RawNotFound(_) | StorageError::Timeout(_) | StorageError::Repository(_) => {
            ProcessingError::Transient(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use gtmlake_core::capability::EmbeddingProvider;
    use gtmlake_core::domain::event::EventType;
    use gtmlake_core::errors::EmbeddingUnavailable;
    use gtmlake_core::processing::{RetryPolicy, RetryPolicyConfig};
    use gtmlake_db::repositories::{LogError, PartitionLog, SqlPartitionLog, RetentionPolicy};
    use gtmlake_db::{Subscription, SubscriptionOptions};

    use super::{PartitionWorker, WorkerError};
    use crate::embedding::{DisabledEmbedder, HashingEmbedder};
    use crate::processor::tests::{calendar, lead, SlowEmbedder};
    use crate::processor::EnrichmentProcessor;
    use crate::test_support::{sql_stores, Stores, DIMENSION};

    const GROUP: &str = "gtm-data-lake-group";

    fn topics() -> Vec<String> {
        EventType::ALL.iter().map(|event_type| event_type.topic().to_string()).collect()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryPolicyConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_multiplier: 2,
            max_delay: Duration::from_millis(5),
            jitter_ratio: 0.0,
        })
    }

    fn worker(
        stores: &Stores,
        embedder: Arc<dyn EmbeddingProvider>,
        embedding_timeout: Duration,
        retry: RetryPolicy,
    ) -> PartitionWorker {
        let subscription = Subscription::new(
            Arc::clone(&stores.log),
            SubscriptionOptions::new(GROUP, topics()).with_lease("worker-1", Duration::from_secs(30)),
        );
        PartitionWorker::new(
            subscription,
            EnrichmentProcessor::new(embedder, embedding_timeout),
            Arc::clone(&stores.storage),
            Arc::clone(&stores.dead_letters),
            retry,
        )
    }

    struct FlakyEmbedder {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        fn dimension(&self) -> usize {
            DIMENSION
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingUnavailable> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            HashingEmbedder::new(DIMENSION).embed(text).await
        }
    }

    #[tokio::test]
    async fn processed_records_land_in_every_layer_and_commit() {
        let stores = sql_stores().await;
        let event = calendar("cal-1", "acme.com", "CTO");
        stores.log.publish(&event).await.expect("publish");
        stores.log.publish(&lead("agent-1", "acme.com", 0.9)).await.expect("publish");

        let mut worker = worker(
            &stores,
            Arc::new(HashingEmbedder::new(DIMENSION)),
            Duration::from_secs(1),
            fast_retry(3),
        );
        let stats = worker.run_once(100).await.expect("run");

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.vectors_written, 1);
        assert!(stores.storage.read_raw(&event.event_id).await.expect("raw").is_some());
        assert!(stores.storage.get_catalog(&event.event_id).await.expect("catalog").is_some());
        let committed = stores
            .log
            .committed_offset(GROUP, event.topic(), &event.partition_key)
            .await
            .expect("offset");
        assert_eq!(committed, Some(1));
        assert_eq!(worker.run_once(100).await.expect("idle").processed, 0);
    }

    #[tokio::test]
    async fn missing_embeddings_still_reach_raw_and_catalog() {
        let stores = sql_stores().await;
        let event = calendar("cal-1", "acme.com", "CTO");
        stores.log.publish(&event).await.expect("publish");

        let mut worker = worker(
            &stores,
            Arc::new(DisabledEmbedder::new(DIMENSION)),
            Duration::from_secs(1),
            fast_retry(3),
        );
        let stats = worker.run_once(10).await.expect("run");

        assert_eq!((stats.processed, stats.vectors_written, stats.dead_lettered), (1, 0, 0));
        assert!(stores.storage.get_catalog(&event.event_id).await.expect("catalog").is_some());
        let query = HashingEmbedder::new(DIMENSION).embed_sync("pricing review").expect("vector");
        let hits = stores.storage.similarity_search(&query, 10).await.expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_dead_letter_after_max_attempts() {
        let stores = sql_stores().await;
        let event = calendar("cal-1", "acme.com", "CTO");
        stores.log.publish(&event).await.expect("publish");

        let mut worker =
            worker(&stores, Arc::new(SlowEmbedder), Duration::from_millis(10), fast_retry(3));
        let stats = worker.run_once(10).await.expect("run");

        assert_eq!((stats.processed, stats.retries, stats.dead_lettered), (0, 2, 1));
        let dead = stores.dead_letters.list(true, 10).await.expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].error_class, "transient");
        assert!(dead[0].reason.contains("timed out"));
        assert_eq!(dead[0].envelope, event);
        assert!(stores.storage.read_raw(&event.event_id).await.expect("raw").is_none());
        let committed = stores
            .log
            .committed_offset(GROUP, event.topic(), &event.partition_key)
            .await
            .expect("offset");
        assert_eq!(committed, Some(1));
    }

    #[tokio::test]
    async fn transient_failure_that_recovers_is_not_dead_lettered() {
        let stores = sql_stores().await;
        stores.log.publish(&calendar("cal-1", "acme.com", "CTO")).await.expect("publish");

        let flaky = FlakyEmbedder { calls: AtomicU32::new(0) };
        let mut worker = worker(&stores, Arc::new(flaky), Duration::from_millis(20), fast_retry(3));
        let stats = worker.run_once(10).await.expect("run");

        assert_eq!((stats.processed, stats.retries, stats.dead_lettered), (1, 1, 0));
        assert_eq!(stores.dead_letters.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn permanent_failures_skip_retries() {
        let stores = sql_stores().await;
        stores.log.publish(&lead("agent-1", "acme.com", 4.2)).await.expect("publish");

        let mut worker = worker(
            &stores,
            Arc::new(HashingEmbedder::new(DIMENSION)),
            Duration::from_secs(1),
            fast_retry(5),
        );
        let stats = worker.run_once(10).await.expect("run");

        assert_eq!((stats.retries, stats.dead_lettered), (0, 1));
        let dead = stores.dead_letters.list(true, 10).await.expect("dead letters");
        assert_eq!(dead[0].error_class, "permanent");
        assert_eq!(dead[0].attempts, 1);
    }

    #[tokio::test]
    async fn wrong_dimension_vectors_are_dead_lettered_as_permanent() {
        let stores = sql_stores().await;
        stores.log.publish(&calendar("cal-1", "acme.com", "CTO")).await.expect("publish");

        let mut worker = worker(
            &stores,
            Arc::new(HashingEmbedder::new(DIMENSION * 2)),
            Duration::from_secs(1),
            fast_retry(3),
        );
        let stats = worker.run_once(10).await.expect("run");

        assert_eq!((stats.retries, stats.dead_lettered), (0, 1));
    }

    #[tokio::test]
    async fn falling_behind_retention_is_fatal() {
        let pool = crate::test_support::setup_pool().await;
        let log = SqlPartitionLog::new(pool.clone()).with_retention(RetentionPolicy {
            max_age: Duration::from_secs(3600),
            max_records: 1,
        });
        let first = calendar("cal-1", "acme.com", "CTO");
        for id in ["cal-1", "cal-2", "cal-3"] {
            log.publish(&calendar(id, "acme.com", "CTO")).await.expect("publish");
        }
        log.commit_offset(GROUP, first.topic(), &first.partition_key, 1, None)
            .await
            .expect("commit");
        log.enforce_retention(chrono::Utc::now()).await.expect("retention");

        let stores = Stores {
            log: Arc::new(log),
            storage: Arc::new(gtmlake_db::repositories::SqlStorage::new(pool.clone())),
            dead_letters: Arc::new(gtmlake_db::repositories::SqlDeadLetterSink::new(pool)),
        };
        let mut worker = worker(
            &stores,
            Arc::new(HashingEmbedder::new(DIMENSION)),
            Duration::from_secs(1),
            fast_retry(3),
        );

        let error = worker.run_once(10).await.expect_err("out of range");
        assert!(error.requires_resync());
        assert!(matches!(error, WorkerError::Log(LogError::OffsetOutOfRange { .. })));
        assert_eq!(
            error.into_application(GROUP).error_class(),
            "offset_out_of_range"
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_releases_leases() {
        let stores = sql_stores().await;
        let event = calendar("cal-1", "acme.com", "CTO");
        stores.log.publish(&event).await.expect("publish");

        let worker = worker(
            &stores,
            Arc::new(HashingEmbedder::new(DIMENSION)),
            Duration::from_secs(1),
            fast_retry(3),
        );
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        for _ in 0..100 {
            if stores.storage.get_catalog(&event.event_id).await.expect("catalog").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).expect("signal");
        let stats = handle.await.expect("join").expect("worker");

        assert_eq!(stats.processed, 1);
        let lease = stores
            .log
            .acquire_lease(GROUP, event.topic(), &event.partition_key, "worker-2", Duration::from_secs(30))
            .await
            .expect("lease");
        assert!(lease.is_some());
    }
}
