use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use gtmlake_core::domain::event::{Envelope, EventId, PartitionKey};
use gtmlake_core::domain::query::{CatalogQuery, CatalogQueryResult};
use gtmlake_core::domain::record::{CatalogEntry, CatalogFields, RawPointer, SimilarityHit};
use gtmlake_core::processing::DeadLetterRecord;

pub mod dead_letter;
pub mod log;
pub mod memory;
pub mod storage;

pub use dead_letter::SqlDeadLetterSink;
pub use log::{RetentionPolicy, SqlPartitionLog};
pub use memory::{InMemoryDeadLetterSink, InMemoryStorage};
pub use storage::SqlStorage;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error(
        "offset {requested} on `{topic}/{partition_key}` is below the low watermark {low_watermark}"
    )]
    OffsetOutOfRange {
        topic: String,
        partition_key: PartitionKey,
        requested: u64,
        low_watermark: u64,
    },
    #[error("lease on `{topic}/{partition_key}` for group `{consumer_group}` is no longer held by `{owner_id}`")]
    LeaseLost {
        consumer_group: String,
        topic: String,
        partition_key: PartitionKey,
        owner_id: String,
    },
    #[error("envelope encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<sqlx::Error> for LogError {
    fn from(error: sqlx::Error) -> Self {
        Self::Repository(RepositoryError::Database(error))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no raw object for `{0}`; catalog and vector writes must follow the raw write")]
    RawNotFound(EventId),
    #[error("embedding for `{event_id}` has dimension {actual}, the index expects {expected}")]
    DimensionMismatch { event_id: EventId, expected: usize, actual: usize },
    #[error("storage operation `{0}` timed out")]
    Timeout(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        Self::Repository(RepositoryError::Database(error))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition_key: PartitionKey,
    pub offset: u64,
    /// The same event id and payload were already on the log; nothing was appended.
    pub duplicate: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition_key: PartitionKey,
    pub offset: u64,
    pub envelope: Envelope,
    pub appended_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition_key: PartitionKey,
    pub low_watermark: u64,
    pub next_offset: u64,
}

/// Exclusive claim of one partition by one worker within a consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionLease {
    pub consumer_group: String,
    pub topic: String,
    pub partition_key: PartitionKey,
    pub owner_id: String,
    /// Bumped whenever ownership moves to a different worker.
    pub epoch: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub removed_records: u64,
    pub partitions_advanced: u64,
}

/// Durable, partitioned, append-only event log with per-group committed offsets.
#[async_trait]
pub trait PartitionLog: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt, LogError>;

    /// Appends `envelope` even when the identical payload is already on the log.
    /// Used to replay dead letters.
    async fn republish(&self, envelope: &Envelope) -> Result<PublishReceipt, LogError>;

    async fn partitions(&self, topics: &[String]) -> Result<Vec<PartitionInfo>, LogError>;

    async fn fetch(
        &self,
        topic: &str,
        partition_key: &PartitionKey,
        from_offset: u64,
        max_records: u32,
    ) -> Result<Vec<LogRecord>, LogError>;

    async fn committed_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition_key: &PartitionKey,
    ) -> Result<Option<u64>, LogError>;

    /// Records `next_offset` as the next offset the group will read. Never moves
    /// backwards. When `lease` is given the commit only lands while it is still held.
    async fn commit_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition_key: &PartitionKey,
        next_offset: u64,
        lease: Option<&PartitionLease>,
    ) -> Result<(), LogError>;

    /// Acquires or renews a lease. `None` when another worker holds an unexpired lease.
    async fn acquire_lease(
        &self,
        consumer_group: &str,
        topic: &str,
        partition_key: &PartitionKey,
        owner_id: &str,
        duration: Duration,
    ) -> Result<Option<PartitionLease>, LogError>;

    async fn release_lease(&self, lease: &PartitionLease) -> Result<(), LogError>;

    async fn enforce_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport, LogError>;

    /// Moves every committed offset of `consumer_group` that fell behind retention up to
    /// the partition's low watermark. Returns the number of offsets touched.
    async fn reset_to_low_watermark(&self, consumer_group: &str) -> Result<u64, LogError>;
}

/// Raw, catalog, and vector layers. Catalog and vector writes require the raw write.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent for identical payloads and always returns the first pointer. A
    /// changed payload under the same event id is kept as a newer version.
    async fn write_raw(&self, envelope: &Envelope) -> Result<RawPointer, StorageError>;

    /// Newest stored version.
    async fn read_raw(&self, event_id: &EventId) -> Result<Option<Envelope>, StorageError>;

    /// Newest raw envelope per event id, ordered by event id, starting after `after`.
    async fn list_raw(
        &self,
        after: Option<&EventId>,
        limit: u32,
    ) -> Result<Vec<Envelope>, StorageError>;

    async fn upsert_catalog(
        &self,
        event_id: &EventId,
        fields: &CatalogFields,
    ) -> Result<(), StorageError>;

    async fn upsert_vector(&self, event_id: &EventId, embedding: &[f32])
        -> Result<(), StorageError>;

    async fn get_catalog(&self, event_id: &EventId) -> Result<Option<CatalogEntry>, StorageError>;

    async fn get_catalog_many(
        &self,
        event_ids: &[EventId],
    ) -> Result<Vec<CatalogEntry>, StorageError>;

    async fn query_catalog(&self, query: &CatalogQuery)
        -> Result<CatalogQueryResult, StorageError>;

    /// At most `top_k` hits, best first. Only events with a catalog entry are returned.
    async fn similarity_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SimilarityHit>, StorageError>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Stores `record` unless the same source offset was already dead-lettered.
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), RepositoryError>;

    async fn list(
        &self,
        pending_only: bool,
        limit: u32,
    ) -> Result<Vec<DeadLetterRecord>, RepositoryError>;

    async fn find(&self, id: &str) -> Result<Option<DeadLetterRecord>, RepositoryError>;

    async fn mark_replayed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, RepositoryError>;

    async fn pending_count(&self) -> Result<u64, RepositoryError>;
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("`{column}` value {value} exceeds i64")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}
