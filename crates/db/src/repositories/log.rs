use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use gtmlake_core::config::LogConfig;
use gtmlake_core::domain::event::{Envelope, PartitionKey};

use super::{
    decode_json, format_timestamp, parse_timestamp, parse_u64, to_i64, LogError, LogRecord,
    PartitionInfo, PartitionLease, PartitionLog, PublishReceipt, RepositoryError,
    RetentionReport,
};
use crate::DbPool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    /// Newest records kept per partition.
    pub max_records: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age: Duration::from_secs(168 * 3600), max_records: 100_000 }
    }
}

impl From<&LogConfig> for RetentionPolicy {
    fn from(config: &LogConfig) -> Self {
        Self {
            max_age: Duration::from_secs(config.retention_hours.saturating_mul(3600)),
            max_records: config.retention_max_records,
        }
    }
}

pub struct SqlPartitionLog {
    pool: DbPool,
    retention: RetentionPolicy,
}

impl SqlPartitionLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, retention: RetentionPolicy::default() }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

// Claims the event id for this payload. No row back means the exact same payload is
// already on the log.
const CLAIM_IF_CHANGED: &str =
    "INSERT INTO log_event_index (topic, event_id, payload_hash, partition_key, log_offset)
     VALUES (?, ?, ?, ?, -1)
     ON CONFLICT(topic, event_id) DO UPDATE SET
        payload_hash = excluded.payload_hash,
        partition_key = excluded.partition_key
     WHERE log_event_index.payload_hash <> excluded.payload_hash
     RETURNING event_id";

const CLAIM_ALWAYS: &str =
    "INSERT INTO log_event_index (topic, event_id, payload_hash, partition_key, log_offset)
     VALUES (?, ?, ?, ?, -1)
     ON CONFLICT(topic, event_id) DO UPDATE SET
        payload_hash = excluded.payload_hash,
        partition_key = excluded.partition_key
     RETURNING event_id";

impl SqlPartitionLog {
    async fn append(&self, envelope: &Envelope, force: bool) -> Result<PublishReceipt, LogError> {
        let topic = envelope.topic();
        let payload_hash = envelope.content_hash();
        let envelope_json =
            serde_json::to_string(envelope).map_err(|error| LogError::Encode(error.to_string()))?;
        let now = format_timestamp(Utc::now());

        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(if force { CLAIM_ALWAYS } else { CLAIM_IF_CHANGED })
            .bind(topic)
            .bind(&envelope.event_id.0)
            .bind(&payload_hash)
            .bind(&envelope.partition_key.0)
            .fetch_optional(&mut *tx)
            .await?;

        if claimed.is_none() {
            let existing = sqlx::query(
                "SELECT partition_key, log_offset FROM log_event_index
                 WHERE topic = ? AND event_id = ?",
            )
            .bind(topic)
            .bind(&envelope.event_id.0)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            return Ok(PublishReceipt {
                topic: topic.to_string(),
                partition_key: PartitionKey(existing.try_get("partition_key")?),
                offset: parse_u64("log_offset", existing.try_get("log_offset")?)?,
                duplicate: true,
            });
        }

        let assigned = sqlx::query(
            "INSERT INTO log_partition (topic, partition_key, next_offset, low_watermark, created_at)
             VALUES (?, ?, 1, 0, ?)
             ON CONFLICT(topic, partition_key) DO UPDATE SET
                next_offset = log_partition.next_offset + 1
             RETURNING next_offset - 1 AS assigned_offset",
        )
        .bind(topic)
        .bind(&envelope.partition_key.0)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;
        let offset: i64 = assigned.try_get("assigned_offset")?;

        sqlx::query(
            "INSERT INTO log_record
                (topic, partition_key, log_offset, event_id, payload_hash, envelope_json, appended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(&envelope.partition_key.0)
        .bind(offset)
        .bind(&envelope.event_id.0)
        .bind(&payload_hash)
        .bind(&envelope_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE log_event_index SET log_offset = ? WHERE topic = ? AND event_id = ?")
            .bind(offset)
            .bind(topic)
            .bind(&envelope.event_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PublishReceipt {
            topic: topic.to_string(),
            partition_key: envelope.partition_key.clone(),
            offset: parse_u64("log_offset", offset)?,
            duplicate: false,
        })
    }
}

#[async_trait]
impl PartitionLog for SqlPartitionLog {
    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt, LogError> {
        self.append(envelope, false).await
    }

    async fn republish(&self, envelope: &Envelope) -> Result<PublishReceipt, LogError> {
        self.append(envelope, true).await
    }

    async fn partitions(&self, topics: &[String]) -> Result<Vec<PartitionInfo>, LogError> {
        let rows = sqlx::query(
            "SELECT topic, partition_key, low_watermark, next_offset
             FROM log_partition
             ORDER BY topic ASC, partition_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut partitions = Vec::new();
        for row in rows {
            let partition = partition_from_row(row)?;
            if topics.is_empty() || topics.iter().any(|topic| topic == &partition.topic) {
                partitions.push(partition);
            }
        }
        Ok(partitions)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition_key: &PartitionKey,
        from_offset: u64,
        max_records: u32,
    ) -> Result<Vec<LogRecord>, LogError> {
        let partition = sqlx::query(
            "SELECT topic, partition_key, low_watermark, next_offset
             FROM log_partition
             WHERE topic = ? AND partition_key = ?",
        )
        .bind(topic)
        .bind(&partition_key.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(partition) = partition.map(partition_from_row).transpose()? else {
            return Ok(Vec::new());
        };
        let out_of_range = |low_watermark: u64| LogError::OffsetOutOfRange {
            topic: topic.to_string(),
            partition_key: partition_key.clone(),
            requested: from_offset,
            low_watermark,
        };
        if from_offset < partition.low_watermark {
            return Err(out_of_range(partition.low_watermark));
        }
        if from_offset >= partition.next_offset || max_records == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT topic, partition_key, log_offset, envelope_json, appended_at
             FROM log_record
             WHERE topic = ? AND partition_key = ? AND log_offset >= ?
             ORDER BY log_offset ASC
             LIMIT ?",
        )
        .bind(topic)
        .bind(&partition_key.0)
        .bind(to_i64("log_offset", from_offset)?)
        .bind(i64::from(max_records))
        .fetch_all(&self.pool)
        .await?;

        let records =
            rows.into_iter().map(record_from_row).collect::<Result<Vec<_>, RepositoryError>>()?;

        // Offsets are dense, so a gap means retention ran between the two reads.
        match records.first() {
            Some(first) if first.offset != from_offset => Err(out_of_range(first.offset)),
            None => Err(out_of_range(partition.next_offset)),
            _ => Ok(records),
        }
    }

    async fn committed_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition_key: &PartitionKey,
    ) -> Result<Option<u64>, LogError> {
        let row = sqlx::query(
            "SELECT next_offset FROM consumer_offset
             WHERE consumer_group = ? AND topic = ? AND partition_key = ?",
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(&partition_key.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(parse_u64("next_offset", row.try_get("next_offset")?)?)),
            None => Ok(None),
        }
    }

    async fn commit_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition_key: &PartitionKey,
        next_offset: u64,
        lease: Option<&PartitionLease>,
    ) -> Result<(), LogError> {
        let next_offset = to_i64("next_offset", next_offset)?;
        let now = format_timestamp(Utc::now());

        let Some(lease) = lease else {
            sqlx::query(
                "INSERT INTO consumer_offset (consumer_group, topic, partition_key, next_offset, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(consumer_group, topic, partition_key) DO UPDATE SET
                    next_offset = MAX(consumer_offset.next_offset, excluded.next_offset),
                    updated_at = excluded.updated_at",
            )
            .bind(consumer_group)
            .bind(topic)
            .bind(&partition_key.0)
            .bind(next_offset)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            return Ok(());
        };

        let result = sqlx::query(
            "INSERT INTO consumer_offset (consumer_group, topic, partition_key, next_offset, updated_at)
             SELECT ?, ?, ?, ?, ?
             WHERE EXISTS (
                SELECT 1 FROM partition_lease
                WHERE consumer_group = ? AND topic = ? AND partition_key = ?
                  AND owner_id = ? AND epoch = ?
             )
             ON CONFLICT(consumer_group, topic, partition_key) DO UPDATE SET
                next_offset = MAX(consumer_offset.next_offset, excluded.next_offset),
                updated_at = excluded.updated_at",
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(&partition_key.0)
        .bind(next_offset)
        .bind(&now)
        .bind(consumer_group)
        .bind(topic)
        .bind(&partition_key.0)
        .bind(&lease.owner_id)
        .bind(to_i64("epoch", lease.epoch)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LogError::LeaseLost {
                consumer_group: consumer_group.to_string(),
                topic: topic.to_string(),
                partition_key: partition_key.clone(),
                owner_id: lease.owner_id.clone(),
            });
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        consumer_group: &str,
        topic: &str,
        partition_key: &PartitionKey,
        owner_id: &str,
        duration: Duration,
    ) -> Result<Option<PartitionLease>, LogError> {
        let now_ms = Utc::now().timestamp_millis();
        let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms.saturating_add(duration_ms);

        // Same owner renews in place; anyone else only wins an expired lease and
        // bumps the epoch, fencing commits from the previous holder.
        let row = sqlx::query(
            "INSERT INTO partition_lease
                (consumer_group, topic, partition_key, owner_id, epoch, expires_at_ms, acquired_at_ms)
             VALUES (?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(consumer_group, topic, partition_key) DO UPDATE SET
                epoch = CASE WHEN partition_lease.owner_id = excluded.owner_id
                             THEN partition_lease.epoch
                             ELSE partition_lease.epoch + 1 END,
                acquired_at_ms = CASE WHEN partition_lease.owner_id = excluded.owner_id
                                      THEN partition_lease.acquired_at_ms
                                      ELSE excluded.acquired_at_ms END,
                owner_id = excluded.owner_id,
                expires_at_ms = excluded.expires_at_ms
             WHERE partition_lease.owner_id = excluded.owner_id
                OR partition_lease.expires_at_ms <= excluded.acquired_at_ms
             RETURNING owner_id, epoch, expires_at_ms",
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(&partition_key.0)
        .bind(owner_id)
        .bind(expires_at_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at_ms: i64 = row.try_get("expires_at_ms")?;
        let expires_at = Utc.timestamp_millis_opt(expires_at_ms).single().ok_or_else(|| {
            RepositoryError::Decode(format!("invalid lease expiry `{expires_at_ms}`"))
        })?;

        Ok(Some(PartitionLease {
            consumer_group: consumer_group.to_string(),
            topic: topic.to_string(),
            partition_key: partition_key.clone(),
            owner_id: row.try_get("owner_id")?,
            epoch: parse_u64("epoch", row.try_get("epoch")?)?,
            expires_at,
        }))
    }

    async fn release_lease(&self, lease: &PartitionLease) -> Result<(), LogError> {
        sqlx::query(
            "UPDATE partition_lease SET expires_at_ms = 0
             WHERE consumer_group = ? AND topic = ? AND partition_key = ?
               AND owner_id = ? AND epoch = ?",
        )
        .bind(&lease.consumer_group)
        .bind(&lease.topic)
        .bind(&lease.partition_key.0)
        .bind(&lease.owner_id)
        .bind(to_i64("epoch", lease.epoch)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enforce_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport, LogError> {
        let max_age = chrono::Duration::from_std(self.retention.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = format_timestamp(now - max_age);
        let max_records = to_i64("max_records", self.retention.max_records)?;

        let mut tx = self.pool.begin().await?;

        let aged = sqlx::query("DELETE FROM log_record WHERE appended_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let overflow = sqlx::query(
            "DELETE FROM log_record
             WHERE log_offset < (
                SELECT p.next_offset - ? FROM log_partition p
                WHERE p.topic = log_record.topic AND p.partition_key = log_record.partition_key
             )",
        )
        .bind(max_records)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let advanced = sqlx::query(
            "UPDATE log_partition SET low_watermark = COALESCE(
                (SELECT MIN(r.log_offset) FROM log_record r
                 WHERE r.topic = log_partition.topic AND r.partition_key = log_partition.partition_key),
                next_offset)
             WHERE low_watermark <> COALESCE(
                (SELECT MIN(r.log_offset) FROM log_record r
                 WHERE r.topic = log_partition.topic AND r.partition_key = log_partition.partition_key),
                next_offset)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(RetentionReport { removed_records: aged + overflow, partitions_advanced: advanced })
    }

    async fn reset_to_low_watermark(&self, consumer_group: &str) -> Result<u64, LogError> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "INSERT INTO consumer_offset (consumer_group, topic, partition_key, next_offset, updated_at)
             SELECT ?, topic, partition_key, low_watermark, ? FROM log_partition WHERE true
             ON CONFLICT(consumer_group, topic, partition_key) DO UPDATE SET
                next_offset = excluded.next_offset,
                updated_at = excluded.updated_at
             WHERE consumer_offset.next_offset < excluded.next_offset",
        )
        .bind(consumer_group)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn partition_from_row(row: SqliteRow) -> Result<PartitionInfo, RepositoryError> {
    Ok(PartitionInfo {
        topic: row.try_get("topic")?,
        partition_key: PartitionKey(row.try_get("partition_key")?),
        low_watermark: parse_u64("low_watermark", row.try_get("low_watermark")?)?,
        next_offset: parse_u64("next_offset", row.try_get("next_offset")?)?,
    })
}

fn record_from_row(row: SqliteRow) -> Result<LogRecord, RepositoryError> {
    let envelope_json = row.try_get::<String, _>("envelope_json")?;
    Ok(LogRecord {
        topic: row.try_get("topic")?,
        partition_key: PartitionKey(row.try_get("partition_key")?),
        offset: parse_u64("log_offset", row.try_get("log_offset")?)?,
        envelope: decode_json("envelope_json", &envelope_json)?,
        appended_at: parse_timestamp("appended_at", row.try_get("appended_at")?)?,
    })
}
