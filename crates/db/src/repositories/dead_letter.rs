use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use gtmlake_core::domain::event::{EventId, PartitionKey};
use gtmlake_core::processing::DeadLetterRecord;

use super::{
    decode_json, format_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32,
    parse_u64, to_i64, DeadLetterSink, RepositoryError,
};
use crate::DbPool;

pub struct SqlDeadLetterSink {
    pool: DbPool,
}

impl SqlDeadLetterSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for SqlDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), RepositoryError> {
        let envelope_json = serde_json::to_string(&record.envelope)
            .map_err(|error| RepositoryError::Decode(format!("envelope encoding: {error}")))?;

        sqlx::query(
            "INSERT INTO dead_letter (
                id, event_id, consumer_group, topic, partition_key, log_offset,
                envelope_json, error_class, reason, attempts, failed_at, replayed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(consumer_group, topic, partition_key, log_offset) DO NOTHING",
        )
        .bind(&record.id)
        .bind(&record.event_id.0)
        .bind(&record.consumer_group)
        .bind(&record.topic)
        .bind(&record.partition_key.0)
        .bind(to_i64("log_offset", record.offset)?)
        .bind(envelope_json)
        .bind(&record.error_class)
        .bind(&record.reason)
        .bind(i64::from(record.attempts))
        .bind(format_timestamp(record.failed_at))
        .bind(record.replayed_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(
        &self,
        pending_only: bool,
        limit: u32,
    ) -> Result<Vec<DeadLetterRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, event_id, consumer_group, topic, partition_key, log_offset,
                    envelope_json, error_class, reason, attempts, failed_at, replayed_at
             FROM dead_letter
             WHERE (? = 0 OR replayed_at IS NULL)
             ORDER BY failed_at ASC, id ASC
             LIMIT ?",
        )
        .bind(i64::from(pending_only))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(dead_letter_from_row).collect()
    }

    async fn find(&self, id: &str) -> Result<Option<DeadLetterRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, event_id, consumer_group, topic, partition_key, log_offset,
                    envelope_json, error_class, reason, attempts, failed_at, replayed_at
             FROM dead_letter
             WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(dead_letter_from_row).transpose()
    }

    async fn mark_replayed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE dead_letter SET replayed_at = ? WHERE id = ? AND replayed_at IS NULL",
        )
        .bind(format_timestamp(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_count(&self) -> Result<u64, RepositoryError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM dead_letter WHERE replayed_at IS NULL")
                .fetch_one(&self.pool)
                .await?
                .try_get("count")?;
        parse_u64("count", count)
    }
}

fn dead_letter_from_row(row: SqliteRow) -> Result<DeadLetterRecord, RepositoryError> {
    let envelope_json = row.try_get::<String, _>("envelope_json")?;

    Ok(DeadLetterRecord {
        id: row.try_get("id")?,
        event_id: EventId(row.try_get("event_id")?),
        consumer_group: row.try_get("consumer_group")?,
        topic: row.try_get("topic")?,
        partition_key: PartitionKey(row.try_get("partition_key")?),
        offset: parse_u64("log_offset", row.try_get("log_offset")?)?,
        envelope: decode_json("envelope_json", &envelope_json)?,
        error_class: row.try_get("error_class")?,
        reason: row.try_get("reason")?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        failed_at: parse_timestamp("failed_at", row.try_get("failed_at")?)?,
        replayed_at: parse_optional_timestamp("replayed_at", row.try_get("replayed_at")?)?,
    })
}
