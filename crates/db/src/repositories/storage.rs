use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::{debug, error};

use gtmlake_core::catalog;
use gtmlake_core::domain::event::{Envelope, EventId, EventType, PartitionKey};
use gtmlake_core::domain::query::{CatalogQuery, CatalogQueryResult, PredicateOp};
use gtmlake_core::domain::record::{
    CatalogEntry, CatalogFields, FieldMap, RawPointer, SimilarityHit,
};
use gtmlake_core::similarity;

use super::{
    decode_json, format_timestamp, parse_timestamp, RepositoryError, Storage, StorageError,
};
use crate::DbPool;

/// SQLite-backed storage layer. Each upsert is a single statement, so concurrent
/// writers to one key serialize on the row and never observe a partial entry.
pub struct SqlStorage {
    pool: DbPool,
    dimension: Option<usize>,
}

impl SqlStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, dimension: None }
    }

    /// Rejects vectors whose length differs from `dimension`.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    async fn raw_exists(&self, event_id: &EventId) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 AS present FROM raw_object WHERE event_id = ?")
            .bind(&event_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    fn missing_raw(&self, event_id: &EventId, operation: &str) -> StorageError {
        error!(
            event_name = "storage.raw_not_found",
            severity = "critical",
            event_id = %event_id,
            operation,
            "write attempted before raw object exists"
        );
        StorageError::RawNotFound(event_id.clone())
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn write_raw(&self, envelope: &Envelope) -> Result<RawPointer, StorageError> {
        let pointer = RawPointer::for_envelope(envelope);
        let content_hash = envelope.content_hash();
        let envelope_json = serde_json::to_string(envelope)
            .map_err(|error| StorageError::Encode(error.to_string()))?;
        let written_at = format_timestamp(Utc::now());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO raw_object (event_id, event_type, raw_pointer, content_hash, envelope_json, written_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(&envelope.event_id.0)
        .bind(envelope.event_type.as_str())
        .bind(&pointer.0)
        .bind(&content_hash)
        .bind(&envelope_json)
        .bind(&written_at)
        .execute(&mut *tx)
        .await?;

        // Identical payloads are no-ops; a changed payload becomes the newest version.
        let appended = sqlx::query(
            "INSERT INTO raw_object_version (event_id, content_hash, version, envelope_json, written_at)
             SELECT ?, ?, COALESCE(MAX(version), 0) + 1, ?, ?
             FROM raw_object_version
             WHERE event_id = ?
             ON CONFLICT(event_id, content_hash) DO NOTHING",
        )
        .bind(&envelope.event_id.0)
        .bind(&content_hash)
        .bind(&envelope_json)
        .bind(&written_at)
        .bind(&envelope.event_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let stored: String = sqlx::query("SELECT raw_pointer FROM raw_object WHERE event_id = ?")
            .bind(&envelope.event_id.0)
            .fetch_one(&mut *tx)
            .await?
            .try_get("raw_pointer")?;
        tx.commit().await?;

        if appended > 0 {
            debug!(
                event_name = "storage.raw.version_written",
                event_id = %envelope.event_id,
                content_hash = %content_hash,
                "raw object version stored"
            );
        }
        Ok(RawPointer(stored))
    }

    async fn read_raw(&self, event_id: &EventId) -> Result<Option<Envelope>, StorageError> {
        let row = sqlx::query(
            "SELECT envelope_json FROM raw_object_version
             WHERE event_id = ?
             ORDER BY version DESC
             LIMIT 1",
        )
        .bind(&event_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("envelope_json")?;
                Ok(Some(decode_json("envelope_json", &json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_raw(
        &self,
        after: Option<&EventId>,
        limit: u32,
    ) -> Result<Vec<Envelope>, StorageError> {
        let rows = sqlx::query(
            "SELECT v.envelope_json FROM raw_object_version v
             WHERE v.event_id > ?
               AND v.version = (
                   SELECT MAX(latest.version) FROM raw_object_version latest
                   WHERE latest.event_id = v.event_id
               )
             ORDER BY v.event_id ASC
             LIMIT ?",
        )
        .bind(after.map(|id| id.0.as_str()).unwrap_or(""))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get("envelope_json")?;
            envelopes.push(decode_json("envelope_json", &json)?);
        }
        Ok(envelopes)
    }

    async fn upsert_catalog(
        &self,
        event_id: &EventId,
        fields: &CatalogFields,
    ) -> Result<(), StorageError> {
        let fields_json = serde_json::to_string(&fields.fields)
            .map_err(|error| StorageError::Encode(error.to_string()))?;

        // Fields merge key by key, later writes win. Unchanged rows are left alone so
        // repeated upserts converge on the same entry.
        let result = sqlx::query(
            "INSERT INTO catalog_entry
                (event_id, event_type, partition_key, occurred_at, fields_json, raw_pointer, updated_at)
             SELECT ?, ?, ?, ?, json(?), raw.raw_pointer, ?
             FROM raw_object raw
             WHERE raw.event_id = ?
             ON CONFLICT(event_id) DO UPDATE SET
                event_type = excluded.event_type,
                partition_key = excluded.partition_key,
                occurred_at = excluded.occurred_at,
                fields_json = json_patch(catalog_entry.fields_json, excluded.fields_json),
                updated_at = excluded.updated_at
             WHERE catalog_entry.event_type <> excluded.event_type
                OR catalog_entry.partition_key <> excluded.partition_key
                OR catalog_entry.occurred_at <> excluded.occurred_at
                OR json_patch(catalog_entry.fields_json, excluded.fields_json)
                   <> json(catalog_entry.fields_json)",
        )
        .bind(&event_id.0)
        .bind(fields.event_type.as_str())
        .bind(&fields.partition_key.0)
        .bind(format_timestamp(fields.occurred_at))
        .bind(&fields_json)
        .bind(format_timestamp(Utc::now()))
        .bind(&event_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.raw_exists(event_id).await? {
            return Err(self.missing_raw(event_id, "upsert_catalog"));
        }
        Ok(())
    }

    async fn upsert_vector(
        &self,
        event_id: &EventId,
        embedding: &[f32],
    ) -> Result<(), StorageError> {
        if let Some(expected) = self.dimension {
            if embedding.len() != expected {
                return Err(StorageError::DimensionMismatch {
                    event_id: event_id.clone(),
                    expected,
                    actual: embedding.len(),
                });
            }
        }
        let dimension = i64::try_from(embedding.len())
            .map_err(|_| StorageError::Encode("embedding too long".to_string()))?;

        let result = sqlx::query(
            "INSERT INTO vector_entry (event_id, dimension, embedding, source_pointer, updated_at)
             SELECT ?, ?, ?, raw.raw_pointer, ?
             FROM raw_object raw
             WHERE raw.event_id = ?
             ON CONFLICT(event_id) DO UPDATE SET
                dimension = excluded.dimension,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
             WHERE vector_entry.embedding <> excluded.embedding",
        )
        .bind(&event_id.0)
        .bind(dimension)
        .bind(encode_embedding(embedding))
        .bind(format_timestamp(Utc::now()))
        .bind(&event_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.raw_exists(event_id).await? {
            return Err(self.missing_raw(event_id, "upsert_vector"));
        }
        Ok(())
    }

    async fn get_catalog(&self, event_id: &EventId) -> Result<Option<CatalogEntry>, StorageError> {
        let row = sqlx::query(
            "SELECT event_id, event_type, partition_key, occurred_at, fields_json, raw_pointer, updated_at
             FROM catalog_entry
             WHERE event_id = ?",
        )
        .bind(&event_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(catalog_from_row).transpose()?)
    }

    async fn get_catalog_many(
        &self,
        event_ids: &[EventId],
    ) -> Result<Vec<CatalogEntry>, StorageError> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        let sql = format!(
            "SELECT event_id, event_type, partition_key, occurred_at, fields_json, raw_pointer, updated_at
             FROM catalog_entry
             WHERE event_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for event_id in event_ids {
            query = query.bind(&event_id.0);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(catalog_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn query_catalog(
        &self,
        query: &CatalogQuery,
    ) -> Result<CatalogQueryResult, StorageError> {
        let now = Utc::now();
        let mut sql = String::from(
            "SELECT event_id, event_type, partition_key, occurred_at, fields_json, raw_pointer, updated_at
             FROM catalog_entry
             WHERE 1 = 1",
        );
        let mut binds: Vec<String> = Vec::new();

        // Narrow on indexed columns; every predicate is re-checked in memory.
        for predicate in &query.filters {
            match (predicate.field.as_str(), &predicate.op) {
                ("event_type", PredicateOp::Eq(value)) => {
                    if let Some(event_type) = value.as_str().and_then(EventType::parse) {
                        sql.push_str(" AND event_type = ?");
                        binds.push(event_type.as_str().to_string());
                    }
                }
                ("partition_key", PredicateOp::Eq(value)) => {
                    if let Some(key) = value.as_str() {
                        sql.push_str(" AND partition_key = ?");
                        binds.push(key.to_ascii_lowercase());
                    }
                }
                ("occurred_at", PredicateOp::Within(window)) => {
                    let (start, end) = window.bounds(now);
                    sql.push_str(" AND occurred_at >= ? AND occurred_at < ?");
                    binds.push(format_timestamp(start));
                    binds.push(format_timestamp(end));
                }
                _ => {}
            }
        }

        let mut statement = sqlx::query(&sql);
        for value in &binds {
            statement = statement.bind(value);
        }
        let rows = statement.fetch_all(&self.pool).await?;
        let candidates =
            rows.into_iter().map(catalog_from_row).collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok(catalog::evaluate(candidates, query, now))
    }

    async fn similarity_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SimilarityHit>, StorageError> {
        if top_k == 0 || query_vector.is_empty() {
            return Ok(Vec::new());
        }
        let dimension = i64::try_from(query_vector.len())
            .map_err(|_| StorageError::Encode("query vector too long".to_string()))?;

        let rows = sqlx::query(
            "SELECT v.event_id, v.embedding
             FROM vector_entry v
             JOIN catalog_entry c ON c.event_id = v.event_id
             WHERE v.dimension = ?",
        )
        .bind(dimension)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let event_id = EventId(row.try_get("event_id")?);
            let blob: Vec<u8> = row.try_get("embedding")?;
            candidates.push((event_id, decode_embedding(&blob)?));
        }
        Ok(similarity::top_k(query_vector, candidates, top_k))
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, RepositoryError> {
    if blob.len() % 4 != 0 {
        return Err(RepositoryError::Decode(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn catalog_from_row(row: SqliteRow) -> Result<CatalogEntry, RepositoryError> {
    let event_type_raw = row.try_get::<String, _>("event_type")?;
    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event type `{event_type_raw}`")))?;
    let fields_json = row.try_get::<String, _>("fields_json")?;
    let fields: FieldMap = decode_json("fields_json", &fields_json)?;

    Ok(CatalogEntry {
        event_id: EventId(row.try_get("event_id")?),
        event_type,
        partition_key: PartitionKey(row.try_get("partition_key")?),
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
        fields,
        raw_pointer: RawPointer(row.try_get("raw_pointer")?),
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use gtmlake_core::domain::event::{EventId, EventPayload};
    use gtmlake_core::domain::query::{
        Aggregation, CatalogQuery, CatalogQueryResult, Predicate, TimeWindow,
    };
    use gtmlake_core::domain::record::{CatalogFields, FieldMap};

    use super::{decode_embedding, encode_embedding, SqlStorage};
    use crate::repositories::{Storage, StorageError};
    use crate::test_support::{calendar_envelope, setup_pool};

    fn fields_for(envelope: &gtmlake_core::Envelope, fields: serde_json::Value) -> CatalogFields {
        let fields: FieldMap = serde_json::from_value(fields).expect("field map");
        CatalogFields {
            event_type: envelope.event_type,
            partition_key: envelope.partition_key.clone(),
            occurred_at: envelope.occurred_at,
            fields,
        }
    }

    #[tokio::test]
    async fn raw_write_is_idempotent() {
        let storage = SqlStorage::new(setup_pool().await);
        let envelope = calendar_envelope("cal-1", "acme.com");

        let first = storage.write_raw(&envelope).await.expect("write raw");
        let second = storage.write_raw(&envelope).await.expect("write raw again");

        assert_eq!(first, second);
        assert_eq!(first.0, "bronze/calendar_events/2026/10/13/cal-1.json");
        assert_eq!(storage.read_raw(&envelope.event_id).await.expect("read"), Some(envelope));
    }

    #[tokio::test]
    async fn changed_payload_becomes_the_newest_raw_version() {
        let pool = setup_pool().await;
        let storage = SqlStorage::new(pool.clone());
        let original = calendar_envelope("cal-1", "acme.com");
        let mut revised = original.clone();
        if let EventPayload::CalendarEvent(event) = &mut revised.payload {
            event.title = "Revised pricing review".to_string();
        }

        let first = storage.write_raw(&original).await.expect("write v1");
        let second = storage.write_raw(&revised).await.expect("write v2");
        storage.write_raw(&original).await.expect("rewrite v1");

        assert_eq!(first, second);
        assert_eq!(storage.read_raw(&original.event_id).await.expect("read"), Some(revised.clone()));
        assert_eq!(storage.list_raw(None, 10).await.expect("list"), vec![revised]);
        let (versions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM raw_object_version")
            .fetch_one(&pool)
            .await
            .expect("count versions");
        assert_eq!(versions, 2);
    }

    #[tokio::test]
    async fn catalog_upsert_without_raw_is_rejected() {
        let storage = SqlStorage::new(setup_pool().await);
        let envelope = calendar_envelope("cal-1", "acme.com");

        let error = storage
            .upsert_catalog(&envelope.event_id, &fields_for(&envelope, json!({"title": "x"})))
            .await
            .expect_err("raw missing");

        assert!(matches!(error, StorageError::RawNotFound(id) if id.0 == "cal-1"));
        assert_eq!(storage.get_catalog(&envelope.event_id).await.expect("read"), None);
    }

    #[tokio::test]
    async fn vector_upsert_without_raw_is_rejected() {
        let storage = SqlStorage::new(setup_pool().await);

        let error = storage
            .upsert_vector(&EventId("ghost".into()), &[0.1, 0.2])
            .await
            .expect_err("raw missing");

        assert!(matches!(error, StorageError::RawNotFound(_)));
    }

    #[tokio::test]
    async fn catalog_fields_merge_with_last_write_winning() {
        let storage = SqlStorage::new(setup_pool().await);
        let envelope = calendar_envelope("cal-1", "acme.com");
        storage.write_raw(&envelope).await.expect("write raw");

        storage
            .upsert_catalog(
                &envelope.event_id,
                &fields_for(&envelope, json!({"title": "Discovery", "attendee_count": 2})),
            )
            .await
            .expect("first upsert");
        storage
            .upsert_catalog(
                &envelope.event_id,
                &fields_for(&envelope, json!({"title": "Pricing", "meeting_type": "demo"})),
            )
            .await
            .expect("second upsert");

        let entry = storage.get_catalog(&envelope.event_id).await.expect("read").expect("entry");
        assert_eq!(entry.fields.get("title"), Some(&json!("Pricing")));
        assert_eq!(entry.fields.get("attendee_count"), Some(&json!(2)));
        assert_eq!(entry.fields.get("meeting_type"), Some(&json!("demo")));
        assert_eq!(entry.raw_pointer.0, "bronze/calendar_events/2026/10/13/cal-1.json");
    }

    #[tokio::test]
    async fn repeated_identical_upserts_leave_entry_unchanged() {
        let storage = SqlStorage::new(setup_pool().await);
        let envelope = calendar_envelope("cal-1", "acme.com");
        storage.write_raw(&envelope).await.expect("write raw");
        let fields = fields_for(&envelope, json!({"title": "Discovery", "score": 0.1}));

        storage.upsert_catalog(&envelope.event_id, &fields).await.expect("upsert");
        let first = storage.get_catalog(&envelope.event_id).await.expect("read").expect("entry");
        storage.upsert_catalog(&envelope.event_id, &fields).await.expect("upsert again");
        let second = storage.get_catalog(&envelope.event_id).await.expect("read").expect("entry");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn query_catalog_filters_by_type_and_window() {
        let storage = SqlStorage::new(setup_pool().await);
        for (id, domain) in [("cal-1", "acme.com"), ("cal-2", "globex.com")] {
            let envelope = calendar_envelope(id, domain);
            storage.write_raw(&envelope).await.expect("write raw");
            storage
                .upsert_catalog(
                    &envelope.event_id,
                    &fields_for(&envelope, json!({"company_domain": domain})),
                )
                .await
                .expect("upsert");
        }

        let query = CatalogQuery {
            filters: vec![
                Predicate::eq("event_type", "calendar_event"),
                Predicate::eq("company_domain", "ACME.com"),
                Predicate::within(
                    "occurred_at",
                    TimeWindow::Range {
                        start: Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap(),
                        end: Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap(),
                    },
                ),
            ],
            aggregation: None,
            limit: Some(10),
        };

        let CatalogQueryResult::Entries(entries) =
            storage.query_catalog(&query).await.expect("query")
        else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_id.0, "cal-1");

        let count = CatalogQuery {
            filters: vec![Predicate::eq("event_type", "calendar_event")],
            aggregation: Some(Aggregation::Count),
            limit: None,
        };
        let CatalogQueryResult::Aggregate(result) =
            storage.query_catalog(&count).await.expect("count")
        else {
            panic!("expected aggregate");
        };
        assert_eq!(result.groups[0].count, 2);
    }

    #[tokio::test]
    async fn similarity_search_is_bounded_and_needs_catalog_entries() {
        let storage = SqlStorage::new(setup_pool().await).with_dimension(2);
        let vectors = [("cal-1", [1.0_f32, 0.0]), ("cal-2", [0.6, 0.8]), ("cal-3", [0.0, 1.0])];
        for (id, vector) in vectors {
            let envelope = calendar_envelope(id, "acme.com");
            storage.write_raw(&envelope).await.expect("write raw");
            storage.upsert_vector(&envelope.event_id, &vector).await.expect("vector");
            if id != "cal-3" {
                storage
                    .upsert_catalog(&envelope.event_id, &fields_for(&envelope, json!({})))
                    .await
                    .expect("catalog");
            }
        }

        let hits = storage.similarity_search(&[0.0, 1.0], 5).await.expect("search");

        let ids: Vec<&str> = hits.iter().map(|hit| hit.event_id.0.as_str()).collect();
        assert_eq!(ids, vec!["cal-2", "cal-1"], "cal-3 has no catalog entry");
        assert!(hits[0].score >= hits[1].score);
        assert!(storage.similarity_search(&[0.0, 1.0], 0).await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn wrong_dimension_vectors_are_rejected() {
        let storage = SqlStorage::new(setup_pool().await).with_dimension(3);
        let envelope = calendar_envelope("cal-1", "acme.com");
        storage.write_raw(&envelope).await.expect("write raw");

        let error = storage
            .upsert_vector(&envelope.event_id, &[1.0, 0.0])
            .await
            .expect_err("dimension mismatch");

        assert!(matches!(error, StorageError::DimensionMismatch { expected: 3, actual: 2, .. }));
    }

    #[tokio::test]
    async fn list_raw_pages_by_event_id() {
        let storage = SqlStorage::new(setup_pool().await);
        for id in ["cal-3", "cal-1", "cal-2"] {
            storage.write_raw(&calendar_envelope(id, "acme.com")).await.expect("write raw");
        }

        let first = storage.list_raw(None, 2).await.expect("page");
        let next = storage.list_raw(Some(&first[1].event_id), 2).await.expect("page");

        let ids: Vec<&str> =
            first.iter().chain(next.iter()).map(|envelope| envelope.event_id.0.as_str()).collect();
        assert_eq!(ids, vec!["cal-1", "cal-2", "cal-3"]);
    }

    #[test]
    fn embedding_blobs_decode_to_original_values() {
        let vector = vec![0.25_f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&vector)).expect("decode"), vector);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }
}
