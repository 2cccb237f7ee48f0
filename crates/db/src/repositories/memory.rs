use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use gtmlake_core::catalog;
use gtmlake_core::domain::event::{Envelope, EventId};
use gtmlake_core::domain::query::{CatalogQuery, CatalogQueryResult};
use gtmlake_core::domain::record::{
    CatalogEntry, CatalogFields, RawPointer, SimilarityHit, VectorEntry,
};
use gtmlake_core::processing::DeadLetterRecord;
use gtmlake_core::similarity;

use super::{DeadLetterSink, RepositoryError, Storage, StorageError};

/// Stable pointer plus every distinct payload written under one event id, oldest first.
#[derive(Clone)]
struct RawObject {
    pointer: RawPointer,
    versions: Vec<(String, Envelope)>,
}

impl RawObject {
    fn latest(&self) -> Option<&Envelope> {
        self.versions.last().map(|(_, envelope)| envelope)
    }
}

/// Process-local storage layer. Writes to one event id are serialized by a per-key
/// lock; writes to different ids never wait on each other. A key's lock is dropped
/// once no writer holds it.
#[derive(Default)]
pub struct InMemoryStorage {
    raw: RwLock<BTreeMap<EventId, RawObject>>,
    catalog: RwLock<BTreeMap<EventId, CatalogEntry>>,
    vectors: RwLock<BTreeMap<EventId, VectorEntry>>,
    key_locks: Mutex<HashMap<EventId, Arc<Mutex<()>>>>,
    dimension: Option<usize>,
}

impl InMemoryStorage {
    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension: Some(dimension), ..Self::default() }
    }

    async fn key_lock(&self, event_id: &EventId) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(event_id.clone()).or_default().clone()
    }

    /// Clones are only handed out under the map lock, so a count of one means the map
    /// holds the last reference.
    async fn release_key_lock(&self, event_id: &EventId, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().await;
        drop(lock);
        if locks.get(event_id).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(event_id);
        }
    }

    async fn raw_pointer(&self, event_id: &EventId) -> Result<RawPointer, StorageError> {
        let raw = self.raw.read().await;
        match raw.get(event_id) {
            Some(object) => Ok(object.pointer.clone()),
            None => {
                tracing::error!(
                    event_name = "storage.raw_not_found",
                    severity = "critical",
                    event_id = %event_id,
                    "write attempted before raw object exists"
                );
                Err(StorageError::RawNotFound(event_id.clone()))
            }
        }
    }

    async fn store_raw(&self, envelope: &Envelope) -> RawPointer {
        let content_hash = envelope.content_hash();
        let mut raw = self.raw.write().await;
        let object = raw.entry(envelope.event_id.clone()).or_insert_with(|| RawObject {
            pointer: RawPointer::for_envelope(envelope),
            versions: Vec::new(),
        });
        if !object.versions.iter().any(|(hash, _)| *hash == content_hash) {
            object.versions.push((content_hash, envelope.clone()));
        }
        object.pointer.clone()
    }

    async fn merge_catalog(
        &self,
        event_id: &EventId,
        fields: &CatalogFields,
    ) -> Result<(), StorageError> {
        let raw_pointer = self.raw_pointer(event_id).await?;

        let mut catalog = self.catalog.write().await;
        match catalog.get_mut(event_id) {
            Some(entry) => {
                let mut merged = entry.fields.clone();
                for (key, value) in &fields.fields {
                    merged.insert(key.clone(), value.clone());
                }
                let changed = merged != entry.fields
                    || entry.event_type != fields.event_type
                    || entry.partition_key != fields.partition_key
                    || entry.occurred_at != fields.occurred_at;
                if changed {
                    entry.fields = merged;
                    entry.event_type = fields.event_type;
                    entry.partition_key = fields.partition_key.clone();
                    entry.occurred_at = fields.occurred_at;
                    entry.updated_at = Utc::now();
                }
            }
            None => {
                catalog.insert(
                    event_id.clone(),
                    CatalogEntry {
                        event_id: event_id.clone(),
                        event_type: fields.event_type,
                        partition_key: fields.partition_key.clone(),
                        occurred_at: fields.occurred_at,
                        fields: fields.fields.clone(),
                        raw_pointer,
                        updated_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn store_vector(&self, event_id: &EventId, embedding: &[f32]) -> Result<(), StorageError> {
        let source_pointer = self.raw_pointer(event_id).await?;

        let mut vectors = self.vectors.write().await;
        vectors.insert(
            event_id.clone(),
            VectorEntry { event_id: event_id.clone(), embedding: embedding.to_vec(), source_pointer },
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn write_raw(&self, envelope: &Envelope) -> Result<RawPointer, StorageError> {
        let lock = self.key_lock(&envelope.event_id).await;
        let pointer = {
            let _guard = lock.lock().await;
            self.store_raw(envelope).await
        };
        self.release_key_lock(&envelope.event_id, lock).await;
        Ok(pointer)
    }

    async fn read_raw(&self, event_id: &EventId) -> Result<Option<Envelope>, StorageError> {
        let raw = self.raw.read().await;
        Ok(raw.get(event_id).and_then(RawObject::latest).cloned())
    }

    async fn list_raw(
        &self,
        after: Option<&EventId>,
        limit: u32,
    ) -> Result<Vec<Envelope>, StorageError> {
        let raw = self.raw.read().await;
        Ok(raw
            .iter()
            .filter(|(event_id, _)| after.map_or(true, |after| *event_id > after))
            .filter_map(|(_, object)| object.latest().cloned())
            .take(limit as usize)
            .collect())
    }

    async fn upsert_catalog(
        &self,
        event_id: &EventId,
        fields: &CatalogFields,
    ) -> Result<(), StorageError> {
        let lock = self.key_lock(event_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.merge_catalog(event_id, fields).await
        };
        self.release_key_lock(event_id, lock).await;
        result
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
        let lock = self.key_lock(event_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.store_vector(event_id, embedding).await
        };
        self.release_key_lock(event_id, lock).await;
        result
    }

    async fn get_catalog(&self, event_id: &EventId) -> Result<Option<CatalogEntry>, StorageError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.get(event_id).cloned())
    }

    async fn get_catalog_many(
        &self,
        event_ids: &[EventId],
    ) -> Result<Vec<CatalogEntry>, StorageError> {
        let catalog = self.catalog.read().await;
        Ok(event_ids.iter().filter_map(|event_id| catalog.get(event_id).cloned()).collect())
    }

    async fn query_catalog(
        &self,
        query: &CatalogQuery,
    ) -> Result<CatalogQueryResult, StorageError> {
        let candidates: Vec<CatalogEntry> = self.catalog.read().await.values().cloned().collect();
        Ok(catalog::evaluate(candidates, query, Utc::now()))
    }

    async fn similarity_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SimilarityHit>, StorageError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let catalog = self.catalog.read().await;
        let vectors = self.vectors.read().await;
        let candidates = vectors
            .values()
            .filter(|entry| catalog.contains_key(&entry.event_id))
            .map(|entry| (entry.event_id.clone(), entry.embedding.clone()));
        Ok(similarity::top_k(query_vector, candidates, top_k))
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    records: RwLock<Vec<DeadLetterRecord>>,
}

#[async_trait::async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let duplicate = records.iter().any(|existing| {
            existing.consumer_group == record.consumer_group
                && existing.topic == record.topic
                && existing.partition_key == record.partition_key
                && existing.offset == record.offset
        });
        if !duplicate {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn list(
        &self,
        pending_only: bool,
        limit: u32,
    ) -> Result<Vec<DeadLetterRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| !pending_only || record.replayed_at.is_none())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find(&self, id: &str) -> Result<Option<DeadLetterRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|record| record.id == id).cloned())
    }

    async fn mark_replayed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|record| record.id == id && record.replayed_at.is_none()) {
            Some(record) => {
                record.replayed_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self) -> Result<u64, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|record| record.replayed_at.is_none()).count() as u64)
    }
}
