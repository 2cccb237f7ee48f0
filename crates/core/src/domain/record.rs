use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::event::{Envelope, EventId, EventType, PartitionKey};

/// Location of an immutable raw blob, e.g. `bronze/calendar_events/2026/10/13/evt-1.json`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawPointer(pub String);

impl RawPointer {
    pub fn for_envelope(envelope: &Envelope) -> Self {
        let at = envelope.occurred_at;
        Self(format!(
            "bronze/{}/{:04}/{:02}/{:02}/{}.json",
            envelope.event_type.raw_segment(),
            at.year(),
            at.month(),
            at.day(),
            envelope.event_id.0
        ))
    }
}

impl fmt::Display for RawPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type FieldMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Email,
    Company,
    Opportunity,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
}

/// Output of a stream processor for one envelope. Owned by the processor until stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub envelope: Envelope,
    pub entities: Vec<Entity>,
    pub derived: FieldMap,
    pub embedding: Option<Vec<f32>>,
}

impl EnrichedRecord {
    pub fn event_id(&self) -> &EventId {
        &self.envelope.event_id
    }

    /// Flat projection written to the catalog.
    pub fn catalog_fields(&self) -> CatalogFields {
        let mut fields = crate::enrich::payload_fields(&self.envelope.payload);
        for (key, value) in &self.derived {
            fields.insert(key.clone(), value.clone());
        }
        if !self.entities.is_empty() {
            let entities = self
                .entities
                .iter()
                .map(|entity| {
                    serde_json::json!({ "kind": entity.kind, "value": entity.value })
                })
                .collect();
            fields.insert("entities".to_string(), Value::Array(entities));
        }

        CatalogFields {
            event_type: self.envelope.event_type,
            partition_key: self.envelope.partition_key.clone(),
            occurred_at: self.envelope.occurred_at,
            fields,
        }
    }
}

/// Catalog write request: everything but the identity and raw pointer, which the
/// storage layer owns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogFields {
    pub event_type: EventType,
    pub partition_key: PartitionKey,
    pub occurred_at: DateTime<Utc>,
    pub fields: FieldMap,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub event_id: EventId,
    pub event_type: EventType,
    pub partition_key: PartitionKey,
    pub occurred_at: DateTime<Utc>,
    pub fields: FieldMap,
    pub raw_pointer: RawPointer,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    /// Resolves a field by name, checking the fixed columns before the flat field map.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "event_id" => Some(Value::String(self.event_id.0.clone())),
            "event_type" => Some(Value::String(self.event_type.as_str().to_string())),
            "partition_key" => Some(Value::String(self.partition_key.0.clone())),
            "occurred_at" => Some(Value::String(self.occurred_at.to_rfc3339())),
            "raw_pointer" => Some(Value::String(self.raw_pointer.0.clone())),
            other => self.fields.get(other).cloned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub event_id: EventId,
    pub embedding: Vec<f32>,
    pub source_pointer: RawPointer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarityHit {
    pub event_id: EventId,
    pub score: f32,
}
