//! Validation and normalization of raw ingestion payloads into [`Envelope`]s.
//!
//! The canonicalizer is pure: it never publishes. Required fields are checked per
//! event type, timestamps are normalized to UTC, and unknown fields are carried
//! through untouched in each payload's extension map.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::event::{
    AgentType, Envelope, EventId, EventPayload, EventType, PartitionKey,
};
use crate::errors::ValidationError;

pub const DEFAULT_FALLBACK_PARTITIONS: u32 = 16;

#[derive(Clone, Debug)]
pub struct Canonicalizer {
    fallback_partitions: u32,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_PARTITIONS)
    }
}

struct Normalized {
    event_id: String,
    occurred_at: DateTime<Utc>,
    payload: EventPayload,
}

impl Canonicalizer {
    pub fn new(fallback_partitions: u32) -> Self {
        Self { fallback_partitions: fallback_partitions.max(1) }
    }

    pub fn normalize(
        &self,
        raw_payload: &Value,
        declared_type: EventType,
    ) -> Result<Envelope, ValidationError> {
        self.normalize_at(raw_payload, declared_type, Utc::now())
    }

    /// Same as [`Canonicalizer::normalize`] with an explicit `ingested_at`.
    pub fn normalize_at(
        &self,
        raw_payload: &Value,
        declared_type: EventType,
        ingested_at: DateTime<Utc>,
    ) -> Result<Envelope, ValidationError> {
        let mut object = raw_payload
            .as_object()
            .cloned()
            .ok_or_else(|| ValidationError::new("payload", "must be a JSON object"))?;

        let normalized = match declared_type {
            EventType::CalendarEvent => normalize_calendar(&mut object)?,
            EventType::AgentData => normalize_agent(&mut object)?,
            EventType::Conversation => normalize_conversation(&mut object)?,
            EventType::EmailThread => normalize_email_thread(&mut object)?,
            EventType::ProductUsage => normalize_product_usage(&mut object)?,
        };

        if normalized.event_id.contains('/') || normalized.event_id.chars().any(char::is_whitespace)
        {
            return Err(ValidationError::new(
                "event_id",
                "must not contain whitespace or path separators",
            ));
        }

        let partition_key = match normalized.payload.company_domain() {
            Some(domain) => PartitionKey(domain.to_ascii_lowercase()),
            None => self.fallback_partition(&normalized.event_id),
        };

        Ok(Envelope {
            event_id: EventId(normalized.event_id),
            event_type: declared_type,
            occurred_at: normalized.occurred_at,
            partition_key,
            payload: normalized.payload,
            ingested_at,
        })
    }

    /// Spreads domain-less events over a fixed set of buckets so they do not all
    /// land on one partition.
    pub fn fallback_partition(&self, event_id: &str) -> PartitionKey {
        let digest = Sha256::digest(event_id.as_bytes());
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(prefix) % u64::from(self.fallback_partitions);
        PartitionKey(format!("unkeyed-{bucket:02}"))
    }
}

fn normalize_calendar(object: &mut Map<String, Value>) -> Result<Normalized, ValidationError> {
    let event_id = require_str(object, "event_id")?;
    require_str(object, "title")?;
    require_str(object, "organizer")?;
    let start_time = require_timestamp(object, "start_time")?;
    let end_time = require_timestamp(object, "end_time")?;
    if start_time >= end_time {
        return Err(ValidationError::new("end_time", "must be after start_time"));
    }
    for field in ["description", "opportunity_id", "meeting_type"] {
        optional_str(object, field)?;
    }
    lowercase_domain(object, "company_domain")?;

    let attendees = object
        .get("attendees")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("attendees", "must be a list"))?;
    if attendees.is_empty() {
        return Err(ValidationError::new("attendees", "must not be empty"));
    }
    for (index, attendee) in attendees.iter().enumerate() {
        let attendee = attendee
            .as_object()
            .ok_or_else(|| ValidationError::new(format!("attendees[{index}]"), "must be an object"))?;
        require_str(attendee, "email")
            .map_err(|error| nested(&format!("attendees[{index}]"), error))?;
    }

    let payload = decode(object, "calendar_event")?;
    Ok(Normalized { event_id, occurred_at: start_time, payload: EventPayload::CalendarEvent(payload) })
}

fn normalize_agent(object: &mut Map<String, Value>) -> Result<Normalized, ValidationError> {
    let agent_id = require_str(object, "agent_id")?;
    let agent_type_raw = require_str(object, "agent_type")?;
    let agent_type = AgentType::parse(&agent_type_raw).ok_or_else(|| {
        ValidationError::new("agent_type", format!("unknown agent type `{agent_type_raw}`"))
    })?;
    object.insert("agent_type".to_string(), Value::String(agent_type.as_str().to_string()));
    let timestamp = require_timestamp(object, "timestamp")?;

    let data = object
        .get_mut("data")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ValidationError::new("data", "must be an object"))?;
    require_str(data, "domain").map_err(|error| nested("data", error))?;
    lowercase_domain(data, "domain").map_err(|error| nested("data", error))?;

    if let Some(metadata) = object.get("metadata") {
        if !metadata.is_null() && !metadata.is_object() {
            return Err(ValidationError::new("metadata", "must be an object"));
        }
    }

    let event_id = match optional_str(object, "event_id")? {
        Some(event_id) => event_id,
        None => {
            let digest = Sha256::digest(
                format!("{agent_id}|{}|{}", agent_type.as_str(), timestamp.to_rfc3339())
                    .as_bytes(),
            );
            let derived = format!("agent-{}", &format!("{digest:x}")[..16]);
            object.insert("event_id".to_string(), Value::String(derived.clone()));
            derived
        }
    };

    let payload = decode(object, "agent_data")?;
    Ok(Normalized { event_id, occurred_at: timestamp, payload: EventPayload::AgentData(payload) })
}

fn normalize_conversation(object: &mut Map<String, Value>) -> Result<Normalized, ValidationError> {
    let event_id = require_str(object, "conversation_id")?;
    let timestamp = require_timestamp(object, "timestamp")?;
    require_str(object, "raw_transcript")?;
    optional_str(object, "opportunity_id")?;
    lowercase_domain(object, "company_domain")?;
    if let Some(participants) = object.get("participants") {
        if !participants.is_null() && !participants.is_array() {
            return Err(ValidationError::new("participants", "must be a list"));
        }
    }

    let payload = decode(object, "conversation")?;
    Ok(Normalized { event_id, occurred_at: timestamp, payload: EventPayload::Conversation(payload) })
}

fn normalize_email_thread(object: &mut Map<String, Value>) -> Result<Normalized, ValidationError> {
    let event_id = require_str(object, "thread_id")?;
    optional_str(object, "opportunity_id")?;
    lowercase_domain(object, "company_domain")?;

    let emails = object
        .get_mut("emails")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ValidationError::new("emails", "must be a list"))?;
    if emails.is_empty() {
        return Err(ValidationError::new("emails", "must not be empty"));
    }

    let mut earliest: Option<DateTime<Utc>> = None;
    for (index, email) in emails.iter_mut().enumerate() {
        let path = format!("emails[{index}]");
        let email = email
            .as_object_mut()
            .ok_or_else(|| ValidationError::new(path.clone(), "must be an object"))?;
        let sent_at = require_timestamp(email, "timestamp").map_err(|error| nested(&path, error))?;
        require_str(email, "body_text").map_err(|error| nested(&path, error))?;
        earliest = Some(earliest.map_or(sent_at, |current| current.min(sent_at)));
    }
    let occurred_at = earliest.ok_or_else(|| ValidationError::new("emails", "must not be empty"))?;

    let payload = decode(object, "email_thread")?;
    Ok(Normalized { event_id, occurred_at, payload: EventPayload::EmailThread(payload) })
}

fn normalize_product_usage(object: &mut Map<String, Value>) -> Result<Normalized, ValidationError> {
    require_str(object, "user_id")?;
    let event_id = require_str(object, "session_id")?;
    let timestamp = require_timestamp(object, "timestamp")?;
    optional_str(object, "session_summary")?;
    lowercase_domain(object, "company_domain")?;
    if let Some(events) = object.get("events") {
        if !events.is_null() && !events.is_array() {
            return Err(ValidationError::new("events", "must be a list"));
        }
    }

    let payload = decode(object, "product_usage")?;
    Ok(Normalized { event_id, occurred_at: timestamp, payload: EventPayload::ProductUsage(payload) })
}

fn require_str(object: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::missing(field)),
        Some(Value::String(value)) if value.trim().is_empty() => {
            Err(ValidationError::new(field, "must not be blank"))
        }
        Some(Value::String(value)) => Ok(value.trim().to_string()),
        Some(_) => Err(ValidationError::new(field, "must be a string")),
    }
}

fn optional_str(object: &Map<String, Value>, field: &str) -> Result<Option<String>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.trim().to_string())),
        Some(_) => Err(ValidationError::new(field, "must be a string")),
    }
}

fn lowercase_domain(object: &mut Map<String, Value>, field: &str) -> Result<(), ValidationError> {
    match optional_str(object, field)? {
        Some(domain) => {
            object.insert(field.to_string(), Value::String(domain.to_ascii_lowercase()));
        }
        None => {
            object.remove(field);
        }
    }
    Ok(())
}

/// Parses the timestamp at `field` and rewrites it in RFC 3339 UTC form.
fn require_timestamp(
    object: &mut Map<String, Value>,
    field: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    let raw = require_str(object, field)?;
    let parsed = parse_timestamp(&raw).ok_or_else(|| {
        ValidationError::new(field, format!("`{raw}` is not an ISO-8601 timestamp"))
    })?;
    object.insert(field.to_string(), Value::String(parsed.to_rfc3339()));
    Ok(parsed)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn decode<T: DeserializeOwned>(
    object: &Map<String, Value>,
    event_type: &str,
) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(object.clone()))
        .map_err(|error| ValidationError::new(event_type, error.to_string()))
}

fn nested(prefix: &str, error: ValidationError) -> ValidationError {
    ValidationError { field: format!("{prefix}.{}", error.field), reason: error.reason }
}
