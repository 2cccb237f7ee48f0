//! Pure enrichment rules shared by the stream processors: catalog projection,
//! derived fields, entity extraction, embedding text, and semantic checks.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use crate::domain::event::{Envelope, EventPayload};
use crate::domain::record::{Entity, EntityKind, FieldMap};
use crate::errors::ProcessingError;

const MAX_MEETING_MINUTES: i64 = 24 * 60;
const TRANSCRIPT_EXCERPT_CHARS: usize = 280;

/// Flat, queryable view of the payload's own fields.
pub fn payload_fields(payload: &EventPayload) -> FieldMap {
    let mut fields = FieldMap::new();
    match payload {
        EventPayload::CalendarEvent(event) => {
            put(&mut fields, "title", Some(event.title.clone()));
            put(&mut fields, "description", event.description.clone());
            put(&mut fields, "start_time", Some(event.start_time.to_rfc3339()));
            put(&mut fields, "end_time", Some(event.end_time.to_rfc3339()));
            put(&mut fields, "organizer", Some(event.organizer.clone()));
            put(&mut fields, "opportunity_id", event.opportunity_id.clone());
            put(&mut fields, "company_domain", event.company_domain.clone());
            put(&mut fields, "meeting_type", event.meeting_type.clone());
            fields.insert(
                "attendees".to_string(),
                Value::Array(
                    event.attendees.iter().map(|a| Value::String(a.email.clone())).collect(),
                ),
            );
        }
        EventPayload::AgentData(agent) => {
            put(&mut fields, "agent_id", Some(agent.agent_id.clone()));
            put(&mut fields, "agent_type", Some(agent.agent_type.as_str().to_string()));
            put(&mut fields, "company_domain", Some(agent.data.domain.clone()));
            put(&mut fields, "geography", agent.data.geography.clone());
            put(&mut fields, "qualification_status", agent.data.qualification_status.clone());
            if let Some(size) = &agent.data.company_size {
                fields.insert("company_size".to_string(), size.clone());
            }
            if let Some(score) = agent.data.confidence_score {
                fields.insert("confidence_score".to_string(), json!(score));
            }
            if let Some(usage) = &agent.data.product_usage {
                if let Some(active_users) = usage.active_users {
                    fields.insert("active_users".to_string(), json!(active_users));
                }
                if let Some(score) = usage.engagement_score {
                    fields.insert("engagement_score".to_string(), json!(score));
                }
            }
            if let Some(metadata) = &agent.metadata {
                for key in ["source", "form_id"] {
                    if let Some(value) = metadata.get(key) {
                        fields.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
        EventPayload::Conversation(conversation) => {
            put(&mut fields, "conversation_id", Some(conversation.conversation_id.clone()));
            put(&mut fields, "opportunity_id", conversation.opportunity_id.clone());
            put(&mut fields, "company_domain", conversation.company_domain.clone());
            put(
                &mut fields,
                "transcript_excerpt",
                Some(conversation.raw_transcript.chars().take(TRANSCRIPT_EXCERPT_CHARS).collect()),
            );
        }
        EventPayload::EmailThread(thread) => {
            put(&mut fields, "thread_id", Some(thread.thread_id.clone()));
            put(&mut fields, "opportunity_id", thread.opportunity_id.clone());
            put(&mut fields, "company_domain", thread.company_domain.clone());
            let subjects: BTreeSet<String> =
                thread.emails.iter().filter_map(|email| email.subject.clone()).collect();
            if !subjects.is_empty() {
                fields.insert(
                    "subjects".to_string(),
                    Value::Array(subjects.into_iter().map(Value::String).collect()),
                );
            }
        }
        EventPayload::ProductUsage(usage) => {
            put(&mut fields, "user_id", Some(usage.user_id.clone()));
            put(&mut fields, "session_id", Some(usage.session_id.clone()));
            put(&mut fields, "company_domain", usage.company_domain.clone());
            put(&mut fields, "session_summary", usage.session_summary.clone());
        }
    }
    fields
}

pub fn derive_fields(envelope: &Envelope) -> FieldMap {
    let mut fields = FieldMap::new();
    match &envelope.payload {
        EventPayload::CalendarEvent(event) => {
            let minutes = (event.end_time - event.start_time).num_minutes();
            fields.insert("duration_minutes".to_string(), json!(minutes));
            fields.insert("attendee_count".to_string(), json!(event.attendees.len()));

            let roles: BTreeSet<String> = event
                .attendees
                .iter()
                .filter_map(|attendee| attendee.role.as_deref())
                .map(normalize_role)
                .collect();
            fields.insert("attendee_roles".to_string(), string_array(roles));

            let domains: BTreeSet<String> =
                event.attendees.iter().filter_map(|a| email_domain(&a.email)).collect();
            // External means outside the organizer's email domain.
            let organizer_domain = email_domain(&event.organizer);
            let external = event
                .attendees
                .iter()
                .filter_map(|a| email_domain(&a.email))
                .filter(|domain| Some(domain) != organizer_domain.as_ref())
                .count();
            fields.insert("external_attendee_count".to_string(), json!(external));
            fields.insert("attendee_domains".to_string(), string_array(domains));
        }
        EventPayload::AgentData(agent) => {
            if let Some(status) = agent.data.qualification_status.as_deref() {
                let qualified = matches!(status.to_ascii_uppercase().as_str(), "MQL" | "SQL");
                fields.insert("is_qualified".to_string(), Value::Bool(qualified));
            }
        }
        EventPayload::Conversation(conversation) => {
            let roles: BTreeSet<String> = conversation
                .participants
                .iter()
                .filter_map(|participant| participant.role.as_deref())
                .map(normalize_role)
                .collect();
            fields.insert("participant_roles".to_string(), string_array(roles));
            fields.insert(
                "participant_count".to_string(),
                json!(conversation.participants.len()),
            );
            fields.insert(
                "transcript_words".to_string(),
                json!(conversation.raw_transcript.split_whitespace().count()),
            );
        }
        EventPayload::EmailThread(thread) => {
            fields.insert("email_count".to_string(), json!(thread.emails.len()));
            if let Some(first) = thread.emails.iter().map(|email| email.timestamp).min() {
                fields.insert("first_email_at".to_string(), json!(first.to_rfc3339()));
            }
            if let Some(last) = thread.emails.iter().map(|email| email.timestamp).max() {
                fields.insert("last_email_at".to_string(), json!(last.to_rfc3339()));
            }
        }
        EventPayload::ProductUsage(usage) => {
            fields.insert("event_count".to_string(), json!(usage.events.len()));
        }
    }
    fields
}

pub fn extract_entities(payload: &EventPayload) -> Vec<Entity> {
    let mut entities = BTreeSet::new();
    let mut add = |kind: EntityKind, value: &str| {
        let value = value.trim();
        if !value.is_empty() {
            entities.insert(Entity { kind, value: value.to_string() });
        }
    };

    if let Some(domain) = payload.company_domain() {
        add(EntityKind::Company, domain);
    }

    match payload {
        EventPayload::CalendarEvent(event) => {
            for attendee in &event.attendees {
                add(EntityKind::Email, &attendee.email.to_ascii_lowercase());
                if let Some(name) = &attendee.name {
                    add(EntityKind::Person, name);
                }
            }
            if let Some(opportunity) = &event.opportunity_id {
                add(EntityKind::Opportunity, opportunity);
            }
        }
        EventPayload::AgentData(_) => {}
        EventPayload::Conversation(conversation) => {
            for participant in &conversation.participants {
                if let Some(name) = &participant.name {
                    add(EntityKind::Person, name);
                }
                if let Some(email) = &participant.email {
                    add(EntityKind::Email, &email.to_ascii_lowercase());
                }
            }
            if let Some(opportunity) = &conversation.opportunity_id {
                add(EntityKind::Opportunity, opportunity);
            }
        }
        EventPayload::EmailThread(thread) => {
            for sender in thread.emails.iter().filter_map(|email| email.sender.as_deref()) {
                add(EntityKind::Email, &sender.to_ascii_lowercase());
            }
            if let Some(opportunity) = &thread.opportunity_id {
                add(EntityKind::Opportunity, opportunity);
            }
        }
        EventPayload::ProductUsage(_) => {}
    }

    entities.into_iter().collect()
}

/// Text handed to the embedding capability, or `None` for types without one.
pub fn embedding_text(payload: &EventPayload) -> Option<String> {
    let text = match payload {
        EventPayload::CalendarEvent(event) => match &event.description {
            Some(description) => format!("{}\n\n{description}", event.title),
            None => event.title.clone(),
        },
        EventPayload::Conversation(conversation) => conversation.raw_transcript.clone(),
        EventPayload::EmailThread(thread) => thread
            .emails
            .iter()
            .map(|email| email.body_text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
        EventPayload::AgentData(_) | EventPayload::ProductUsage(_) => return None,
    };
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Checks that only make sense after structural validation. Failures are permanent.
pub fn semantic_check(envelope: &Envelope) -> Result<(), ProcessingError> {
    match &envelope.payload {
        EventPayload::CalendarEvent(event) => {
            let minutes = (event.end_time - event.start_time).num_minutes();
            if minutes > MAX_MEETING_MINUTES {
                return Err(ProcessingError::Permanent(format!(
                    "meeting lasts {minutes} minutes, longer than a day"
                )));
            }
            if let Some(bad) = event.attendees.iter().find(|a| email_domain(&a.email).is_none()) {
                return Err(ProcessingError::Permanent(format!(
                    "attendee email `{}` has no domain",
                    bad.email
                )));
            }
        }
        EventPayload::AgentData(agent) => {
            if let Some(score) = agent.data.confidence_score {
                if !(0.0..=1.0).contains(&score) {
                    return Err(ProcessingError::Permanent(format!(
                        "confidence_score {score} outside 0..=1"
                    )));
                }
            }
            if let Some(usage) = &agent.data.product_usage {
                if let Some(score) = usage.engagement_score {
                    if !(0.0..=100.0).contains(&score) {
                        return Err(ProcessingError::Permanent(format!(
                            "engagement_score {score} outside 0..=100"
                        )));
                    }
                }
                if usage.active_users.is_some_and(|users| users < 0) {
                    return Err(ProcessingError::Permanent(
                        "active_users must not be negative".to_string(),
                    ));
                }
            }
        }
        EventPayload::Conversation(_)
        | EventPayload::EmailThread(_)
        | EventPayload::ProductUsage(_) => {}
    }
    Ok(())
}

fn put(fields: &mut FieldMap, key: &str, value: Option<String>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), Value::String(value));
    }
}

fn string_array(values: BTreeSet<String>) -> Value {
    Value::Array(values.into_iter().map(Value::String).collect())
}

fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}

fn email_domain(email: &str) -> Option<String> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    (!local.is_empty() && domain.contains('.')).then(|| domain.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{derive_fields, embedding_text, extract_entities, semantic_check};
    use crate::canonical::Canonicalizer;
    use crate::domain::event::{Envelope, EventType};
    use crate::domain::record::EntityKind;
    use crate::errors::ProcessingError;

    fn calendar() -> Envelope {
        Canonicalizer::default()
            .normalize(
                &json!({
                    "event_id": "cal-7",
                    "title": "Pricing review",
                    "description": "Walk through enterprise tier",
                    "start_time": "2026-10-13T15:00:00Z",
                    "end_time": "2026-10-13T15:45:00Z",
                    "attendees": [
                        {"email": "cto@acme.com", "name": "Ada", "role": "CTO"},
                        {"email": "ae@seller.io", "name": "Bo", "role": "Account Executive"}
                    ],
                    "organizer": "ae@seller.io",
                    "company_domain": "acme.com"
                }),
                EventType::CalendarEvent,
            )
            .expect("valid calendar event")
    }

    #[test]
    fn calendar_derived_fields() {
        let fields = derive_fields(&calendar());

        assert_eq!(fields["duration_minutes"], json!(45));
        assert_eq!(fields["attendee_count"], json!(2));
        assert_eq!(fields["external_attendee_count"], json!(1));
        assert_eq!(fields["attendee_roles"], json!(["account executive", "cto"]));
    }

    #[test]
    fn external_attendees_are_counted_against_the_organizer_domain() {
        let envelope = Canonicalizer::default()
            .normalize(
                &json!({
                    "event_id": "cal-internal",
                    "title": "Forecast sync",
                    "start_time": "2026-10-13T09:00:00Z",
                    "end_time": "2026-10-13T09:30:00Z",
                    "attendees": [
                        {"email": "ae@seller.io", "name": "Bo"},
                        {"email": "SE@Seller.io", "name": "Cy"},
                        {"email": "buyer@globex.com", "name": "Di"},
                        {"email": "cfo@initech.com", "name": "Ed"}
                    ],
                    "organizer": "ae@seller.io"
                }),
                EventType::CalendarEvent,
            )
            .expect("valid calendar event");

        let fields = derive_fields(&envelope);

        assert_eq!(fields["external_attendee_count"], json!(2));
    }

    #[test]
    fn entities_include_people_emails_and_company() {
        let entities = extract_entities(&calendar().payload);

        assert!(entities.iter().any(|e| e.kind == EntityKind::Company && e.value == "acme.com"));
        assert!(entities.iter().any(|e| e.kind == EntityKind::Person && e.value == "Ada"));
        assert!(entities.iter().any(|e| e.kind == EntityKind::Email && e.value == "cto@acme.com"));
    }

    #[test]
    fn embedding_text_joins_title_and_description() {
        assert_eq!(
            embedding_text(&calendar().payload).as_deref(),
            Some("Pricing review\n\nWalk through enterprise tier")
        );
    }

    #[test]
    fn out_of_range_confidence_is_a_permanent_failure() {
        let envelope = Canonicalizer::default()
            .normalize_at(
                &json!({
                    "agent_id": "agent-1",
                    "agent_type": "lead_qualification",
                    "timestamp": "2026-10-13T09:00:00Z",
                    "data": {"domain": "acme.com", "confidence_score": 1.7}
                }),
                EventType::AgentData,
                Utc::now(),
            )
            .expect("structurally valid");

        assert!(embedding_text(&envelope.payload).is_none());
        assert!(matches!(semantic_check(&envelope), Err(ProcessingError::Permanent(_))));
    }

    #[test]
    fn well_formed_calendar_passes_semantic_checks() {
        assert_eq!(semantic_check(&calendar()), Ok(()));
    }
}
