use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CalendarEvent,
    AgentData,
    Conversation,
    EmailThread,
    ProductUsage,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        Self::CalendarEvent,
        Self::AgentData,
        Self::Conversation,
        Self::EmailThread,
        Self::ProductUsage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CalendarEvent => "calendar_event",
            Self::AgentData => "agent_data",
            Self::Conversation => "conversation",
            Self::EmailThread => "email_thread",
            Self::ProductUsage => "product_usage",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "calendar_event" => Some(Self::CalendarEvent),
            "agent_data" => Some(Self::AgentData),
            "conversation" => Some(Self::Conversation),
            "email_thread" => Some(Self::EmailThread),
            "product_usage" => Some(Self::ProductUsage),
            _ => None,
        }
    }

    /// Log topic this event type is published to.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::CalendarEvent => "gtm.calendar_events",
            Self::AgentData => "gtm.agent_data",
            Self::Conversation => "gtm.conversations",
            Self::EmailThread => "gtm.emails",
            Self::ProductUsage => "gtm.product_usage",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event_type| event_type.topic() == topic)
    }

    /// Directory segment used for raw-store pointers.
    pub fn raw_segment(&self) -> &'static str {
        match self {
            Self::CalendarEvent => "calendar_events",
            Self::AgentData => "agent_data",
            Self::Conversation => "conversations",
            Self::EmailThread => "emails",
            Self::ProductUsage => "product_usage",
        }
    }

    /// Whether records of this type normally receive a vector entry.
    pub fn supports_embedding(&self) -> bool {
        matches!(self, Self::CalendarEvent | Self::Conversation | Self::EmailThread)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    LeadQualification,
    AccountIntelligence,
    SalesProcess,
    SentimentAnalysis,
    ProductIntelligence,
    FollowUp,
    MarketingIntelligence,
    Forecast,
    OutcomeAnalysis,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadQualification => "lead_qualification",
            Self::AccountIntelligence => "account_intelligence",
            Self::SalesProcess => "sales_process",
            Self::SentimentAnalysis => "sentiment_analysis",
            Self::ProductIntelligence => "product_intelligence",
            Self::FollowUp => "follow_up",
            Self::MarketingIntelligence => "marketing_intelligence",
            Self::Forecast => "forecast",
            Self::OutcomeAnalysis => "outcome_analysis",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lead_qualification" => Some(Self::LeadQualification),
            "account_intelligence" => Some(Self::AccountIntelligence),
            "sales_process" => Some(Self::SalesProcess),
            "sentiment_analysis" => Some(Self::SentimentAnalysis),
            "product_intelligence" => Some(Self::ProductIntelligence),
            "follow_up" => Some(Self::FollowUp),
            "marketing_intelligence" => Some(Self::MarketingIntelligence),
            "forecast" => Some(Self::Forecast),
            "outcome_analysis" => Some(Self::OutcomeAnalysis),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub event_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub attendees: Vec<Attendee>,
    pub organizer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_users: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement_score: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentFindings {
    pub domain: String,
    /// Either a headcount or a band such as `"50-200"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_size: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geography: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_usage: Option<UsageSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualification_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub data: AgentFindings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw_transcript: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub timestamp: DateTime<Utc>,
    pub body_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailThread {
    pub thread_id: String,
    pub emails: Vec<EmailMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductUsage {
    pub user_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Type-tagged event body. Unknown fields survive in each variant's `extra` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum EventPayload {
    CalendarEvent(CalendarEvent),
    AgentData(AgentData),
    Conversation(Conversation),
    EmailThread(EmailThread),
    ProductUsage(ProductUsage),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CalendarEvent(_) => EventType::CalendarEvent,
            Self::AgentData(_) => EventType::AgentData,
            Self::Conversation(_) => EventType::Conversation,
            Self::EmailThread(_) => EventType::EmailThread,
            Self::ProductUsage(_) => EventType::ProductUsage,
        }
    }

    pub fn company_domain(&self) -> Option<&str> {
        let domain = match self {
            Self::CalendarEvent(event) => event.company_domain.as_deref(),
            Self::AgentData(agent) => Some(agent.data.domain.as_str()),
            Self::Conversation(conversation) => conversation.company_domain.as_deref(),
            Self::EmailThread(thread) => thread.company_domain.as_deref(),
            Self::ProductUsage(usage) => usage.company_domain.as_deref(),
        };
        domain.map(str::trim).filter(|value| !value.is_empty())
    }
}

/// Normalized, typed representation of one ingested event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: EventId,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub partition_key: PartitionKey,
    pub payload: EventPayload,
    pub ingested_at: DateTime<Utc>,
}

impl Envelope {
    pub fn topic(&self) -> &'static str {
        self.event_type.topic()
    }

    /// Stable fingerprint of everything except `ingested_at`, so re-ingesting the
    /// same event yields the same value.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let canonical = serde_json::json!({
            "event_id": self.event_id,
            "event_type": self.event_type,
            "occurred_at": self.occurred_at,
            "partition_key": self.partition_key,
            "payload": self.payload,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentType, EventType};

    #[test]
    fn event_type_string_and_topic_mappings_round_trip() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
            assert_eq!(EventType::from_topic(event_type.topic()), Some(event_type));
        }
        assert_eq!(EventType::parse("meeting"), None);
    }

    #[test]
    fn only_text_bearing_types_support_embedding() {
        assert!(EventType::CalendarEvent.supports_embedding());
        assert!(EventType::Conversation.supports_embedding());
        assert!(!EventType::AgentData.supports_embedding());
        assert!(!EventType::ProductUsage.supports_embedding());
    }

    #[test]
    fn agent_type_parse_is_case_insensitive() {
        assert_eq!(AgentType::parse(" Lead_Qualification "), Some(AgentType::LeadQualification));
        assert_eq!(AgentType::parse("crystal_ball"), None);
    }
}
