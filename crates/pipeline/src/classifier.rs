//! Rule-based intent classifier.
//!
//! Reads cues out of the question (record type, time window, company domain, metric,
//! and a "similar to ..." clause) and turns them into a [`QueryPlan`]. A question with
//! none of those cues is reported as unclassifiable so the caller can ask for
//! clarification instead of guessing.

use async_trait::async_trait;

use gtmlake_core::capability::IntentClassifier;
use gtmlake_core::domain::event::EventType;
use gtmlake_core::domain::query::{Aggregation, Predicate, QueryIntent, QueryPlan, TimeWindow};
use gtmlake_core::errors::ClassificationUnavailable;

pub const KEYWORD_CLASSIFIER_VERSION: &str = "keyword-v1";

const SIMILARITY_MARKERS: [&str; 6] = [
    "similar to ",
    "related to ",
    "that mention ",
    "mentioning ",
    "discussing ",
    "talking about ",
];

#[derive(Clone, Debug)]
pub struct KeywordIntentClassifier {
    version: String,
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self { version: KEYWORD_CLASSIFIER_VERSION.to_string() }
    }
}

impl KeywordIntentClassifier {
    pub fn plan(&self, question: &str) -> Result<QueryPlan, ClassificationUnavailable> {
        let normalized = normalize_text(question);
        if normalized.is_empty() {
            return Err(ClassificationUnavailable("question is empty".to_string()));
        }

        // Everything after a similarity marker is semantic content, not a cue.
        let (cue_text, similarity_text) = split_similarity_clause(question, &normalized);
        let tokens = tokenize(&cue_text);

        let qualification = extract_qualification(&tokens);
        let event_type = extract_event_type(&tokens)
            .or(qualification.as_ref().map(|_| EventType::AgentData));
        let window = extract_time_window(&cue_text, &tokens);
        let company = extract_company_domain(&tokens);
        let aggregation = extract_aggregation(&cue_text, event_type);

        if event_type.is_none()
            && window.is_none()
            && company.is_none()
            && aggregation.is_none()
            && similarity_text.is_none()
        {
            return Err(ClassificationUnavailable(
                "no record type, time window, company domain, metric, or similarity cue found"
                    .to_string(),
            ));
        }

        let mut filters = Vec::new();
        if let Some(event_type) = event_type {
            filters.push(Predicate::eq("event_type", event_type.as_str()));
        }
        if let Some(window) = window {
            filters.push(Predicate::within(time_field(event_type), window));
        }
        if let Some(company) = company {
            filters.push(Predicate::eq("partition_key", company));
        }
        if let Some(predicate) = qualification {
            filters.push(predicate);
        }

        let intent = match (&similarity_text, &aggregation) {
            (Some(_), _) if !filters.is_empty() => QueryIntent::Hybrid,
            (Some(_), _) => QueryIntent::SimilaritySearch,
            (None, Some(_)) => QueryIntent::Aggregate,
            (None, None) => QueryIntent::Lookup,
        };

        let mut plan = QueryPlan::new(intent);
        plan.filters = filters;
        plan.target_fields = target_fields(event_type);
        plan.similarity_text = similarity_text;
        plan.aggregation = if intent == QueryIntent::Aggregate { aggregation } else { None };
        plan.limit = extract_limit(&tokens);
        Ok(plan)
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    fn version(&self) -> Option<String> {
        Some(self.version.clone())
    }

    async fn classify(&self, question: &str) -> Result<QueryPlan, ClassificationUnavailable> {
        self.plan(question)
    }
}

fn normalize_text(text: &str) -> String {
    text.trim().to_ascii_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '@') {
            sanitized.push(character.to_ascii_lowercase());
        } else {
            sanitized.push(' ');
        }
    }
    sanitized
        .split_whitespace()
        .map(|token| token.trim_matches(|c| c == '.' || c == '-').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn split_similarity_clause(question: &str, normalized: &str) -> (String, Option<String>) {
    let trimmed = question.trim();
    let found = SIMILARITY_MARKERS
        .iter()
        .filter_map(|marker| normalized.find(marker).map(|index| (index, marker.len())))
        .min_by_key(|(index, _)| *index);

    match found {
        // ASCII lowercasing keeps byte offsets, so the indices line up with `trimmed`.
        Some((index, length)) => {
            let content = trimmed[index + length..]
                .trim()
                .trim_end_matches(|c: char| c == '?' || c == '.' || c == '!')
                .trim();
            let content = (!content.is_empty()).then(|| content.to_string());
            (normalized[..index].to_string(), content)
        }
        None => (normalized.to_string(), None),
    }
}

fn extract_event_type(tokens: &[String]) -> Option<EventType> {
    tokens.iter().find_map(|token| match token.as_str() {
        "meeting" | "meetings" | "calendar" | "call" | "calls" | "demo" | "demos" => {
            Some(EventType::CalendarEvent)
        }
        "conversation" | "conversations" | "transcript" | "transcripts" => {
            Some(EventType::Conversation)
        }
        "email" | "emails" | "thread" | "threads" | "inbox" => Some(EventType::EmailThread),
        "usage" | "session" | "sessions" => Some(EventType::ProductUsage),
        "agent" | "agents" | "lead" | "leads" | "qualification" | "signals" => {
            Some(EventType::AgentData)
        }
        _ => None,
    })
}

fn extract_qualification(tokens: &[String]) -> Option<Predicate> {
    tokens.iter().find_map(|token| match token.as_str() {
        "mql" | "mqls" => Some(Predicate::eq("qualification_status", "MQL")),
        "sql" | "sqls" => Some(Predicate::eq("qualification_status", "SQL")),
        "qualified" => Some(Predicate::eq("is_qualified", true)),
        _ => None,
    })
}

fn extract_time_window(normalized: &str, tokens: &[String]) -> Option<TimeWindow> {
    let phrases = [
        ("today", TimeWindow::Today),
        ("this week", TimeWindow::CurrentWeek),
        ("current week", TimeWindow::CurrentWeek),
        ("last week", TimeWindow::LastWeek),
        ("past week", TimeWindow::LastWeek),
        ("this month", TimeWindow::CurrentMonth),
        ("this quarter", TimeWindow::CurrentQuarter),
    ];
    if let Some((_, window)) = phrases.iter().find(|(phrase, _)| normalized.contains(phrase)) {
        return Some(window.clone());
    }

    // "last 30 days", "past 7 days"
    tokens.windows(3).find_map(|window| {
        let [first, count, unit] = window else {
            return None;
        };
        let days = count.parse::<u32>().ok()?;
        (matches!(first.as_str(), "last" | "past") && matches!(unit.as_str(), "day" | "days"))
            .then_some(TimeWindow::LastDays { days })
    })
}

fn extract_company_domain(tokens: &[String]) -> Option<String> {
    tokens.iter().find_map(|token| {
        let candidate = token.rsplit_once('@').map_or(token.as_str(), |(_, domain)| domain);
        let (name, tld) = candidate.rsplit_once('.')?;
        let valid = !name.is_empty()
            && tld.len() >= 2
            && tld.chars().all(|c| c.is_ascii_alphabetic());
        valid.then(|| candidate.to_string())
    })
}

fn extract_aggregation(normalized: &str, event_type: Option<EventType>) -> Option<Aggregation> {
    if ["most common role", "most frequent role", "common roles", "top role"]
        .iter()
        .any(|phrase| normalized.contains(phrase))
    {
        let field = match event_type {
            Some(EventType::CalendarEvent) => "attendee_roles",
            _ => "participant_roles",
        };
        return Some(Aggregation::MostCommon(field.to_string()));
    }

    let averages = [
        ("average engagement", "engagement_score"),
        ("average confidence", "confidence_score"),
        ("average duration", "duration_minutes"),
        ("average meeting length", "duration_minutes"),
        ("average active users", "active_users"),
    ];
    if let Some((_, field)) = averages.iter().find(|(phrase, _)| normalized.contains(phrase)) {
        return Some(Aggregation::Avg((*field).to_string()));
    }

    if ["by company", "per company", "by domain", "per domain"]
        .iter()
        .any(|phrase| normalized.contains(phrase))
    {
        return Some(Aggregation::CountBy("company_domain".to_string()));
    }

    if ["how many", "number of", "count "].iter().any(|phrase| normalized.contains(phrase)) {
        return Some(Aggregation::Count);
    }

    None
}

fn extract_limit(tokens: &[String]) -> Option<usize> {
    tokens.windows(2).find_map(|pair| {
        (pair[0] == "top" || pair[0] == "first").then(|| pair[1].parse::<usize>().ok()).flatten()
    })
}

fn time_field(event_type: Option<EventType>) -> &'static str {
    match event_type {
        Some(EventType::CalendarEvent) => "start_time",
        _ => "occurred_at",
    }
}

fn target_fields(event_type: Option<EventType>) -> Vec<String> {
    let fields: &[&str] = match event_type {
        Some(EventType::CalendarEvent) => {
            &["title", "start_time", "company_domain", "attendees", "attendee_roles"]
        }
        Some(EventType::Conversation) => {
            &["conversation_id", "company_domain", "participant_roles", "transcript_excerpt"]
        }
        Some(EventType::EmailThread) => &["thread_id", "company_domain", "subjects", "email_count"],
        Some(EventType::ProductUsage) => &["user_id", "session_id", "company_domain", "event_count"],
        Some(EventType::AgentData) => {
            &["agent_type", "company_domain", "qualification_status", "confidence_score"]
        }
        None => &[],
    };
    fields.iter().map(|field| (*field).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use gtmlake_core::capability::IntentClassifier;
    use gtmlake_core::domain::query::{Aggregation, Predicate, QueryIntent, TimeWindow};

    use super::{KeywordIntentClassifier, KEYWORD_CLASSIFIER_VERSION};

    #[tokio::test]
    async fn meetings_this_week_is_a_calendar_lookup() {
        let plan = KeywordIntentClassifier::default()
            .classify("Show me all customers who had meetings this week")
            .await
            .expect("plan");

        assert_eq!(plan.intent, QueryIntent::Lookup);
        assert_eq!(
            plan.filters,
            vec![
                Predicate::eq("event_type", "calendar_event"),
                Predicate::within("start_time", TimeWindow::CurrentWeek),
            ]
        );
        assert!(plan.target_fields.contains(&"company_domain".to_string()));
    }

    #[test]
    fn most_common_role_aggregates_conversation_participants() {
        let plan = KeywordIntentClassifier::default()
            .plan("What is the most common role in sales conversations?")
            .expect("plan");

        assert_eq!(plan.intent, QueryIntent::Aggregate);
        assert_eq!(plan.aggregation, Some(Aggregation::MostCommon("participant_roles".into())));
        assert_eq!(plan.filters, vec![Predicate::eq("event_type", "conversation")]);
    }

    #[test]
    fn similarity_clause_with_filters_becomes_hybrid() {
        let plan = KeywordIntentClassifier::default()
            .plan("Meetings with acme.com similar to Pricing objections from procurement?")
            .expect("plan");

        assert_eq!(plan.intent, QueryIntent::Hybrid);
        assert_eq!(plan.similarity_text.as_deref(), Some("Pricing objections from procurement"));
        assert!(plan.filters.contains(&Predicate::eq("partition_key", "acme.com")));
        assert!(plan.filters.contains(&Predicate::eq("event_type", "calendar_event")));
    }

    #[test]
    fn bare_similarity_clause_is_a_similarity_search() {
        let plan = KeywordIntentClassifier::default()
            .plan("anything related to security review delays")
            .expect("plan");

        assert_eq!(plan.intent, QueryIntent::SimilaritySearch);
        assert!(plan.filters.is_empty());
        assert_eq!(plan.similarity_text.as_deref(), Some("security review delays"));
    }

    #[test]
    fn qualification_and_relative_days_are_recognized() {
        let plan = KeywordIntentClassifier::default()
            .plan("How many MQL leads in the last 30 days?")
            .expect("plan");

        assert_eq!(plan.intent, QueryIntent::Aggregate);
        assert_eq!(plan.aggregation, Some(Aggregation::Count));
        assert!(plan.filters.contains(&Predicate::eq("event_type", "agent_data")));
        assert!(plan.filters.contains(&Predicate::eq("qualification_status", "MQL")));
        assert!(plan
            .filters
            .contains(&Predicate::within("occurred_at", TimeWindow::LastDays { days: 30 })));
    }

    #[test]
    fn question_without_cues_is_unclassifiable() {
        let classifier = KeywordIntentClassifier::default();

        let error = classifier.plan("what should I do next?").expect_err("no cues");
        assert!(error.0.contains("time window"));
        assert!(classifier.plan("   ").is_err());
        assert_eq!(classifier.version.as_str(), KEYWORD_CLASSIFIER_VERSION);
    }

    #[test]
    fn email_addresses_resolve_to_their_domain() {
        let plan = KeywordIntentClassifier::default()
            .plan("emails from jane@Acme.com top 5")
            .expect("plan");

        assert!(plan.filters.contains(&Predicate::eq("partition_key", "acme.com")));
        assert_eq!(plan.limit, Some(5));
    }
}
