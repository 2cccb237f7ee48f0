//! Predicate evaluation, ordering, and aggregation over catalog entries. Storage
//! backends narrow candidates however they can, then defer to these rules so every
//! backend answers a [`CatalogQuery`] identically.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::canonical::parse_timestamp;
use crate::domain::query::{
    AggregateGroup, AggregateResult, Aggregation, CatalogQuery, CatalogQueryResult, Predicate,
    PredicateOp,
};
use crate::domain::record::CatalogEntry;

pub fn matches(entry: &CatalogEntry, predicate: &Predicate, now: DateTime<Utc>) -> bool {
    let value = entry.field(&predicate.field);
    match (&predicate.op, value) {
        (PredicateOp::Exists, value) => value.is_some_and(|v| !v.is_null()),
        (_, None) | (_, Some(Value::Null)) => false,
        (PredicateOp::Eq(expected), Some(actual)) => loosely_equal(&actual, expected),
        (PredicateOp::NotEq(expected), Some(actual)) => !loosely_equal(&actual, expected),
        (PredicateOp::In(options), Some(actual)) => {
            options.iter().any(|option| loosely_equal(&actual, option))
        }
        (PredicateOp::Contains(needle), Some(actual)) => contains(&actual, needle),
        (PredicateOp::Gt(bound), Some(actual)) => number(&actual).is_some_and(|n| n > *bound),
        (PredicateOp::Gte(bound), Some(actual)) => number(&actual).is_some_and(|n| n >= *bound),
        (PredicateOp::Lt(bound), Some(actual)) => number(&actual).is_some_and(|n| n < *bound),
        (PredicateOp::Lte(bound), Some(actual)) => number(&actual).is_some_and(|n| n <= *bound),
        (PredicateOp::Within(window), Some(actual)) => actual
            .as_str()
            .and_then(parse_timestamp)
            .is_some_and(|at| window.contains(at, now)),
    }
}

pub fn matches_all(entry: &CatalogEntry, filters: &[Predicate], now: DateTime<Utc>) -> bool {
    filters.iter().all(|predicate| matches(entry, predicate, now))
}

/// Catalog order: most recent first, ties broken by event id.
pub fn catalog_order(left: &CatalogEntry, right: &CatalogEntry) -> Ordering {
    right.occurred_at.cmp(&left.occurred_at).then_with(|| left.event_id.cmp(&right.event_id))
}

/// Filters, orders, and aggregates `candidates`. `limit` applies to entry results only.
pub fn evaluate(
    candidates: Vec<CatalogEntry>,
    query: &CatalogQuery,
    now: DateTime<Utc>,
) -> CatalogQueryResult {
    let mut matched: Vec<CatalogEntry> =
        candidates.into_iter().filter(|entry| matches_all(entry, &query.filters, now)).collect();
    matched.sort_by(catalog_order);

    match &query.aggregation {
        Some(aggregation) => CatalogQueryResult::Aggregate(aggregate(&matched, aggregation)),
        None => {
            if let Some(limit) = query.limit {
                matched.truncate(limit);
            }
            CatalogQueryResult::Entries(matched)
        }
    }
}

pub fn aggregate(entries: &[CatalogEntry], aggregation: &Aggregation) -> AggregateResult {
    let groups = match aggregation {
        Aggregation::Count => vec![AggregateGroup {
            key: Value::String("*".to_string()),
            value: entries.len() as f64,
            count: entries.len() as u64,
        }],
        Aggregation::CountBy(field) => grouped_counts(entries, field),
        Aggregation::MostCommon(field) => {
            let groups = grouped_counts(entries, field);
            let top = groups.first().map(|group| group.count);
            groups.into_iter().take_while(|group| Some(group.count) == top).collect()
        }
        Aggregation::Sum(field) | Aggregation::Avg(field) => {
            let values: Vec<f64> =
                entries.iter().filter_map(|entry| entry.field(field)).filter_map(|v| number(&v)).collect();
            if values.is_empty() {
                Vec::new()
            } else {
                let sum: f64 = values.iter().sum();
                let value = match aggregation {
                    Aggregation::Avg(_) => sum / values.len() as f64,
                    _ => sum,
                };
                vec![AggregateGroup {
                    key: Value::String(field.clone()),
                    value,
                    count: values.len() as u64,
                }]
            }
        }
    };

    AggregateResult { aggregation: aggregation.clone(), groups }
}

/// Counts per distinct value, descending by count. Array fields count each element.
fn grouped_counts(entries: &[CatalogEntry], field: &str) -> Vec<AggregateGroup> {
    let mut counts: BTreeMap<String, (Value, u64)> = BTreeMap::new();
    for entry in entries {
        let values = match entry.field(field) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => continue,
            Some(other) => vec![other],
        };
        for value in values {
            let slot = counts.entry(group_key(&value)).or_insert((value, 0));
            slot.1 += 1;
        }
    }

    let mut groups: Vec<AggregateGroup> = counts
        .into_values()
        .map(|(key, count)| AggregateGroup { key, value: count as f64, count })
        .collect();
    groups.sort_by(|left, right| {
        right.count.cmp(&left.count).then_with(|| group_key(&left.key).cmp(&group_key(&right.key)))
    });
    groups
}

fn group_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.to_ascii_lowercase(),
        other => other.to_string(),
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(left), Value::String(right)) => left.eq_ignore_ascii_case(right),
        (Value::Array(items), expected) => items.iter().any(|item| loosely_equal(item, expected)),
        (left, right) => match (number(left), number(right)) {
            (Some(left), Some(right)) => (left - right).abs() < f64::EPSILON,
            _ => left == right,
        },
    }
}

fn contains(actual: &Value, needle: &str) -> bool {
    let needle = needle.to_ascii_lowercase();
    match actual {
        Value::String(text) => text.to_ascii_lowercase().contains(&needle),
        Value::Array(items) => items.iter().any(|item| contains(item, &needle)),
        _ => false,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{aggregate, evaluate, matches};
    use crate::domain::event::{EventId, EventType, PartitionKey};
    use crate::domain::query::{
        Aggregation, CatalogQuery, CatalogQueryResult, Predicate, PredicateOp, TimeWindow,
    };
    use crate::domain::record::{CatalogEntry, FieldMap, RawPointer};

    fn entry(id: &str, event_type: EventType, day: u32, fields: serde_json::Value) -> CatalogEntry {
        let fields: FieldMap = serde_json::from_value(fields).expect("field map");
        CatalogEntry {
            event_id: EventId(id.to_string()),
            event_type,
            partition_key: PartitionKey("acme.com".to_string()),
            occurred_at: Utc.with_ymd_and_hms(2026, 10, day, 15, 0, 0).unwrap(),
            fields,
            raw_pointer: RawPointer(format!("bronze/test/{id}.json")),
            updated_at: Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn within_window_uses_timestamp_fields() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap();
        let meeting = entry(
            "cal-1",
            EventType::CalendarEvent,
            13,
            json!({"start_time": "2026-10-13T15:00:00+00:00"}),
        );

        assert!(matches(&meeting, &Predicate::within("start_time", TimeWindow::CurrentWeek), now));
        assert!(!matches(&meeting, &Predicate::within("start_time", TimeWindow::LastWeek), now));
        assert!(matches(&meeting, &Predicate::eq("event_type", "calendar_event"), now));
    }

    #[test]
    fn numeric_and_array_predicates() {
        let now = Utc::now();
        let lead = entry(
            "agent-1",
            EventType::AgentData,
            12,
            json!({"confidence_score": 0.8, "attendee_roles": ["cto", "vp sales"]}),
        );

        let gte = Predicate { field: "confidence_score".into(), op: PredicateOp::Gte(0.75) };
        assert!(matches(&lead, &gte, now));
        assert!(matches(&lead, &Predicate::eq("attendee_roles", "CTO"), now));
        assert!(matches(&lead, &Predicate::contains("attendee_roles", "sales"), now));
        assert!(!matches(&lead, &Predicate::exists("missing"), now));
    }

    #[test]
    fn entries_are_ordered_newest_first_and_truncated() {
        let entries = vec![
            entry("a", EventType::CalendarEvent, 10, json!({})),
            entry("b", EventType::CalendarEvent, 12, json!({})),
            entry("c", EventType::CalendarEvent, 11, json!({})),
        ];
        let query = CatalogQuery { filters: Vec::new(), aggregation: None, limit: Some(2) };

        let CatalogQueryResult::Entries(found) = evaluate(entries, &query, Utc::now()) else {
            panic!("expected entries");
        };
        let ids: Vec<&str> = found.iter().map(|e| e.event_id.0.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn most_common_counts_array_elements_and_keeps_ties() {
        let entries = vec![
            entry("a", EventType::Conversation, 10, json!({"participant_roles": ["ae", "cto"]})),
            entry("b", EventType::Conversation, 11, json!({"participant_roles": ["ae"]})),
            entry("c", EventType::Conversation, 12, json!({"participant_roles": ["cto"]})),
        ];

        let result = aggregate(&entries, &Aggregation::MostCommon("participant_roles".into()));
        let keys: Vec<_> = result.groups.iter().map(|g| g.key.clone()).collect();
        assert_eq!(keys, vec![json!("ae"), json!("cto")]);
        assert!(result.groups.iter().all(|g| g.count == 2));
    }

    #[test]
    fn aggregates_over_nothing_produce_no_groups() {
        let result = aggregate(&[], &Aggregation::MostCommon("participant_roles".into()));
        assert!(result.groups.is_empty());

        let result = aggregate(&[], &Aggregation::Avg("engagement_score".into()));
        assert!(result.groups.is_empty());
    }
}
