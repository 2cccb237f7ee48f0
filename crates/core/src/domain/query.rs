use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::event::EventId;
use crate::domain::record::{CatalogEntry, FieldMap};
use crate::flows::QueryState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Lookup,
    Aggregate,
    SimilaritySearch,
    Hybrid,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Aggregate => "aggregate",
            Self::SimilaritySearch => "similarity_search",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn uses_catalog(&self) -> bool {
        matches!(self, Self::Lookup | Self::Aggregate | Self::Hybrid)
    }

    pub fn uses_vectors(&self) -> bool {
        matches!(self, Self::SimilaritySearch | Self::Hybrid)
    }
}

/// Calendar window, relative to "now" unless it is an explicit range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "window", rename_all = "snake_case")]
pub enum TimeWindow {
    Today,
    CurrentWeek,
    LastWeek,
    CurrentMonth,
    CurrentQuarter,
    LastDays { days: u32 },
    Range { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl TimeWindow {
    /// Half-open `[start, end)` bounds. Weeks start on Monday, UTC.
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let today = now.date_naive();
        match self {
            Self::Today => (midnight(today), midnight(today) + Duration::days(1)),
            Self::CurrentWeek => {
                let start = midnight(today)
                    - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                (start, start + Duration::days(7))
            }
            Self::LastWeek => {
                let this_week = midnight(today)
                    - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                (this_week - Duration::days(7), this_week)
            }
            Self::CurrentMonth => {
                let start = first_of_month(today.year(), today.month());
                let end = if today.month() == 12 {
                    first_of_month(today.year() + 1, 1)
                } else {
                    first_of_month(today.year(), today.month() + 1)
                };
                (start, end)
            }
            Self::CurrentQuarter => {
                let first_month = (today.month0() / 3) * 3 + 1;
                let start = first_of_month(today.year(), first_month);
                let end = if first_month == 10 {
                    first_of_month(today.year() + 1, 1)
                } else {
                    first_of_month(today.year(), first_month + 3)
                };
                (start, end)
            }
            Self::LastDays { days } => {
                let start = now
                    .checked_sub_signed(Duration::days(i64::from(*days)))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                (start, now)
            }
            Self::Range { start, end } => (*start, *end),
        }
    }

    pub fn resolve(&self, now: DateTime<Utc>) -> Self {
        let (start, end) = self.bounds(now);
        Self::Range { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let (start, end) = self.bounds(now);
        at >= start && at < end
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

fn first_of_month(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1).map(midnight).unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum PredicateOp {
    Eq(Value),
    NotEq(Value),
    In(Vec<Value>),
    /// Case-insensitive substring match on strings, element match on arrays.
    Contains(String),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    Within(TimeWindow),
    Exists,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: PredicateOp,
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { field: field.into(), op: PredicateOp::Eq(value.into()) }
    }

    pub fn within(field: impl Into<String>, window: TimeWindow) -> Self {
        Self { field: field.into(), op: PredicateOp::Within(window) }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self { field: field.into(), op: PredicateOp::Contains(needle.into()) }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self { field: field.into(), op: PredicateOp::Exists }
    }

    /// Replaces relative time windows with absolute ranges.
    pub fn resolved(&self, now: DateTime<Utc>) -> Self {
        match &self.op {
            PredicateOp::Within(window) => {
                Self { field: self.field.clone(), op: PredicateOp::Within(window.resolve(now)) }
            }
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            PredicateOp::Eq(value) => write!(f, "{} = {}", self.field, render(value)),
            PredicateOp::NotEq(value) => write!(f, "{} != {}", self.field, render(value)),
            PredicateOp::In(values) => {
                let rendered: Vec<String> = values.iter().map(render).collect();
                write!(f, "{} in [{}]", self.field, rendered.join(", "))
            }
            PredicateOp::Contains(needle) => write!(f, "{} contains {needle}", self.field),
            PredicateOp::Gt(value) => write!(f, "{} > {value}", self.field),
            PredicateOp::Gte(value) => write!(f, "{} >= {value}", self.field),
            PredicateOp::Lt(value) => write!(f, "{} < {value}", self.field),
            PredicateOp::Lte(value) => write!(f, "{} <= {value}", self.field),
            PredicateOp::Within(TimeWindow::Range { start, end }) => write!(
                f,
                "{} within [{}, {})",
                self.field,
                start.to_rfc3339(),
                end.to_rfc3339()
            ),
            PredicateOp::Within(window) => write!(f, "{} within {window:?}", self.field),
            PredicateOp::Exists => write!(f, "{} exists", self.field),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "field", rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    CountBy(String),
    MostCommon(String),
    Sum(String),
    Avg(String),
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count(*)"),
            Self::CountBy(field) => write!(f, "count by {field}"),
            Self::MostCommon(field) => write!(f, "most common {field}"),
            Self::Sum(field) => write!(f, "sum({field})"),
            Self::Avg(field) => write!(f, "avg({field})"),
        }
    }
}

/// Executable translation of a natural-language question. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub intent: QueryIntent,
    pub filters: Vec<Predicate>,
    pub target_fields: Vec<String>,
    pub similarity_query: Option<Vec<f32>>,
    /// Semantic content to embed when `similarity_query` is not supplied.
    pub similarity_text: Option<String>,
    pub aggregation: Option<Aggregation>,
    pub limit: Option<usize>,
}

impl QueryPlan {
    pub fn new(intent: QueryIntent) -> Self {
        Self {
            intent,
            filters: Vec::new(),
            target_fields: Vec::new(),
            similarity_query: None,
            similarity_text: None,
            aggregation: None,
            limit: None,
        }
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            intent: self.intent,
            filters: self.filters.iter().map(ToString::to_string).collect(),
            aggregation: self.aggregation.as_ref().map(ToString::to_string),
            target_fields: self.target_fields.clone(),
            similarity: self.intent.uses_vectors(),
            classifier_version: None,
            cached: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub intent: QueryIntent,
    pub filters: Vec<String>,
    pub aggregation: Option<String>,
    pub target_fields: Vec<String>,
    pub similarity: bool,
    pub classifier_version: Option<String>,
    pub cached: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub filters: Vec<Predicate>,
    pub aggregation: Option<Aggregation>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub key: Value,
    pub value: f64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub aggregation: Aggregation,
    pub groups: Vec<AggregateGroup>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum CatalogQueryResult {
    Entries(Vec<CatalogEntry>),
    Aggregate(AggregateResult),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub fields: FieldMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Answered,
    Clarification,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFailureKind {
    ClassificationUnavailable,
    EmbeddingUnavailable,
    StorageTimeout,
    Storage,
    Cancelled,
    InvalidTransition,
}

impl QueryFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClassificationUnavailable => "classification_unavailable",
            Self::EmbeddingUnavailable => "embedding_unavailable",
            Self::StorageTimeout => "storage_timeout",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::InvalidTransition => "invalid_transition",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub kind: QueryFailureKind,
    pub reason: String,
}

/// Structured answer to one question. Errors are carried as data, never thrown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub correlation_id: String,
    pub question: String,
    pub status: QueryStatus,
    pub state: QueryState,
    pub answer_text: Option<String>,
    pub rows: Vec<ResultRow>,
    pub plan_summary: Option<PlanSummary>,
    pub clarification: Option<String>,
    pub failure: Option<QueryFailure>,
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::{Predicate, TimeWindow};

    #[test]
    fn current_week_starts_on_monday() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap();
        let (start, end) = TimeWindow::CurrentWeek.bounds(now);

        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap());
        assert!(TimeWindow::CurrentWeek
            .contains(Utc.with_ymd_and_hms(2026, 10, 13, 15, 0, 0).unwrap(), now));
        assert!(!TimeWindow::CurrentWeek
            .contains(Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap(), now));
    }

    #[test]
    fn december_month_and_quarter_roll_into_next_year() {
        let now = Utc.with_ymd_and_hms(2026, 12, 30, 8, 0, 0).unwrap();
        let next_year = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(TimeWindow::CurrentMonth.bounds(now).1, next_year);
        assert_eq!(TimeWindow::CurrentQuarter.bounds(now).1, next_year);
        assert_eq!(
            TimeWindow::CurrentQuarter.bounds(now).0,
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn oversized_day_window_saturates_at_the_earliest_instant() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap();
        let window = TimeWindow::LastDays { days: u32::MAX };

        let (start, end) = window.bounds(now);

        assert_eq!(start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(end, now);
        assert!(window.contains(Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap(), now));
    }

    #[test]
    fn resolved_predicate_renders_absolute_range() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap();
        let rendered =
            Predicate::within("start_time", TimeWindow::CurrentWeek).resolved(now).to_string();

        assert_eq!(
            rendered,
            "start_time within [2026-10-12T00:00:00+00:00, 2026-10-19T00:00:00+00:00)"
        );
    }
}
