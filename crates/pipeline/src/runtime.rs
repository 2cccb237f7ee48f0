//! Question answering over the catalog and vector index.
//!
//! Every question walks the query flow (`Received -> Planned -> Executing -> Merged ->
//! Answered`, or `Failed`). Nothing here writes, so a cancelled or failed question
//! leaves no state behind, and every outcome is a [`QueryResponse`] rather than an
//! error.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use gtmlake_core::capability::{AnswerGenerator, EmbeddingProvider, IntentClassifier};
use gtmlake_core::config::QueryConfig;
use gtmlake_core::domain::query::{
    AggregateResult, CatalogQuery, CatalogQueryResult, QueryFailure, QueryFailureKind,
    QueryIntent, QueryPlan, QueryResponse, QueryStatus, ResultRow,
};
use gtmlake_core::domain::record::{CatalogEntry, FieldMap, SimilarityHit};
use gtmlake_core::flows::{QueryEvent, QueryFlow, QueryState};
use gtmlake_db::repositories::{Storage, StorageError};

#[derive(Clone, Debug, PartialEq)]
pub struct QueryRuntimeConfig {
    pub result_limit: usize,
    pub similarity_top_k: usize,
    pub storage_timeout: Duration,
    pub storage_retry_backoff: Duration,
    pub min_similarity_score: f32,
}

impl Default for QueryRuntimeConfig {
    fn default() -> Self {
        Self {
            result_limit: 50,
            similarity_top_k: 10,
            storage_timeout: Duration::from_secs(5),
            storage_retry_backoff: Duration::from_millis(200),
            min_similarity_score: 0.0,
        }
    }
}

impl From<&QueryConfig> for QueryRuntimeConfig {
    fn from(config: &QueryConfig) -> Self {
        Self {
            result_limit: config.result_limit,
            similarity_top_k: config.similarity_top_k,
            storage_timeout: Duration::from_millis(config.storage_timeout_ms),
            storage_retry_backoff: Duration::from_millis(config.storage_retry_backoff_ms),
            min_similarity_score: config.min_similarity_score,
        }
    }
}

type PlanCacheKey = (String, String);

pub struct QueryRuntime {
    storage: Arc<dyn Storage>,
    classifier: Arc<dyn IntentClassifier>,
    embedder: Arc<dyn EmbeddingProvider>,
    answer_generator: Option<Arc<dyn AnswerGenerator>>,
    config: QueryRuntimeConfig,
    flow: QueryFlow,
    plan_cache: RwLock<HashMap<PlanCacheKey, QueryPlan>>,
}

/// Tracks one question through the flow.
struct QueryRun<'a> {
    flow: &'a QueryFlow,
    correlation_id: String,
    question: String,
    state: QueryState,
}

impl QueryRun<'_> {
    fn advance(&mut self, event: QueryEvent) -> Result<(), QueryFailure> {
        let outcome = self.flow.apply(self.state, &event).map_err(|error| QueryFailure {
            kind: QueryFailureKind::InvalidTransition,
            reason: error.to_string(),
        })?;
        self.state = outcome.to;
        Ok(())
    }

    /// Moves to a terminal state where the caller has no failure path left to take.
    fn settle(&mut self, event: QueryEvent) {
        let from = self.state;
        if let Err(failure) = self.advance(event) {
            warn!(
                event_name = "query.flow.invalid_transition",
                correlation_id = %self.correlation_id,
                from = ?from,
                reason = %failure.reason,
                "query flow rejected a terminal transition"
            );
        }
    }

    fn fail(mut self, failure: QueryFailure, plan: Option<&QueryPlan>) -> QueryResponse {
        if !self.state.is_terminal() {
            // Failure is reachable from every non-terminal state.
            self.settle(QueryEvent::ExecutionFailed { reason: failure.reason.clone() });
        }
        warn!(
            event_name = "query.failed",
            correlation_id = %self.correlation_id,
            failure_kind = ?failure.kind,
            reason = %failure.reason,
            "question could not be answered"
        );
        QueryResponse {
            correlation_id: self.correlation_id,
            question: self.question,
            status: QueryStatus::Failed,
            state: QueryState::Failed,
            answer_text: None,
            rows: Vec::new(),
            plan_summary: plan.map(QueryPlan::summary),
            clarification: None,
            failure: Some(failure),
        }
    }
}

impl QueryRuntime {
    pub fn new(
        storage: Arc<dyn Storage>,
        classifier: Arc<dyn IntentClassifier>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: QueryRuntimeConfig,
    ) -> Self {
        Self {
            storage,
            classifier,
            embedder,
            answer_generator: None,
            config,
            flow: QueryFlow,
            plan_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_answer_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.answer_generator = Some(generator);
        self
    }

    pub async fn ask(&self, question: &str) -> QueryResponse {
        self.ask_at(question, Utc::now()).await
    }

    /// Relative time windows in the plan resolve against `now`.
    pub async fn ask_at(&self, question: &str, now: DateTime<Utc>) -> QueryResponse {
        self.answer(new_correlation_id(), question, now).await
    }

    /// Answers unless `cancel` resolves first, in which case the response is a
    /// `cancelled` failure.
    pub async fn ask_until<C>(&self, question: &str, cancel: C) -> QueryResponse
    where
        C: Future<Output = ()> + Send,
    {
        let correlation_id = new_correlation_id();
        tokio::select! {
            response = self.answer(correlation_id.clone(), question, Utc::now()) => response,
            () = cancel => {
                let run = QueryRun {
                    flow: &self.flow,
                    correlation_id,
                    question: question.to_string(),
                    state: QueryState::Received,
                };
                run.fail(
                    QueryFailure {
                        kind: QueryFailureKind::Cancelled,
                        reason: "cancelled".to_string(),
                    },
                    None,
                )
            }
        }
    }

    async fn answer(
        &self,
        correlation_id: String,
        question: &str,
        now: DateTime<Utc>,
    ) -> QueryResponse {
        let mut run = QueryRun {
            flow: &self.flow,
            correlation_id,
            question: question.to_string(),
            state: self.flow.initial_state(),
        };

        let (mut plan, cached) = match self.plan(question).await {
            Ok(planned) => planned,
            Err(reason) => return self.clarify(run, reason),
        };
        plan.filters = plan.filters.iter().map(|predicate| predicate.resolved(now)).collect();
        let mut summary = plan.summary();
        summary.classifier_version = self.classifier.version();
        summary.cached = cached;

        if let Err(failure) = run.advance(QueryEvent::Classified) {
            return run.fail(failure, Some(&plan));
        }
        if let Err(failure) = run.advance(QueryEvent::ExecutionStarted) {
            return run.fail(failure, Some(&plan));
        }

        let rows = match self.execute(&plan).await {
            Ok(rows) => rows,
            Err(failure) => return run.fail(failure, Some(&plan)),
        };

        if let Err(failure) = run.advance(QueryEvent::ResultsMerged) {
            return run.fail(failure, Some(&plan));
        }
        let answer_text = match &self.answer_generator {
            Some(generator) => generator.generate(question, &rows).await,
            None => None,
        };
        if let Err(failure) = run.advance(QueryEvent::ResultsDelivered) {
            return run.fail(failure, Some(&plan));
        }

        info!(
            event_name = "query.answered",
            correlation_id = %run.correlation_id,
            intent = plan.intent.as_str(),
            rows = rows.len(),
            cached_plan = cached,
            "question answered"
        );
        QueryResponse {
            correlation_id: run.correlation_id,
            question: run.question,
            status: QueryStatus::Answered,
            state: run.state,
            answer_text,
            rows,
            plan_summary: Some(summary),
            clarification: None,
            failure: None,
        }
    }

    /// Plans are only reused when the classifier tags its results with a version.
    async fn plan(&self, question: &str) -> Result<(QueryPlan, bool), String> {
        let key = self.classifier.version().map(|version| (version, normalize_question(question)));
        if let Some(key) = &key {
            if let Some(plan) = self.plan_cache.read().await.get(key) {
                return Ok((plan.clone(), true));
            }
        }

        let plan = self.classifier.classify(question).await.map_err(|error| error.0)?;
        if let Some(key) = key {
            self.plan_cache.write().await.insert(key, plan.clone());
        }
        Ok((plan, false))
    }

    fn clarify(&self, mut run: QueryRun<'_>, reason: String) -> QueryResponse {
        run.settle(QueryEvent::ClassificationFailed);
        info!(
            event_name = "query.clarification_requested",
            correlation_id = %run.correlation_id,
            reason = %reason,
            "question needs clarification"
        );
        QueryResponse {
            correlation_id: run.correlation_id,
            question: run.question,
            status: QueryStatus::Clarification,
            state: run.state,
            answer_text: None,
            rows: Vec::new(),
            plan_summary: None,
            clarification: Some(format!(
                "I could not interpret the question ({reason}). Try naming a record type \
                 such as meetings, conversations, emails, product usage or leads, a time \
                 window such as \"this week\", a company domain, or a metric."
            )),
            failure: Some(QueryFailure {
                kind: QueryFailureKind::ClassificationUnavailable,
                reason,
            }),
        }
    }

    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<ResultRow>, QueryFailure> {
        let filters = plan.filters.clone();
        let limit = plan.limit.unwrap_or(self.config.result_limit).min(self.config.result_limit);

        match plan.intent {
            QueryIntent::Lookup | QueryIntent::Aggregate => {
                let query = CatalogQuery {
                    filters,
                    aggregation: plan.aggregation.clone(),
                    limit: Some(limit),
                };
                let result = self.query_catalog(&query).await?;
                Ok(catalog_rows(result, &plan.target_fields, limit))
            }
            QueryIntent::SimilaritySearch => {
                let hits = self.similar(plan).await?;
                let ids: Vec<_> = hits.iter().map(|hit| hit.event_id.clone()).collect();
                let entries = self
                    .with_storage_retry("get_catalog_many", || self.storage.get_catalog_many(&ids))
                    .await?;
                Ok(merge(hits, entries, &plan.target_fields, limit))
            }
            QueryIntent::Hybrid => {
                let query = CatalogQuery { filters, aggregation: None, limit: None };
                let CatalogQueryResult::Entries(entries) = self.query_catalog(&query).await? else {
                    return Ok(Vec::new());
                };
                let hits = match self.similar(plan).await {
                    Ok(hits) => hits,
                    Err(failure) if failure.kind == QueryFailureKind::EmbeddingUnavailable => {
                        warn!(
                            event_name = "query.similarity_degraded",
                            reason = %failure.reason,
                            "embedding unavailable; answering from the catalog only"
                        );
                        let result = CatalogQueryResult::Entries(entries);
                        return Ok(catalog_rows(result, &plan.target_fields, limit));
                    }
                    Err(failure) => return Err(failure),
                };
                let matched: HashSet<_> = entries.iter().map(|e| e.event_id.clone()).collect();
                let hits = hits.into_iter().filter(|hit| matched.contains(&hit.event_id)).collect();
                Ok(merge(hits, entries, &plan.target_fields, limit))
            }
        }
    }

    async fn query_catalog(
        &self,
        query: &CatalogQuery,
    ) -> Result<CatalogQueryResult, QueryFailure> {
        self.with_storage_retry("query_catalog", || self.storage.query_catalog(query)).await
    }

    async fn similar(&self, plan: &QueryPlan) -> Result<Vec<SimilarityHit>, QueryFailure> {
        let vector = match &plan.similarity_query {
            Some(vector) => vector.clone(),
            None => {
                let text = plan.similarity_text.as_deref().unwrap_or_default();
                self.embedder.embed(text).await.map_err(|error| QueryFailure {
                    kind: QueryFailureKind::EmbeddingUnavailable,
                    reason: error.to_string(),
                })?
            }
        };

        // Hybrid questions widen the candidate set because the catalog narrows it later.
        let top_k = match plan.intent {
            QueryIntent::Hybrid => self.config.similarity_top_k.max(self.config.result_limit),
            _ => self.config.similarity_top_k,
        };
        let hits = self
            .with_storage_retry("similarity_search", || {
                self.storage.similarity_search(&vector, top_k)
            })
            .await?;
        Ok(hits.into_iter().filter(|hit| hit.score >= self.config.min_similarity_score).collect())
    }

    /// A timed-out storage call is retried once after a backoff, then surfaced.
    async fn with_storage_retry<T, F, Fut>(
        &self,
        operation: &str,
        call: F,
    ) -> Result<T, QueryFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        for attempt in 1..=2 {
            match tokio::time::timeout(self.config.storage_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(StorageError::Timeout(_))) | Err(_) if attempt == 1 => {
                    warn!(
                        event_name = "query.storage_timeout",
                        operation = operation,
                        "storage call timed out; retrying once"
                    );
                    tokio::time::sleep(self.config.storage_retry_backoff).await;
                }
                Ok(Err(StorageError::Timeout(_))) | Err(_) => break,
                Ok(Err(error)) => {
                    return Err(QueryFailure {
                        kind: QueryFailureKind::Storage,
                        reason: error.to_string(),
                    });
                }
            }
        }
        Err(QueryFailure {
            kind: QueryFailureKind::StorageTimeout,
            reason: format!("storage timed out during {operation}"),
        })
    }
}

fn new_correlation_id() -> String {
    format!("qry-{}", Uuid::new_v4())
}

fn normalize_question(question: &str) -> String {
    question.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn catalog_rows(
    result: CatalogQueryResult,
    target_fields: &[String],
    limit: usize,
) -> Vec<ResultRow> {
    match result {
        CatalogQueryResult::Entries(entries) => entries
            .iter()
            .take(limit)
            .map(|entry| entry_row(entry, None, target_fields))
            .collect(),
        CatalogQueryResult::Aggregate(aggregate) => aggregate_rows(aggregate),
    }
}

fn aggregate_rows(aggregate: AggregateResult) -> Vec<ResultRow> {
    let label = aggregate.aggregation.to_string();
    aggregate
        .groups
        .into_iter()
        .map(|group| {
            let mut fields = FieldMap::new();
            fields.insert("aggregation".to_string(), Value::String(label.clone()));
            fields.insert("key".to_string(), group.key);
            fields.insert("value".to_string(), json!(group.value));
            fields.insert("count".to_string(), json!(group.count));
            ResultRow { event_id: None, score: None, fields }
        })
        .collect()
}

/// Joins similarity hits with their catalog entries. Hits arrive best first; each event
/// id appears once and hits without a catalog entry are dropped.
fn merge(
    hits: Vec<SimilarityHit>,
    entries: Vec<CatalogEntry>,
    target_fields: &[String],
    limit: usize,
) -> Vec<ResultRow> {
    let by_id: HashMap<_, _> =
        entries.iter().map(|entry| (entry.event_id.clone(), entry)).collect();
    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for hit in hits {
        let Some(entry) = by_id.get(&hit.event_id) else {
            continue;
        };
        if seen.insert(hit.event_id.clone()) {
            rows.push(entry_row(entry, Some(hit.score), target_fields));
        }
    }
    rows.truncate(limit);
    rows
}

fn entry_row(entry: &CatalogEntry, score: Option<f32>, target_fields: &[String]) -> ResultRow {
    let mut fields = FieldMap::new();
    fields.insert("event_type".to_string(), json!(entry.event_type.as_str()));
    fields.insert("partition_key".to_string(), json!(entry.partition_key.0));
    fields.insert("occurred_at".to_string(), json!(entry.occurred_at.to_rfc3339()));

    if target_fields.is_empty() {
        fields.extend(entry.fields.iter().map(|(key, value)| (key.clone(), value.clone())));
    } else {
        for field in target_fields {
            if let Some(value) = entry.field(field) {
                fields.insert(field.clone(), value);
            }
        }
    }
    ResultRow { event_id: Some(entry.event_id.clone()), score, fields }
}
