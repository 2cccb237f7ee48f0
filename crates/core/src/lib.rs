pub mod canonical;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod enrich;
pub mod errors;
pub mod flows;
pub mod processing;
pub mod similarity;

pub use canonical::Canonicalizer;
pub use capability::{AnswerGenerator, EmbeddingProvider, IntentClassifier};
pub use domain::event::{Envelope, EventId, EventPayload, EventType, PartitionKey};
pub use domain::query::{
    Aggregation, CatalogQuery, CatalogQueryResult, Predicate, QueryIntent, QueryPlan,
    QueryResponse, QueryStatus, ResultRow, TimeWindow,
};
pub use domain::record::{CatalogEntry, CatalogFields, EnrichedRecord, RawPointer, VectorEntry};
pub use errors::{
    ApplicationError, ClassificationUnavailable, EmbeddingUnavailable, InterfaceError,
    ProcessingError, ValidationError,
};
pub use flows::{QueryFlow, QueryState};
pub use processing::{DeadLetterRecord, RetryDecision, RetryPolicy, RetryPolicyConfig};
