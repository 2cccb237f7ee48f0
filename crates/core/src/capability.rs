//! Narrow interfaces for externally provided capabilities. Concrete
//! implementations are chosen once at process startup and passed around as
//! `Arc<dyn ...>`.

use async_trait::async_trait;

use crate::domain::query::{QueryPlan, ResultRow};
use crate::errors::{ClassificationUnavailable, EmbeddingUnavailable};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Fixed dimensionality of every vector this provider returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingUnavailable>;
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Version tag of the backend. Plans are only cached when this is `Some`.
    fn version(&self) -> Option<String>;

    async fn classify(&self, question: &str) -> Result<QueryPlan, ClassificationUnavailable>;
}

/// Optional prose formatting of a structured answer.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, question: &str, rows: &[ResultRow]) -> Option<String>;
}
