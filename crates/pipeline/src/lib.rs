//! Pipeline runtime: everything between the ingestion boundary and the storage
//! layer, plus the read path that answers questions against it.
//!
//! # Write path
//!
//! 1. **Ingestion** (`ingest`) - normalize a raw payload and publish it to the log
//! 2. **Processing** (`processor`) - semantic checks, derived fields, entities, embedding
//! 3. **Workers** (`worker`) - own partitions, retry or dead-letter failures, store
//!    raw then catalog then vector, and only then commit the offset
//! 4. **Resync** (`resync`) - rebuild catalog and vectors from the raw store after a
//!    consumer group fell behind retention
//! 5. **Retention** (`retention`) - periodically drop expired log records and advance
//!    partition low watermarks
//!
//! # Read path
//!
//! `runtime::QueryRuntime` classifies a question into a plan, executes it against the
//! catalog and vector index, merges and ranks the results, and always answers with a
//! structured response.
//!
//! Capabilities (`embedding`, `classifier`) are chosen once at startup and injected
//! as trait objects. `assembly::Components` does that wiring from `AppConfig`.

pub mod assembly;
pub mod classifier;
pub mod embedding;
pub mod ingest;
pub mod processor;
pub mod resync;
pub mod retention;
pub mod runtime;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use assembly::Components;
pub use classifier::KeywordIntentClassifier;
pub use embedding::{build_embedder, DisabledEmbedder, HashingEmbedder};
pub use ingest::{IngestError, IngestReceipt, IngestionService};
pub use processor::EnrichmentProcessor;
pub use resync::{replay_dead_letter, resync, ReplayError, ReplayOutcome, ResyncError, ResyncReport};
pub use retention::{RetentionTask, RetentionTotals};
pub use runtime::{QueryRuntime, QueryRuntimeConfig};
pub use worker::{PartitionWorker, WorkerError, WorkerStats};
