use std::fs;
use std::io::{self, Read};
use std::path::Path;

use gtmlake_core::domain::event::EventType;
use gtmlake_pipeline::{IngestError, IngestReceipt};
use serde::Serialize;
use serde_json::Value;

use crate::commands::{with_components, CommandResult, EXIT_OPERATION};

#[derive(Debug, Serialize)]
struct Rejection {
    index: usize,
    field: String,
    reason: String,
}

#[derive(Debug, Default, Serialize)]
struct IngestSummary {
    published: usize,
    duplicates: usize,
    receipts: Vec<IngestReceipt>,
    rejected: Vec<Rejection>,
}

/// Ingests one JSON object, or every element of a JSON array, from `source`
/// (`-` reads stdin). Invalid payloads are reported and skipped.
pub fn run(event_type: &str, source: &Path) -> CommandResult {
    let Some(event_type) = EventType::parse(event_type) else {
        let expected: Vec<_> = EventType::ALL.iter().map(EventType::as_str).collect();
        return CommandResult::failure(
            "ingest",
            "invalid_input",
            format!("unknown event type `{event_type}` (expected {})", expected.join("|")),
            EXIT_OPERATION,
        );
    };
    let payloads = match read_payloads(source) {
        Ok(payloads) => payloads,
        Err(message) => {
            return CommandResult::failure("ingest", "invalid_input", message, EXIT_OPERATION)
        }
    };

    with_components("ingest", |components| async move {
        let service = components.ingestion();
        let mut summary = IngestSummary::default();

        for (index, payload) in payloads.iter().enumerate() {
            match service.ingest(payload, event_type).await {
                Ok(receipt) => {
                    if receipt.duplicate {
                        summary.duplicates += 1;
                    } else {
                        summary.published += 1;
                    }
                    summary.receipts.push(receipt);
                }
                Err(IngestError::Validation(error)) => summary.rejected.push(Rejection {
                    index,
                    field: error.field,
                    reason: error.reason,
                }),
                Err(error @ IngestError::Log(_)) => {
                    return CommandResult::failure_with(
                        "ingest",
                        "persistence",
                        error.to_string(),
                        EXIT_OPERATION,
                        summary,
                    );
                }
            }
        }

        let message = format!(
            "published {} {} event(s), {} duplicate(s), {} rejected",
            summary.published,
            event_type,
            summary.duplicates,
            summary.rejected.len()
        );
        if summary.rejected.is_empty() {
            CommandResult::success_with("ingest", message, summary)
        } else {
            CommandResult::failure_with("ingest", "validation", message, EXIT_OPERATION, summary)
        }
    })
}

fn read_payloads(source: &Path) -> Result<Vec<Value>, String> {
    let raw = if source == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|error| format!("failed to read stdin: {error}"))?;
        buffer
    } else {
        fs::read_to_string(source)
            .map_err(|error| format!("failed to read `{}`: {error}", source.display()))?
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(object @ Value::Object(_)) => Ok(vec![object]),
        Ok(_) => Err("expected a JSON object or an array of objects".to_string()),
        Err(error) => Err(format!("invalid JSON: {error}")),
    }
}
