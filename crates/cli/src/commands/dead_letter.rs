use chrono::Utc;
use gtmlake_pipeline::{replay_dead_letter, ReplayError};
use serde::Serialize;

use gtmlake_core::processing::DeadLetterRecord;

use crate::commands::{with_components, CommandResult, EXIT_DATABASE, EXIT_OPERATION};

#[derive(Debug, Serialize)]
struct DeadLetterSummary {
    id: String,
    event_id: String,
    consumer_group: String,
    topic: String,
    partition_key: String,
    offset: u64,
    error_class: String,
    reason: String,
    attempts: u32,
    failed_at: String,
    replayed_at: Option<String>,
}

impl From<DeadLetterRecord> for DeadLetterSummary {
    fn from(record: DeadLetterRecord) -> Self {
        Self {
            id: record.id,
            event_id: record.event_id.0,
            consumer_group: record.consumer_group,
            topic: record.topic,
            partition_key: record.partition_key.0,
            offset: record.offset,
            error_class: record.error_class,
            reason: record.reason,
            attempts: record.attempts,
            failed_at: record.failed_at.to_rfc3339(),
            replayed_at: record.replayed_at.map(|at| at.to_rfc3339()),
        }
    }
}

pub fn list(include_replayed: bool, limit: u32) -> CommandResult {
    with_components("dead-letter list", |components| async move {
        let records = match components.dead_letters.list(!include_replayed, limit).await {
            Ok(records) => records,
            Err(error) => {
                return CommandResult::failure(
                    "dead-letter list",
                    "persistence",
                    error.to_string(),
                    EXIT_DATABASE,
                )
            }
        };
        let summaries: Vec<DeadLetterSummary> =
            records.into_iter().map(DeadLetterSummary::from).collect();
        CommandResult::success_with(
            "dead-letter list",
            format!("{} dead letter(s)", summaries.len()),
            summaries,
        )
    })
}

pub fn replay(id: &str) -> CommandResult {
    with_components("dead-letter replay", |components| async move {
        let outcome = replay_dead_letter(
            id,
            components.dead_letters.as_ref(),
            components.log.as_ref(),
            Utc::now(),
        )
        .await;

        match outcome {
            Ok(outcome) => CommandResult::success_with(
                "dead-letter replay",
                format!("republished `{}` to {} at offset {}", id, outcome.topic, outcome.offset),
                outcome,
            ),
            Err(error) => {
                let (class, exit_code) = match &error {
                    ReplayError::NotFound(_) => ("not_found", EXIT_OPERATION),
                    ReplayError::AlreadyReplayed(_) => ("already_replayed", EXIT_OPERATION),
                    ReplayError::Repository(_) | ReplayError::Log(_) => {
                        ("persistence", EXIT_DATABASE)
                    }
                };
                CommandResult::failure("dead-letter replay", class, error.to_string(), exit_code)
            }
        }
    })
}
