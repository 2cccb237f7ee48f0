use gtmlake_core::domain::query::QueryStatus;

use crate::commands::{with_components, CommandResult, EXIT_OPERATION};

/// Answers `question` and prints the structured response. A clarification request is
/// a successful answer; a failed query exits non-zero.
pub fn run(question: &str) -> CommandResult {
    with_components("ask", |components| async move {
        let response = components.query_runtime().ask(question).await;

        match response.status {
            QueryStatus::Answered => {
                let message = format!("{} row(s)", response.rows.len());
                CommandResult::success_with("ask", message, response)
            }
            QueryStatus::Clarification => {
                let message =
                    response.clarification.clone().unwrap_or_else(|| "clarification needed".into());
                CommandResult::success_with("ask", message, response)
            }
            QueryStatus::Failed => {
                let (class, reason) = match &response.failure {
                    Some(failure) => (failure.kind.as_str(), failure.reason.clone()),
                    None => ("query_failed", "query failed".to_string()),
                };
                CommandResult::failure_with("ask", class, reason, EXIT_OPERATION, response)
            }
        }
    })
}
