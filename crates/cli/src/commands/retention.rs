use chrono::Utc;

use crate::commands::{with_components, CommandResult, EXIT_DATABASE};

/// One retention sweep with the configured window and per-partition cap.
pub fn run() -> CommandResult {
    with_components("retention", |components| async move {
        match components.retention_task().sweep(Utc::now()).await {
            Ok(report) => CommandResult::success_with(
                "retention",
                format!(
                    "removed {} expired record(s), advanced {} partition(s)",
                    report.removed_records, report.partitions_advanced
                ),
                report,
            ),
            Err(error) => {
                CommandResult::failure("retention", "persistence", error.to_string(), EXIT_DATABASE)
            }
        }
    })
}
