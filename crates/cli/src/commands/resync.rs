use gtmlake_pipeline::resync;

use crate::commands::{with_components, CommandResult, EXIT_OPERATION};

/// Rebuilds catalog and vector entries from the raw store, then moves the consumer
/// group past anything retention already removed.
pub fn run() -> CommandResult {
    with_components("resync", |components| async move {
        let group = components.config.processor.consumer_group.clone();
        let processor = components.processor();

        match resync(&group, components.log.as_ref(), components.storage.as_ref(), &processor)
            .await
        {
            Ok(report) => CommandResult::success_with(
                "resync",
                format!(
                    "rebuilt {} record(s) for `{group}`, reset {} offset(s), skipped {}",
                    report.records_rebuilt,
                    report.offsets_reset,
                    report.skipped.len()
                ),
                report,
            ),
            Err(error) => {
                CommandResult::failure("resync", "resync_failed", error.to_string(), EXIT_OPERATION)
            }
        }
    })
}
