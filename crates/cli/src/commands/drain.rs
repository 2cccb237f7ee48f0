use crate::commands::{with_components, CommandResult, EXIT_OPERATION};

/// Processes whatever is on the log right now, up to `max_records`, then releases
/// the partition leases and returns.
pub fn run(max_records: usize) -> CommandResult {
    with_components("drain", |components| async move {
        let worker_id = components.config.processor.worker_id.clone();
        let consumer_group = components.config.processor.consumer_group.clone();
        let mut worker = components.worker(&worker_id);

        let outcome = worker.run_once(max_records).await;
        if let Err(error) = worker.release().await {
            tracing::warn!(
                event_name = "cli.drain.release_failed",
                consumer_group = %consumer_group,
                error = %error,
                "could not release partition leases"
            );
        }

        match outcome {
            Ok(stats) => CommandResult::success_with(
                "drain",
                format!(
                    "processed {} record(s), dead-lettered {}",
                    stats.processed, stats.dead_lettered
                ),
                stats,
            ),
            Err(error) => {
                let hint = if error.requires_resync() {
                    "; run `gtmlake resync` to rebuild from the raw store"
                } else {
                    ""
                };
                let error = error.into_application(&consumer_group);
                CommandResult::failure(
                    "drain",
                    error.error_class(),
                    format!("{error}{hint}"),
                    EXIT_OPERATION,
                )
            }
        }
    })
}
