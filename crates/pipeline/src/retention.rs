//! Periodic log retention. Records older than the retention window, or beyond the
//! per-partition record cap, are deleted and partition low watermarks advance, so
//! consumers that fell behind surface `OffsetOutOfRange` instead of reading forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use gtmlake_db::repositories::{LogError, PartitionLog, RetentionReport};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionTotals {
    pub sweeps: u64,
    pub failed_sweeps: u64,
    pub removed_records: u64,
    pub partitions_advanced: u64,
}

pub struct RetentionTask {
    log: Arc<dyn PartitionLog>,
    interval: Duration,
}

impl RetentionTask {
    pub fn new(log: Arc<dyn PartitionLog>, interval: Duration) -> Self {
        Self { log, interval }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RetentionReport, LogError> {
        let report = self.log.enforce_retention(now).await?;
        if report.removed_records > 0 || report.partitions_advanced > 0 {
            info!(
                event_name = "pipeline.retention.swept",
                removed_records = report.removed_records,
                partitions_advanced = report.partitions_advanced,
                "expired log records removed"
            );
        } else {
            debug!(event_name = "pipeline.retention.idle", "nothing past retention");
        }
        Ok(report)
    }

    /// Sweeps once per interval until `shutdown` flips. A failed sweep is logged and
    /// retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RetentionTotals {
        let mut totals = RetentionTotals::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            totals.sweeps += 1;
            match self.sweep(Utc::now()).await {
                Ok(report) => {
                    totals.removed_records += report.removed_records;
                    totals.partitions_advanced += report.partitions_advanced;
                }
                Err(error) => {
                    totals.failed_sweeps += 1;
                    warn!(
                        event_name = "pipeline.retention.failed",
                        error = %error,
                        "retention sweep failed"
                    );
                }
            }
        }

        info!(
            event_name = "pipeline.retention.stopped",
            sweeps = totals.sweeps,
            removed_records = totals.removed_records,
            "retention task stopped"
        );
        totals
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::watch;

    use gtmlake_db::repositories::{PartitionLog, RetentionPolicy, SqlPartitionLog};

    use super::RetentionTask;
    use crate::processor::tests::calendar;
    use crate::test_support::setup_pool;

    fn capped_log(pool: gtmlake_db::DbPool) -> Arc<dyn PartitionLog> {
        Arc::new(SqlPartitionLog::new(pool).with_retention(RetentionPolicy {
            max_age: Duration::from_secs(3600),
            max_records: 1,
        }))
    }

    #[tokio::test]
    async fn running_task_advances_the_low_watermark_until_shutdown() {
        let log = capped_log(setup_pool().await);
        for event_id in ["cal-1", "cal-2", "cal-3"] {
            log.publish(&calendar(event_id, "acme.com", "CTO")).await.expect("publish");
        }
        let topics = vec!["gtm.calendar_events".to_string()];

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(
            RetentionTask::new(Arc::clone(&log), Duration::from_millis(10)).run(shutdown_rx),
        );

        let mut low_watermark = 0;
        for _ in 0..100 {
            let partitions = log.partitions(&topics).await.expect("partitions");
            low_watermark = partitions[0].low_watermark;
            if low_watermark == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).expect("signal shutdown");
        let totals = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task stops on shutdown")
            .expect("join");

        assert_eq!(low_watermark, 2);
        assert!(totals.sweeps >= 1);
        assert_eq!(totals.removed_records, 2);
        assert_eq!(totals.failed_sweeps, 0);
    }

    #[tokio::test]
    async fn single_sweep_reports_removed_records() {
        let log = capped_log(setup_pool().await);
        log.publish(&calendar("cal-1", "acme.com", "CTO")).await.expect("publish");
        log.publish(&calendar("cal-2", "acme.com", "CTO")).await.expect("publish");
        let task = RetentionTask::new(Arc::clone(&log), Duration::from_secs(60));

        let first = task.sweep(Utc::now()).await.expect("sweep");
        let second = task.sweep(Utc::now()).await.expect("sweep again");

        assert_eq!(first.removed_records, 1);
        assert_eq!(first.partitions_advanced, 1);
        assert_eq!(second.removed_records, 0);
    }
}
