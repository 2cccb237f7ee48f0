//! Consumer-group cursor over the partitioned log.
//!
//! A subscription resumes from the group's committed offsets, pulls batches from
//! every partition it may read, and hands records out one at a time in offset order
//! per partition. With a worker id configured it only reads partitions it holds a
//! lease on, so two workers in one group never process the same partition at once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use gtmlake_core::domain::event::PartitionKey;

use crate::repositories::{LogError, LogRecord, PartitionLease, PartitionLog};

type PartitionId = (String, PartitionKey);

#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    pub consumer_group: String,
    pub topics: Vec<String>,
    pub batch_size: u32,
    pub poll_interval: Duration,
    /// `Some((worker_id, lease_duration))` enables partition leases.
    pub ownership: Option<(String, Duration)>,
}

impl SubscriptionOptions {
    pub fn new(consumer_group: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            topics,
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            ownership: None,
        }
    }

    pub fn with_lease(mut self, worker_id: impl Into<String>, duration: Duration) -> Self {
        self.ownership = Some((worker_id.into(), duration));
        self
    }
}

pub struct Subscription {
    log: Arc<dyn PartitionLog>,
    options: SubscriptionOptions,
    cursors: BTreeMap<PartitionId, u64>,
    leases: HashMap<PartitionId, PartitionLease>,
    buffer: VecDeque<LogRecord>,
}

impl Subscription {
    pub fn new(log: Arc<dyn PartitionLog>, options: SubscriptionOptions) -> Self {
        Self {
            log,
            options,
            cursors: BTreeMap::new(),
            leases: HashMap::new(),
            buffer: VecDeque::new(),
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.options.consumer_group
    }

    /// Waits until a record is available. Lazy: nothing is read until called.
    pub async fn next(&mut self) -> Result<LogRecord, LogError> {
        loop {
            if let Some(record) = self.try_next().await? {
                return Ok(record);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Returns the next buffered record, refilling from the log when the buffer is empty.
    pub async fn try_next(&mut self) -> Result<Option<LogRecord>, LogError> {
        self.renew_expiring_leases().await?;
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Marks `record` processed for the group. Offsets past it will be read next.
    pub async fn commit(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let id = (record.topic.clone(), record.partition_key.clone());
        let lease = self.leases.get(&id).cloned();
        let result = self
            .log
            .commit_offset(
                &self.options.consumer_group,
                &record.topic,
                &record.partition_key,
                record.offset + 1,
                lease.as_ref(),
            )
            .await;

        if let Err(LogError::LeaseLost { .. }) = &result {
            warn!(
                event_name = "log.lease_lost",
                topic = %record.topic,
                partition_key = %record.partition_key,
                "partition lease lost during commit; dropping buffered records"
            );
            self.forget_partition(&id);
        }
        result
    }

    /// Releases every held lease so other workers can pick the partitions up at once.
    pub async fn close(&mut self) -> Result<(), LogError> {
        for (_, lease) in self.leases.drain() {
            self.log.release_lease(&lease).await?;
        }
        self.cursors.clear();
        self.buffer.clear();
        Ok(())
    }

    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut owned: Vec<PartitionId> = self.leases.keys().cloned().collect();
        owned.sort();
        owned
    }

    async fn refill(&mut self) -> Result<(), LogError> {
        let partitions = self.log.partitions(&self.options.topics).await?;

        for partition in partitions {
            let id = (partition.topic.clone(), partition.partition_key.clone());

            if !self.ensure_ownership(&id).await? {
                continue;
            }

            let from_offset = match self.cursors.get(&id) {
                Some(offset) => *offset,
                None => {
                    let committed = self
                        .log
                        .committed_offset(
                            &self.options.consumer_group,
                            &partition.topic,
                            &partition.partition_key,
                        )
                        .await?;
                    // A group that never committed starts at the earliest retained record.
                    let start = committed.unwrap_or(partition.low_watermark);
                    self.cursors.insert(id.clone(), start);
                    start
                }
            };
            if from_offset >= partition.next_offset {
                continue;
            }

            let records = self
                .log
                .fetch(&partition.topic, &partition.partition_key, from_offset, self.options.batch_size)
                .await?;
            if let Some(last) = records.last() {
                self.cursors.insert(id, last.offset + 1);
            }
            self.buffer.extend(records);
        }

        if !self.buffer.is_empty() {
            debug!(
                event_name = "log.batch_fetched",
                consumer_group = %self.options.consumer_group,
                records = self.buffer.len(),
                "fetched log batch"
            );
        }
        Ok(())
    }

    async fn ensure_ownership(&mut self, id: &PartitionId) -> Result<bool, LogError> {
        let Some((worker_id, duration)) = self.options.ownership.clone() else {
            return Ok(true);
        };
        if self.leases.contains_key(id) {
            return Ok(true);
        }

        let lease = self
            .log
            .acquire_lease(&self.options.consumer_group, &id.0, &id.1, &worker_id, duration)
            .await?;
        match lease {
            Some(lease) => {
                info!(
                    event_name = "log.lease_acquired",
                    topic = %id.0,
                    partition_key = %id.1,
                    epoch = lease.epoch,
                    worker_id = %worker_id,
                    "acquired partition lease"
                );
                // Another worker may have advanced the group while we did not own it.
                self.cursors.remove(id);
                self.leases.insert(id.clone(), lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn renew_expiring_leases(&mut self) -> Result<(), LogError> {
        let Some((worker_id, duration)) = self.options.ownership.clone() else {
            return Ok(());
        };
        let threshold = chrono::Duration::from_std(duration / 3)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let expiring: Vec<PartitionId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at - now <= threshold)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expiring {
            let renewed = self
                .log
                .acquire_lease(&self.options.consumer_group, &id.0, &id.1, &worker_id, duration)
                .await?;
            match renewed {
                Some(lease) if self.leases.get(&id).map(|held| held.epoch) == Some(lease.epoch) => {
                    self.leases.insert(id, lease);
                }
                _ => {
                    warn!(
                        event_name = "log.lease_lost",
                        topic = %id.0,
                        partition_key = %id.1,
                        "partition lease could not be renewed"
                    );
                    self.forget_partition(&id);
                }
            }
        }
        Ok(())
    }

    fn forget_partition(&mut self, id: &PartitionId) {
        self.leases.remove(id);
        self.cursors.remove(id);
        self.buffer.retain(|record| record.topic != id.0 || record.partition_key != id.1);
    }
}
