//! Retry and dead-letter policy for stream processors.
//!
//! Transient failures are retried with exponential backoff until the attempt
//! budget is spent; permanent failures go straight to the dead-letter sink.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::event::{Envelope, EventId, PartitionKey};
use crate::errors::ProcessingError;

/// Configuration for processor retries
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: u32,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, `0.0` disables it
    pub jitter_ratio: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            backoff_multiplier: 2,
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    DeadLetter,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Decides what happens after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &ProcessingError) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_attempts() {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::RetryAfter(self.with_jitter(self.backoff(attempt)))
    }

    /// Un-jittered delay before retry number `attempt`: `base * multiplier^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.config.backoff_multiplier.max(1).saturating_pow(exponent);
        self.config.base_delay.saturating_mul(factor).min(self.config.max_delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.config.jitter_ratio;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        (delay + Duration::from_secs_f64(extra)).min(self.config.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryPolicyConfig::default())
    }
}

/// Terminal record of an envelope that could not be processed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub event_id: EventId,
    pub consumer_group: String,
    pub topic: String,
    pub partition_key: PartitionKey,
    pub offset: u64,
    pub envelope: Envelope,
    pub error_class: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    pub fn new(
        consumer_group: impl Into<String>,
        offset: u64,
        envelope: Envelope,
        error: &ProcessingError,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: envelope.event_id.clone(),
            consumer_group: consumer_group.into(),
            topic: envelope.topic().to_string(),
            partition_key: envelope.partition_key.clone(),
            offset,
            error_class: error.class().to_string(),
            reason: error.reason().to_string(),
            attempts,
            envelope,
            failed_at: Utc::now(),
            replayed_at: None,
        }
    }
}
