use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::backoff::{RequeuePolicy, RetryBackoffConfig};
use crate::partition::PartitionStrategy;

/// Per-campaign scheduling policy.
///
/// Controls how discovered repositories are partitioned and how many
/// work units may be in flight at once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingPolicy {
    /// How the repository list is cut into batches.
    pub strategy: PartitionStrategy,
    /// Batch size or batch count, depending on `strategy`. Ignored for `none`.
    pub batch_size: i64,
    /// Maximum number of simultaneously non-terminal work units.
    pub parallelism: usize,
    /// Seconds the execution substrate keeps a finished execution. When set,
    /// work-unit retention is this value plus the safety buffer.
    pub retention_seconds: Option<i64>,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            strategy: PartitionStrategy::None,
            batch_size: 0,
            parallelism: 1,
            retention_seconds: None,
        }
    }
}

impl SchedulingPolicy {
    /// Create a policy with the given strategy and size.
    pub fn new(strategy: PartitionStrategy, batch_size: i64) -> Self {
        Self {
            strategy,
            batch_size,
            ..Self::default()
        }
    }

    /// Set the parallelism ceiling.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the execution retention override.
    pub fn with_retention_seconds(mut self, seconds: i64) -> Self {
        self.retention_seconds = Some(seconds);
        self
    }
}

/// How long terminal work units are kept before automatic cleanup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Retention when no override is configured.
    pub default_window_secs: i64,
    /// Added to an explicit override so the record outlives the execution.
    pub safety_buffer_secs: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            default_window_secs: 2 * 60 * 60,
            safety_buffer_secs: 30 * 60,
        }
    }
}

impl RetentionPolicy {
    /// Retention window for a record with the given override.
    pub fn window(&self, retention_override_secs: Option<i64>) -> Duration {
        match retention_override_secs {
            Some(secs) => saturating_seconds(secs.max(0).saturating_add(self.safety_buffer_secs)),
            None => saturating_seconds(self.default_window_secs),
        }
    }
}

fn saturating_seconds(secs: i64) -> Duration {
    Duration::try_seconds(secs).unwrap_or(Duration::MAX)
}

/// Configuration for the controller runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum number of reconcile targets processed concurrently.
    pub worker_count: usize,
    /// Interval between full resyncs in milliseconds.
    pub resync_interval_ms: u64,
    /// Buffer size of the lifecycle event bus.
    pub event_capacity: usize,
    /// Read-modify-write attempts before a conflict is surfaced.
    pub max_conflict_retries: u32,
    /// Requeue delays for healthy passes.
    pub requeue: RequeuePolicy,
    /// Backoff for retryable errors.
    pub retry: RetryBackoffConfig,
    /// Terminal work-unit retention.
    pub retention: RetentionPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            resync_interval_ms: 5 * 60 * 1000,
            event_capacity: 1024,
            max_conflict_retries: 5,
            requeue: RequeuePolicy::default(),
            retry: RetryBackoffConfig::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Set the reconcile concurrency.
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    /// Set the resync interval.
    pub fn with_resync_interval(mut self, ms: u64) -> Self {
        self.resync_interval_ms = ms;
        self
    }

    /// Set the requeue policy.
    pub fn with_requeue(mut self, requeue: RequeuePolicy) -> Self {
        self.requeue = requeue;
        self
    }

    /// Set the retry backoff.
    pub fn with_retry(mut self, retry: RetryBackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_defaults_to_two_hours() {
        let retention = RetentionPolicy::default();
        assert_eq!(retention.window(None), Duration::hours(2));
    }

    #[test]
    fn retention_override_adds_buffer() {
        let retention = RetentionPolicy::default();
        assert_eq!(
            retention.window(Some(3600)),
            Duration::hours(1) + Duration::minutes(30)
        );
        assert_eq!(retention.window(Some(-5)), Duration::minutes(30));
    }

    #[test]
    fn oversized_retention_saturates() {
        let retention = RetentionPolicy::default();
        assert_eq!(retention.window(Some(10_000_000_000_000_000)), Duration::MAX);
        assert_eq!(retention.window(Some(i64::MAX)), Duration::MAX);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: SchedulingPolicy =
            serde_json::from_str(r#"{"strategy":"fixed-batch-size","batchSize":2}"#).unwrap();
        assert_eq!(policy.strategy, PartitionStrategy::FixedBatchSize);
        assert_eq!(policy.batch_size, 2);
        assert_eq!(policy.parallelism, 1);
        assert_eq!(policy.retention_seconds, None);
    }

    #[test]
    fn worker_count_never_zero() {
        let config = ControllerConfig::default().with_worker_count(0);
        assert_eq!(config.worker_count, 1);
    }
}
