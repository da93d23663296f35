use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the runtime should do with a target after a reconcile pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Reconcile the target again after the delay.
    Requeue(Duration),
    /// Nothing to do until something else triggers the target.
    AwaitChange,
}

impl Action {
    /// Requeue after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    /// Do not requeue.
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// The requeue delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Requeue(delay) => Some(*delay),
            Self::AwaitChange => None,
        }
    }
}

/// Requeue delays for passes that completed without error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeuePolicy {
    /// After an admission pass created new work units.
    pub after_admission_secs: u64,
    /// While a work unit is pending or running.
    pub while_active_secs: u64,
    /// When a campaign has nothing in flight and nothing left to admit.
    pub idle_secs: u64,
    /// Upper bound on the wait for a terminal work unit's retention.
    pub max_terminal_wait_secs: u64,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            after_admission_secs: 10,
            while_active_secs: 30,
            idle_secs: 5 * 60,
            max_terminal_wait_secs: 60 * 60,
        }
    }
}

impl RequeuePolicy {
    /// Short re-check after new work was created.
    pub fn after_admission(&self) -> Action {
        Action::Requeue(Duration::from_secs(self.after_admission_secs))
    }

    /// Medium re-check while work is in flight.
    pub fn while_active(&self) -> Action {
        Action::Requeue(Duration::from_secs(self.while_active_secs))
    }

    /// Long re-check for an idle campaign.
    pub fn idle(&self) -> Action {
        Action::Requeue(Duration::from_secs(self.idle_secs))
    }

    /// Re-check a terminal work unit when its retention runs out.
    ///
    /// A non-positive remainder asks for an immediate pass.
    pub fn until_retention_expires(&self, remaining: chrono::Duration) -> Action {
        let remaining = remaining.to_std().unwrap_or(Duration::ZERO);
        let cap = Duration::from_secs(self.max_terminal_wait_secs);
        Action::Requeue(remaining.min(cap))
    }
}

/// Exponential backoff for retryable reconcile errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoffConfig {
    /// Delay for the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

/// Computes the delay before retrying a failed pass.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff)
///
/// # Arguments
/// * `attempts` - Consecutive failed passes for the target, including this one
/// * `config` - The backoff configuration
pub fn compute_retry_delay(attempts: u32, config: &RetryBackoffConfig) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }

    let exp = attempts.saturating_sub(1).min(63) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);

    Duration::from_millis(capped.max(0.0) as u64)
}
