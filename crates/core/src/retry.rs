//! Retry strategies: decide whether and when a failed job runs again.
//!
//! The standard strategy mixes three waits:
//!
//! ```text
//! total_wait = wait + linear_wait * attempts + exponential_wait ^ (attempts + 1)
//! ```
//!
//! where `attempts` is the number of completed previous runs (0 on the first
//! failure).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::task_error::TaskError;

/// When and how a job should be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    /// The job is not fetched before this instant.
    pub retry_at: DateTime<Utc>,
    /// New priority, unchanged when `None`.
    pub priority: Option<i32>,
    /// New queue, unchanged when `None`.
    pub queue: Option<String>,
    /// New lock, unchanged when `None`.
    pub lock: Option<String>,
}

impl RetryDecision {
    pub fn at(retry_at: DateTime<Utc>) -> Self {
        Self {
            retry_at,
            priority: None,
            queue: None,
            lock: None,
        }
    }

    pub fn retry_in(now: DateTime<Utc>, delay: Duration) -> Self {
        Self::at(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }
}

/// A retry strategy.
///
/// Implement `schedule_in` for simple delay-based policies, or override
/// `retry_decision` to also move the job to another queue/priority/lock.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Seconds to wait before the next run, `None` to stop retrying.
    fn schedule_in(&self, _error: &TaskError, _attempts: i32) -> Option<u64> {
        None
    }

    fn retry_decision(
        &self,
        error: &TaskError,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Option<RetryDecision> {
        let seconds = self.schedule_in(error, job.attempts)?;
        Some(RetryDecision::retry_in(now, seconds_to_duration(seconds)))
    }
}

/// Constant / linear / exponential wait with optional attempt cap and
/// failure-kind filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Maximum number of runs (`None` or `Some(0)` = unlimited)
    pub max_attempts: Option<u32>,
    /// Constant wait in seconds
    pub wait: u64,
    /// Added once per previous attempt
    pub linear_wait: u64,
    /// Raised to the power `attempts + 1`
    pub exponential_wait: u64,
    /// Only failures of these kinds are retried (`None` = all)
    pub retry_exceptions: Option<Vec<String>>,
}

impl RetryStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_wait(mut self, seconds: u64) -> Self {
        self.wait = seconds;
        self
    }

    pub fn with_linear_wait(mut self, seconds: u64) -> Self {
        self.linear_wait = seconds;
        self
    }

    pub fn with_exponential_wait(mut self, seconds: u64) -> Self {
        self.exponential_wait = seconds;
        self
    }

    pub fn with_retry_exceptions<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_exceptions = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Total wait for a job that already ran `attempts` times.
    pub fn wait_for(&self, attempts: u32) -> u64 {
        let linear = self.linear_wait.saturating_mul(u64::from(attempts));
        let exponential = self.exponential_wait.saturating_pow(attempts.saturating_add(1));
        self.wait.saturating_add(linear).saturating_add(exponential)
    }
}

impl RetryPolicy for RetryStrategy {
    fn schedule_in(&self, error: &TaskError, attempts: i32) -> Option<u64> {
        let attempts = u32::try_from(attempts).unwrap_or(0);
        if let Some(max) = self.max_attempts.filter(|max| *max > 0) {
            if attempts >= max {
                return None;
            }
        }
        if let Some(kinds) = &self.retry_exceptions {
            if !kinds.iter().any(|kind| kind == error.kind()) {
                return None;
            }
        }
        Some(self.wait_for(attempts))
    }
}

/// Shorthand accepted wherever a task's retry behaviour is configured.
#[derive(Debug, Clone, Default)]
pub enum RetryValue {
    /// Never retry
    #[default]
    Disabled,
    /// Retry forever, immediately
    Forever,
    /// Retry immediately up to this many runs
    MaxAttempts(u32),
    Policy(Arc<dyn RetryPolicy>),
}

impl RetryValue {
    pub fn into_policy(self) -> Option<Arc<dyn RetryPolicy>> {
        match self {
            RetryValue::Disabled => None,
            RetryValue::Forever => Some(Arc::new(RetryStrategy::new())),
            RetryValue::MaxAttempts(0) => None,
            RetryValue::MaxAttempts(max) => {
                Some(Arc::new(RetryStrategy::new().with_max_attempts(max)))
            }
            RetryValue::Policy(policy) => Some(policy),
        }
    }
}

impl From<bool> for RetryValue {
    fn from(value: bool) -> Self {
        if value { RetryValue::Forever } else { RetryValue::Disabled }
    }
}

impl From<u32> for RetryValue {
    fn from(value: u32) -> Self {
        RetryValue::MaxAttempts(value)
    }
}

impl From<RetryStrategy> for RetryValue {
    fn from(value: RetryStrategy) -> Self {
        RetryValue::Policy(Arc::new(value))
    }
}

impl From<Arc<dyn RetryPolicy>> for RetryValue {
    fn from(value: Arc<dyn RetryPolicy>) -> Self {
        RetryValue::Policy(value)
    }
}

fn seconds_to_duration(seconds: u64) -> Duration {
    let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
    Duration::try_seconds(seconds).unwrap_or(Duration::MAX)
}
