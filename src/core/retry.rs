//! Retry policies shared by every IAM call site
//!
//! A [`RetryPolicy`] describes the budget (attempt count or cumulative
//! backoff), and a [`Backoff`] walks it: delays start at the initial backoff,
//! double each time, and are capped per iteration. The read path, the write
//! conflict loop and the propagation check only differ in which predicate
//! classifies an error as retryable and which budget applies.

use crate::error::{IamError, Result};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Backoff budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First delay
    pub initial_backoff: Duration,
    /// Cap applied to every single delay
    pub max_backoff: Duration,
    /// Total attempts of the operation, including the first one
    pub max_attempts: Option<u32>,
    /// Cumulative delay after which the budget is exhausted
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Unbounded policy; add a budget with `with_max_attempts` or `with_max_elapsed`
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            initial_backoff,
            max_backoff,
            max_attempts: None,
            max_elapsed: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = Some(elapsed);
        self
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial_backoff,
            retries: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// One walk through a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    next: Duration,
    retries: u32,
    elapsed: Duration,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.policy.max_attempts {
            if self.retries + 1 >= max_attempts {
                return None;
            }
        }

        let delay = self.next.min(self.policy.max_backoff);
        if let Some(max_elapsed) = self.policy.max_elapsed {
            if self.elapsed + delay > max_elapsed {
                return None;
            }
        }

        self.elapsed += delay;
        self.retries += 1;
        self.next = self.next.saturating_mul(2).min(self.policy.max_backoff);
        Some(delay)
    }

    /// Sleep for the next delay; false when the budget is spent
    pub fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                thread::sleep(delay);
                true
            }
            None => false,
        }
    }

    /// Retries granted so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Sum of the delays granted so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Classifies an error as retryable, returning the reason
pub type RetryErrorPredicate = fn(&IamError) -> Option<String>;

/// Predicates applied to every retried call
pub const DEFAULT_RETRY_PREDICATES: &[RetryErrorPredicate] = &[
    is_transport_error,
    is_common_retryable_code,
    is_409_operation_in_progress,
    is_403_quota_exceeded_per_minute,
    is_empty_policy_response,
];

pub fn is_transport_error(err: &IamError) -> Option<String> {
    match err.root() {
        IamError::Timeout(_) => Some("marked as timeout".to_string()),
        IamError::Network(msg) => Some(format!("network error: {}", msg)),
        _ => None,
    }
}

pub fn is_common_retryable_code(err: &IamError) -> Option<String> {
    match err.code() {
        Some(code @ (429 | 500 | 502 | 503)) => Some(format!("Retryable error code {}", code)),
        _ => None,
    }
}

/// Some APIs answer concurrent calls with a 409 that only needs waiting out
pub fn is_409_operation_in_progress(err: &IamError) -> Option<String> {
    match err.root() {
        IamError::Api { code: 409, message } if message.contains("operationInProgress") => {
            Some("Operation still in progress".to_string())
        }
        _ => None,
    }
}

/// Rate limits reported as 403 instead of 429
pub fn is_403_quota_exceeded_per_minute(err: &IamError) -> Option<String> {
    if err.code() != Some(403) {
        return None;
    }
    err.quota_limit()
        .map(|limit| format!("Waiting for quota limit {} to refresh", limit))
}

/// The API occasionally answers a read with no policy at all
pub fn is_empty_policy_response(err: &IamError) -> Option<String> {
    match err.root() {
        IamError::EmptyPolicy(_) => Some("empty policy response".to_string()),
        _ => None,
    }
}

/// First matching predicate's reason
pub fn is_retryable(err: &IamError, predicates: &[RetryErrorPredicate]) -> Option<String> {
    predicates.iter().find_map(|predicate| predicate(err))
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's budget is spent (the last error is returned)
pub fn retry<T, F>(policy: &RetryPolicy, predicates: &[RetryErrorPredicate], mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut backoff = policy.backoff();
    loop {
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(reason) = is_retryable(&err, predicates) else {
            return Err(err);
        };

        match backoff.next_delay() {
            Some(delay) => {
                debug!("Retrying after {:?} ({}): {}", delay, reason, err);
                thread::sleep(delay);
            }
            None => {
                debug!(
                    "Retry budget exhausted after {} retries ({}): {}",
                    backoff.retries(),
                    reason,
                    err
                );
                return Err(err);
            }
        }
    }
}
