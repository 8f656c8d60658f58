//! Configuration for the IAM reconciliation engine
//!
//! All values have production defaults and can be overridden from TOML:
//!
//! ```toml
//! [retry]
//! read_attempts = 10
//! initial_backoff_ms = 1000
//!
//! [batching]
//! enable_batching = true
//! send_after_ms = 3000
//! ```

use crate::error::{IamError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IamConfig {
    /// Backoff budgets for reads, writes and propagation checks
    pub retry: RetryConfig,

    /// Request batching for policy mutations
    pub batching: BatchingConfig,
}

impl IamConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: IamConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Replace the retry settings
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the batching settings
    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    /// Check that every budget is usable
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.batching.validate()
    }
}

/// Retry and backoff budgets
///
/// Backoff always starts at `initial_backoff_ms` and doubles; a single sleep
/// never exceeds `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for a policy read (and for quota retries inside a write cycle)
    pub read_attempts: u32,

    /// First backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Per-iteration backoff cap in milliseconds
    pub max_backoff_ms: u64,

    /// Cumulative backoff allowed for 409 conflicts before giving up
    pub conflict_ceiling_ms: u64,

    /// Reads used to confirm that a write has propagated
    pub confirm_attempts: u32,

    /// Cumulative backoff allowed while waiting for propagation
    pub propagation_ceiling_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            read_attempts: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            conflict_ceiling_ms: 30_000,
            confirm_attempts: 3,
            propagation_ceiling_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Scale every delay down to the given initial backoff, keeping the
    /// doubling ratios of the defaults
    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        let initial_ms = initial.as_millis().max(1) as u64;
        let base_ms = self.initial_backoff_ms.max(1);
        let factor = |ms: u64| ms.saturating_mul(initial_ms) / base_ms;
        self.max_backoff_ms = factor(self.max_backoff_ms);
        self.conflict_ceiling_ms = factor(self.conflict_ceiling_ms);
        self.propagation_ceiling_ms = factor(self.propagation_ceiling_ms);
        self.initial_backoff_ms = initial_ms;
        self
    }

    /// Set the number of read attempts
    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }

    /// Set the number of propagation confirmation reads
    pub fn with_confirm_attempts(mut self, attempts: u32) -> Self {
        self.confirm_attempts = attempts;
        self
    }

    fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Bounded-attempt policy for read-with-retry
    pub fn read_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.initial_backoff(), self.max_backoff())
            .with_max_attempts(self.read_attempts)
    }

    /// Bounded-attempt policy for 429s inside a read-modify-write cycle
    pub fn quota_policy(&self) -> RetryPolicy {
        self.read_policy()
    }

    /// Cumulative-time policy for 409 conflicts
    pub fn conflict_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.initial_backoff(), self.max_backoff())
            .with_max_elapsed(Duration::from_millis(self.conflict_ceiling_ms))
    }

    /// Cumulative-time policy for propagation confirmation
    pub fn propagation_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.initial_backoff(), self.max_backoff())
            .with_max_elapsed(Duration::from_millis(self.propagation_ceiling_ms))
    }

    fn validate(&self) -> Result<()> {
        if self.read_attempts == 0 {
            return Err(IamError::Config(
                "retry.read_attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms == 0 {
            return Err(IamError::Config(
                "retry.initial_backoff_ms must be positive".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(IamError::Config(format!(
                "retry.max_backoff_ms ({}) is below retry.initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        if self.confirm_attempts == 0 {
            return Err(IamError::Config(
                "retry.confirm_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request batching settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// When false every request is sent on its own, immediately
    pub enable_batching: bool,

    /// How long a batch stays open for new requests, in milliseconds
    pub send_after_ms: u64,

    /// Upper bound on a whole batched operation, in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            enable_batching: true,
            send_after_ms: 3_000,
            request_timeout_ms: 30 * 60 * 1_000,
        }
    }
}

impl BatchingConfig {
    /// Disable batching
    pub fn disabled() -> Self {
        BatchingConfig {
            enable_batching: false,
            ..Self::default()
        }
    }

    /// Set the batch window
    pub fn with_send_after(mut self, send_after: Duration) -> Self {
        self.send_after_ms = send_after.as_millis() as u64;
        self
    }

    /// Set the overall request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn send_after(&self) -> Duration {
        Duration::from_millis(self.send_after_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(IamError::Config(
                "batching.request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
