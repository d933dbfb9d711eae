//! Configuration for the synchronization core.
//!
//! Durations serialize as whole milliseconds so hosts can keep these in
//! their own JSON/TOML settings.

use crate::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts per `retry` invocation, including the first.
    pub max_attempts: u32,
    /// Delay before the first reattempt.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on the backoff before jitter.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to spread delays over `[0.5, 1.5)` of the backoff.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("must be >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        Ok(())
    }

    /// Delay to wait before the reattempt following `retry_count` failures
    /// (0-indexed: the first reattempt uses `retry_count = 0`).
    ///
    /// `initial_delay * backoff_multiplier^retry_count`, capped at
    /// `max_delay`. With jitter the capped value is scaled by a uniform
    /// factor in `[0.5, 1.5)`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let capped = self.backoff_nanos(retry_count);

        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_nanos((capped * factor) as u64)
        } else {
            Duration::from_nanos(capped as u64)
        }
    }

    fn backoff_nanos(&self, retry_count: u32) -> f64 {
        let initial = self.initial_delay.as_nanos() as f64;
        let max = self.max_delay.as_nanos() as f64;
        if initial == 0.0 {
            return 0.0;
        }

        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let exponential = initial * self.backoff_multiplier.powi(exponent);
        exponential.min(max)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Cool-down before an open breaker lets a probe through.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Creates a breaker configuration.
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold < 1 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.success_threshold < 1 {
            return Err(ConfigError::invalid("success_threshold", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(5, 2, Duration::from_secs(60))
    }
}

/// Configuration for a [`RetryEngine`](crate::RetryEngine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Retry behavior.
    pub retry: RetryConfig,
    /// Breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl RecoveryConfig {
    /// Bundles retry and breaker configuration.
    pub fn new(retry: RetryConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
        Self {
            retry,
            circuit_breaker,
        }
    }

    /// Checks both halves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()
    }
}

/// Configuration for the [`EventDispatcher`](crate::EventDispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Whether inbound handlers are bound at all.
    pub enabled: bool,
    /// Maximum number of undelivered outbound events kept while offline.
    pub offline_queue_size: usize,
    /// Delivery failures after which a queued event becomes conflicted.
    pub retry_attempts: u32,
}

impl DispatcherConfig {
    /// Sets the offline queue bound.
    pub fn with_offline_queue_size(mut self, size: usize) -> Self {
        self.offline_queue_size = size;
        self
    }

    /// Sets the per-item delivery attempts.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Enables or disables handler binding.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offline_queue_size < 1 {
            return Err(ConfigError::invalid("offline_queue_size", "must be at least 1"));
        }
        if self.retry_attempts < 1 {
            return Err(ConfigError::invalid("retry_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offline_queue_size: 50,
            retry_attempts: 3,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
