//! Circuit breaker state machine.
//!
//! ```text
//! CLOSED --failure_threshold failures--> OPEN --timeout--> HALF_OPEN
//!    ^                                    ^                    |
//!    |                                    +------failure-------+
//!    +---------------success_threshold successes---------------+
//! ```
//!
//! The breaker is a plain value; its owner serializes access. Every
//! mutator returns the state it transitioned into, if any, so the owner
//! can notify observers after releasing its lock. The OPEN timeout is
//! checked lazily by [`CircuitBreaker::check_timeout`]; nothing fires it
//! in the background.

use crate::config::CircuitBreakerConfig;
use std::fmt;
use tokio::time::Instant;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Letting probes through.
    HalfOpen,
}

impl CircuitState {
    /// Returns true if attempts must be rejected.
    pub fn rejects_attempts(&self) -> bool {
        matches!(self, CircuitState::Open)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Consecutive-failure circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_state_change_time: Instant,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change_time: now,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Returns true while failing fast.
    pub fn is_open(&self) -> bool {
        self.state.rejects_attempts()
    }

    /// Consecutive failures.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Consecutive half-open successes.
    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    /// When the last stamped failure happened.
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    /// When the breaker last changed state.
    pub fn last_state_change_time(&self) -> Instant {
        self.last_state_change_time
    }

    /// Breaker thresholds.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Records a successful operation.
    pub fn record_success(&mut self, now: Instant) -> Option<CircuitState> {
        self.failure_count = 0;

        if self.state == CircuitState::HalfOpen {
            self.success_count += 1;
            if self.success_count >= self.config.success_threshold {
                return Some(self.transition(CircuitState::Closed, now));
            }
        }

        None
    }

    /// Records a failed operation.
    ///
    /// Opens a closed breaker at `failure_threshold`, and re-opens a
    /// half-open one on any failure. A failure observed while already open
    /// comes from an attempt that was in flight before the breaker opened;
    /// it pushes the cool-down out (see [`CircuitBreaker::check_timeout`]).
    pub fn record_failure(&mut self, now: Instant) -> Option<CircuitState> {
        self.count_failure();
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                Some(self.transition(CircuitState::Open, now))
            }
            CircuitState::HalfOpen => Some(self.transition(CircuitState::Open, now)),
            _ => None,
        }
    }

    /// Counts a rejected attempt against the breaker.
    ///
    /// Unlike [`CircuitBreaker::record_failure`] this does not stamp
    /// `last_failure_time`, so callers hammering an open breaker cannot
    /// keep it open forever.
    pub fn record_rejection(&mut self) {
        self.count_failure();
    }

    /// Moves an open breaker to half-open once the cool-down has elapsed.
    ///
    /// The cool-down runs from the later of the transition into OPEN and
    /// the last failure stamped while open.
    pub fn check_timeout(&mut self, now: Instant) -> Option<CircuitState> {
        if self.state != CircuitState::Open {
            return None;
        }

        let since = match self.last_failure_time {
            Some(failed) if failed > self.last_state_change_time => failed,
            _ => self.last_state_change_time,
        };

        if now.saturating_duration_since(since) >= self.config.timeout {
            Some(self.transition(CircuitState::HalfOpen, now))
        } else {
            None
        }
    }

    /// Forces the breaker closed.
    pub fn reset(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_state_change_time = now;
    }

    fn count_failure(&mut self) {
        self.success_count = 0;
        self.failure_count = self.failure_count.saturating_add(1);
    }

    fn transition(&mut self, state: CircuitState, now: Instant) -> CircuitState {
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => self.success_count = 0,
        }
        self.state = state;
        self.last_state_change_time = now;
        state
    }
}
