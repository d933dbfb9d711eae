//! Retry engine guarded by a circuit breaker.

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::RecoveryConfig;
use crate::error::{ConfigError, RecoveryError, RecoveryResult};
use crate::registry::{ErrorInfo, ErrorRegistry};
use crate::scheduler::schedule_after;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vizsync_protocol::Severity;

type ErrorCallback = Box<dyn Fn(&ErrorInfo) + Send + Sync>;
type BreakerCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Observers notified synchronously at each state change.
#[derive(Default)]
pub struct RecoveryObservers {
    on_error: Option<ErrorCallback>,
    on_retry: Option<ErrorCallback>,
    on_circuit_breaker_change: Option<BreakerCallback>,
}

impl RecoveryObservers {
    /// Creates an empty observer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called whenever an error is recorded.
    pub fn on_error(mut self, f: impl Fn(&ErrorInfo) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called whenever a reattempt is scheduled.
    pub fn on_retry(mut self, f: impl Fn(&ErrorInfo) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Called with `true` when the breaker opens and `false` when it closes.
    pub fn on_circuit_breaker_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_circuit_breaker_change = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for RecoveryObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryObservers")
            .field("on_error", &self.on_error.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field(
                "on_circuit_breaker_change",
                &self.on_circuit_breaker_change.is_some(),
            )
            .finish()
    }
}

/// Runs fallible asynchronous operations with backoff, behind a breaker.
///
/// Each engine owns exactly one [`CircuitBreaker`] and one
/// [`ErrorRegistry`]. Attempts for the same id never overlap: a second
/// `retry` for an id waits until the first one finishes.
pub struct RetryEngine {
    config: RecoveryConfig,
    breaker: Mutex<CircuitBreaker>,
    registry: ErrorRegistry,
    observers: RecoveryObservers,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RetryEngine {
    /// Creates an engine without observers.
    pub fn new(config: RecoveryConfig) -> Result<Self, ConfigError> {
        Self::with_observers(config, RecoveryObservers::default())
    }

    /// Creates an engine that reports to `observers`.
    pub fn with_observers(
        config: RecoveryConfig,
        observers: RecoveryObservers,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone(), Instant::now());

        Ok(Self {
            config,
            breaker: Mutex::new(breaker),
            registry: ErrorRegistry::new(),
            observers,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, attempts run out, or the breaker
    /// rejects it.
    pub async fn retry<T, E, F, Fut>(&self, id: &str, operation: F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.retry_with(id, operation, |_| {}, |_| {}).await
    }

    /// Like [`RetryEngine::retry`], reporting the outcome to `on_success` or
    /// `on_failure`. `on_failure` is not called when the pending reattempt
    /// was cancelled through [`RetryEngine::clear_error`].
    pub async fn retry_with<T, E, F, Fut, S, X>(
        &self,
        id: &str,
        mut operation: F,
        on_success: S,
        on_failure: X,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        S: FnOnce(&T),
        X: FnOnce(&RecoveryError),
    {
        let slot = self.slot(id);
        let guard = slot.lock().await;
        let result = self.run(id, &mut operation).await;
        drop(guard);
        self.release_slot(id, &slot);

        match &result {
            Ok(value) => on_success(value),
            Err(err) if err.is_terminal() => on_failure(err),
            Err(_) => {}
        }
        result
    }

    async fn run<T, E, F, Fut>(&self, id: &str, operation: &mut F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.check_circuit_timeout();

        if self.breaker.lock().is_open() {
            let err = RecoveryError::CircuitOpen { id: id.to_string() };
            warn!(id, "rejecting attempt, circuit breaker is open");
            self.record(id, err.to_string(), Severity::Critical, None, BreakerSignal::Rejection);
            return Err(err);
        }

        let max_attempts = self.config.retry.max_attempts;
        let mut retry_count = 0u32;

        loop {
            match operation().await {
                Ok(value) => {
                    self.registry.remove(id);
                    let transition = self.breaker.lock().record_success(Instant::now());
                    self.notify_transition(transition);
                    debug!(id, retry_count, "operation succeeded");
                    return Ok(value);
                }
                Err(failure) => {
                    let message = failure.to_string();
                    let attempts = retry_count + 1;
                    let transition = self.breaker.lock().record_failure(Instant::now());
                    self.notify_transition(transition);

                    if attempts >= max_attempts {
                        let err = RecoveryError::MaxAttemptsExceeded {
                            id: id.to_string(),
                            attempts,
                            last_error: message,
                        };
                        warn!(id, attempts, error = %err, "retries exhausted");

                        let mut context = Map::new();
                        context.insert("retryCount".into(), Value::from(attempts));
                        self.registry.release_timer(id);
                        self.record_error(id, &err, Severity::Critical, Some(context));
                        return Err(err);
                    }

                    let delay = self.config.retry.delay_for_retry(retry_count);
                    let now = Instant::now();
                    let info = self
                        .registry
                        .note_retry(id, &message, attempts, now, now + delay);
                    if let Some(on_retry) = &self.observers.on_retry {
                        on_retry(&info);
                    }
                    debug!(
                        id,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "scheduling retry"
                    );

                    let (task, fired) = schedule_after(delay);
                    self.registry.track_timer(id, task);
                    if fired.wait().await.is_err() {
                        debug!(id, "scheduled retry cancelled");
                        return Err(RecoveryError::Cancelled { id: id.to_string() });
                    }
                    self.registry.release_timer(id);
                    retry_count = attempts;
                }
            }
        }
    }

    /// Records an error for `id`, counting it as a breaker failure.
    pub fn record_error(
        &self,
        id: &str,
        error: impl fmt::Display,
        severity: Severity,
        context: Option<Map<String, Value>>,
    ) {
        self.record(id, error.to_string(), severity, context, BreakerSignal::Failure);
    }

    fn record(
        &self,
        id: &str,
        error: String,
        severity: Severity,
        context: Option<Map<String, Value>>,
        signal: BreakerSignal,
    ) {
        let info = ErrorInfo::new(id, error, severity, Instant::now(), context);
        self.registry.record(info.clone());

        let transition = {
            let mut breaker = self.breaker.lock();
            match signal {
                BreakerSignal::Failure => breaker.record_failure(Instant::now()),
                BreakerSignal::Rejection => {
                    breaker.record_rejection();
                    None
                }
            }
        };
        self.notify_transition(transition);

        if let Some(on_error) = &self.observers.on_error {
            on_error(&info);
        }
        debug!(id, severity = %info.severity, error = %info.error, "error recorded");
    }

    /// Forgets the error for `id` and cancels its scheduled reattempt.
    pub fn clear_error(&self, id: &str) {
        self.registry.remove(id);
    }

    /// Forgets every error and cancels every scheduled reattempt.
    pub fn clear_all_errors(&self) {
        self.registry.clear();
    }

    /// Forces the breaker closed.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.lock().reset(Instant::now());
        info!("circuit breaker reset to CLOSED");
        if let Some(on_change) = &self.observers.on_circuit_breaker_change {
            on_change(false);
        }
    }

    /// Runs the lazy OPEN → HALF_OPEN timeout check.
    pub fn check_circuit_timeout(&self) {
        let transition = self.breaker.lock().check_timeout(Instant::now());
        self.notify_transition(transition);
    }

    /// Current breaker state, without running the timeout check.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state()
    }

    /// Returns true while the breaker fails fast.
    pub fn is_circuit_breaker_open(&self) -> bool {
        self.breaker.lock().is_open()
    }

    /// Copy of the breaker record.
    pub fn breaker_snapshot(&self) -> CircuitBreaker {
        self.breaker.lock().clone()
    }

    /// Error for `id`.
    pub fn get_error(&self, id: &str) -> Option<ErrorInfo> {
        self.registry.get(id)
    }

    /// Every recorded error.
    pub fn all_errors(&self) -> HashMap<String, ErrorInfo> {
        self.registry.all()
    }

    /// Number of recorded errors.
    pub fn error_count(&self) -> usize {
        self.registry.count()
    }

    /// Returns true if any recorded error is critical.
    pub fn has_critical_errors(&self) -> bool {
        self.registry.has_critical_errors()
    }

    /// Returns true if a reattempt for `id` is waiting on its timer.
    pub fn has_scheduled_retry(&self, id: &str) -> bool {
        self.registry.has_pending_timer(id)
    }

    fn notify_transition(&self, transition: Option<CircuitState>) {
        let Some(state) = transition else {
            return;
        };

        let is_open = match state {
            CircuitState::Open => {
                info!("circuit breaker OPENED due to repeated failures");
                true
            }
            CircuitState::Closed => {
                info!("circuit breaker CLOSED after successful recovery");
                false
            }
            CircuitState::HalfOpen => {
                info!("circuit breaker transitioning to HALF_OPEN");
                return;
            }
        };

        if let Some(on_change) = &self.observers.on_circuit_breaker_change {
            on_change(is_open);
        }
    }

    fn slot(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.in_flight.lock().entry(id.to_string()).or_default())
    }

    fn release_slot(&self, id: &str, slot: &Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        // One reference in the map, one held by the caller.
        if Arc::strong_count(slot) <= 2 {
            in_flight.remove(id);
        }
    }
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("config", &self.config)
            .field("breaker", &*self.breaker.lock())
            .field("errors", &self.registry.count())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum BreakerSignal {
    Failure,
    Rejection,
}
