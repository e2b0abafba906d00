//! Count-based circuit breaker
//!
//! The breaker keeps a ring buffer of the most recent call outcomes. Once the
//! buffer holds at least `minimum_number_of_calls` outcomes, the failure rate
//! over the buffer is recomputed after every recorded outcome; reaching
//! `failure_rate_threshold` opens the circuit. An open circuit rejects calls
//! until `wait_duration_in_open_state` has elapsed, then admits a bounded
//! number of trial calls in the half-open state. A successful trial closes
//! the circuit, a failed one reopens it.
//!
//! All state lives behind a single mutex, so permission checks, outcome
//! recording and state transitions are atomic with respect to each other.
//!
//! Callers only ever see the `permit`/`record` contract: either through a
//! [`CallPermit`] guard obtained from [`CircuitBreaker::acquire`], or through
//! the [`CircuitBreaker::call`] and [`CircuitBreaker::execute`] helpers.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};

//==============================================================================
// Error Types
//==============================================================================

/// A call was rejected by the circuit breaker without being executed
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Circuit breaker '{name}' is {state} and does not permit further calls")]
pub struct CallNotPermitted {
    /// Name of the rejecting breaker
    pub name: String,
    /// State the breaker was in when it rejected the call
    pub state: CircuitState,
    /// Time remaining until the breaker admits trial calls, if known
    pub retry_after: Option<Duration>,
}

/// Errors produced by the [`CircuitBreaker::call`] and
/// [`CircuitBreaker::execute`] helpers
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error(transparent)]
    CircuitOpen(#[from] CallNotPermitted),

    /// The underlying operation failed
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

//==============================================================================
// State and configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Aggregate outcome of one protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call completed normally
    Success,
    /// The call failed and counts toward the failure rate
    Failure,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes kept in the sliding window
    pub sliding_window_size: u32,
    /// Outcomes required in the window before the failure rate is evaluated
    pub minimum_number_of_calls: u32,
    /// Failure rate, in percent, at or above which the circuit opens
    pub failure_rate_threshold: f32,
    /// Time to wait before transitioning from open to half-open
    pub wait_duration_in_open_state: Duration,
    /// Maximum number of concurrent trial calls in half-open state
    pub permitted_calls_in_half_open_state: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open_state: 10,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sliding_window_size == 0 {
            return Err(ConfigError::invalid(
                "sliding_window_size",
                "must be greater than 0",
            ));
        }

        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::invalid(
                "minimum_number_of_calls",
                "must be greater than 0",
            ));
        }

        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::invalid(
                "failure_rate_threshold",
                format!("must be in (0, 100], got {}", self.failure_rate_threshold),
            ));
        }

        if self.permitted_calls_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                "permitted_calls_in_half_open_state",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Outcomes needed before the failure rate is evaluated
    ///
    /// A minimum larger than the window is capped at the window size.
    fn effective_minimum_calls(&self) -> usize {
        self.minimum_number_of_calls.min(self.sliding_window_size) as usize
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn permitted_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_calls_in_half_open_state = calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Outcomes currently held in the sliding window
    pub buffered_calls: u32,
    /// Failures currently held in the sliding window
    pub failed_calls: u32,
    /// Failure rate in percent, `None` until the minimum number of calls is
    /// buffered
    pub failure_rate: Option<f32>,
    /// Calls rejected since creation
    pub not_permitted_calls: u64,
}

//==============================================================================
// Sliding window
//==============================================================================

#[derive(Debug)]
struct SlidingWindow {
    outcomes: VecDeque<CallOutcome>,
    capacity: usize,
    failures: usize,
}

impl SlidingWindow {
    fn new(capacity: u32) -> Self {
        let capacity = capacity as usize;
        Self { outcomes: VecDeque::with_capacity(capacity), capacity, failures: 0 }
    }

    fn push(&mut self, outcome: CallOutcome) {
        if self.outcomes.len() == self.capacity {
            if let Some(CallOutcome::Failure) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        if outcome == CallOutcome::Failure {
            self.failures += 1;
        }
        self.outcomes.push_back(outcome);
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_rate(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures as f32 * 100.0 / self.outcomes.len() as f32
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    window: SlidingWindow,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition; permits granted under an older
    /// generation no longer affect trial bookkeeping
    generation: u64,
}

/// What a permit was granted under
#[derive(Debug, Clone, Copy)]
struct Grant {
    generation: u64,
    trial: bool,
}

//==============================================================================
// Circuit breaker
//==============================================================================

/// Generic circuit breaker implementation
///
/// Cloning is cheap and yields a handle to the same breaker.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerState>>,
    not_permitted: Arc<AtomicU64>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
            not_permitted: Arc::clone(&self.not_permitted),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;

        let name: String = name.into();
        Ok(Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: SlidingWindow::new(config.sliding_window_size),
                opened_at: None,
                half_open_in_flight: 0,
                generation: 0,
            })),
            config: Arc::new(config),
            not_permitted: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(clock),
        })
    }

    /// Name used to identify this breaker in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask whether a call may proceed
    ///
    /// An open circuit whose wait duration has elapsed moves to half-open
    /// here. In half-open state a granted permission occupies one trial slot
    /// until the next transition; prefer [`CircuitBreaker::acquire`], whose
    /// guard hands the slot back.
    pub fn try_acquire_permission(&self) -> Result<(), CallNotPermitted> {
        self.grant().map(drop)
    }

    /// Acquire a permission guard
    ///
    /// The guard records nothing if dropped without an outcome; it only
    /// releases its half-open trial slot.
    pub fn acquire(&self) -> Result<CallPermit<C>, CallNotPermitted> {
        let grant = self.grant()?;
        Ok(CallPermit { breaker: self.clone(), grant, completed: false })
    }

    /// Record the aggregate outcome of a call
    ///
    /// Outcomes recorded this way are not tied to a permit: in half-open
    /// state any of them decides the trial.
    pub fn record_outcome(&self, outcome: CallOutcome) {
        let mut inner = self.inner.lock();
        self.apply_outcome(&mut inner, outcome);
    }

    /// Record a successful call
    pub fn on_success(&self) {
        self.record_outcome(CallOutcome::Success);
    }

    /// Record a failed call
    pub fn on_error(&self) {
        self.record_outcome(CallOutcome::Failure);
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get circuit breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let buffered = inner.window.len();
        let failure_rate = (buffered >= self.config.effective_minimum_calls())
            .then(|| inner.window.failure_rate());

        CircuitBreakerMetrics {
            state: inner.state,
            buffered_calls: buffered as u32,
            failed_calls: inner.window.failures as u32,
            failure_rate,
            not_permitted_calls: self.not_permitted.load(Ordering::Acquire),
        }
    }

    /// Reset the circuit breaker to closed state with an empty window
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        info!(breaker = %self.name, "Circuit breaker manually reset to closed state");
    }

    /// Execute a synchronous operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.acquire()?;
        match operation() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(source) => {
                permit.failure();
                Err(ResilienceError::OperationFailed { source })
            }
        }
    }

    /// Execute an async operation with circuit breaker protection
    ///
    /// Dropping the returned future before it completes releases the
    /// permission without recording an outcome.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(source) => {
                permit.failure();
                Err(ResilienceError::OperationFailed { source })
            }
        }
    }

    fn reject(&self, inner: &BreakerState, retry_after: Option<Duration>) -> CallNotPermitted {
        self.not_permitted.fetch_add(1, Ordering::AcqRel);
        debug!(breaker = %self.name, state = %inner.state, "Circuit breaker rejecting call");
        CallNotPermitted { name: self.name.to_string(), state: inner.state, retry_after }
    }

    fn grant(&self) -> Result<Grant, CallNotPermitted> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let now = self.clock.now();
            let elapsed = inner.opened_at.map_or(Duration::MAX, |at| now.duration_since(at));
            if elapsed >= self.config.wait_duration_in_open_state {
                self.transition(&mut inner, CircuitState::HalfOpen);
            } else {
                return Err(self.reject(
                    &inner,
                    Some(self.config.wait_duration_in_open_state - elapsed),
                ));
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(Grant { generation: inner.generation, trial: false }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.permitted_calls_in_half_open_state {
                    inner.half_open_in_flight += 1;
                    Ok(Grant { generation: inner.generation, trial: true })
                } else {
                    Err(self.reject(&inner, None))
                }
            }
            CircuitState::Open => Err(self.reject(&inner, None)),
        }
    }

    /// Give back a trial slot whose call finished without an outcome
    fn release(&self, grant: Grant) {
        let mut inner = self.inner.lock();
        if grant.trial && grant.generation == inner.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn record_granted(&self, grant: Grant, outcome: CallOutcome) {
        let mut inner = self.inner.lock();
        if grant.generation != inner.generation {
            debug!(
                breaker = %self.name,
                ?outcome,
                state = %inner.state,
                "Ignoring outcome of a call permitted before the last transition"
            );
            return;
        }
        self.apply_outcome(&mut inner, outcome);
    }

    fn apply_outcome(&self, inner: &mut BreakerState, outcome: CallOutcome) {
        match inner.state {
            CircuitState::Closed => {
                inner.window.push(outcome);
                let buffered = inner.window.len();
                if buffered >= self.config.effective_minimum_calls() {
                    let failure_rate = inner.window.failure_rate();
                    if failure_rate >= self.config.failure_rate_threshold {
                        warn!(
                            breaker = %self.name,
                            failure_rate,
                            buffered_calls = buffered,
                            "Circuit breaker failure rate exceeded threshold"
                        );
                        self.transition(inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                match outcome {
                    CallOutcome::Success => self.transition(inner, CircuitState::Closed),
                    CallOutcome::Failure => self.transition(inner, CircuitState::Open),
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, ?outcome, "Ignoring outcome recorded while open");
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.half_open_in_flight = 0;
        inner.generation = inner.generation.wrapping_add(1);
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(self.clock.now());
                inner.window.clear();
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
        if from != to {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state transition");
        }
    }
}

/// Permission to run one call through a [`CircuitBreaker`]
///
/// Consume it with [`CallPermit::success`], [`CallPermit::failure`] or
/// [`CallPermit::record`]. Dropping it unconsumed releases the permission.
#[must_use = "dropping a permit without recording an outcome discards the call"]
///
/// A permit belongs to the breaker state it was granted in. If the breaker
/// transitions while the call runs, its outcome is ignored.
pub struct CallPermit<C: Clock = SystemClock> {
    breaker: CircuitBreaker<C>,
    grant: Grant,
    completed: bool,
}

impl<C: Clock> CallPermit<C> {
    pub fn success(self) {
        self.record(CallOutcome::Success);
    }

    pub fn failure(self) {
        self.record(CallOutcome::Failure);
    }

    pub fn record(mut self, outcome: CallOutcome) {
        self.completed = true;
        self.breaker.record_granted(self.grant, outcome);
    }
}

impl<C: Clock> fmt::Debug for CallPermit<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.name())
            .field("trial", &self.grant.trial)
            .finish()
    }
}

impl<C: Clock> Drop for CallPermit<C> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release(self.grant);
        }
    }
}
