//! Retry executor with pluggable retry policies and backoff
//!
//! A [`Retry`] runs a unit of work, asks its [`RetryPolicy`] whether a failure
//! is worth another attempt, waits according to its [`Backoff`], and gives up
//! once `max_attempts` attempts have been made. On give-up the last error is
//! returned unchanged, so callers can still branch on the original error
//! kind.
//!
//! The same decision logic drives three shapes of execution:
//! - [`Retry::execute_blocking`] sleeps on the calling thread
//! - [`Retry::execute`] awaits the tokio timer
//! - [`RetryStream`](super::stream::RetryStream) resubscribes a stream factory

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::backoff::Backoff;
use crate::error::{ConfigError, ConfigResult, ErrorClassification};

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide whether the failed attempt `attempt` (0-based) should be
    /// retried, optionally overriding the backoff delay
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation with a custom delay
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Wait between attempts
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Backoff::default() }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than 0"));
        }

        if let super::backoff::BackoffStrategy::Exponential { multiplier, .. } =
            self.backoff.strategy
        {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(ConfigError::invalid(
                    "backoff.multiplier",
                    format!("must be a positive number, got {multiplier}"),
                ));
            }
        }

        Ok(())
    }

    /// Whether this configuration retries without an attempt bound
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == u32::MAX
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Retry until the work succeeds
    pub fn unbounded(mut self) -> Self {
        self.config.max_attempts = u32::MAX;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = Backoff::fixed(delay);
        self
    }

    pub fn exponential_backoff(
        mut self,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.backoff = Backoff::exponential(initial_delay, multiplier, max_delay);
        self
    }

    pub fn exponential_random_backoff(
        mut self,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.backoff = Backoff::exponential_random(initial_delay, multiplier, max_delay);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Outcome of a retry execution including result and summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Snapshot of the counters kept by a [`Retry`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

impl fmt::Display for RetryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryMetrics {{ ok: {}, ok_after_retry: {}, failed: {}, failed_after_retry: {} }}",
            self.successful_calls_without_retry,
            self.successful_calls_with_retry,
            self.failed_calls_without_retry,
            self.failed_calls_with_retry
        )
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextStep {
    Wait(Duration),
    GiveUp,
}

/// Retry executor
///
/// Cloning is cheap; clones share configuration, policy and metrics.
pub struct Retry<P> {
    name: Arc<str>,
    config: Arc<RetryConfig>,
    policy: Arc<P>,
    counters: Arc<RetryCounters>,
}

impl<P> Clone for Retry<P> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            policy: Arc::clone(&self.policy),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<P> fmt::Debug for Retry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry").field("name", &self.name).field("config", &self.config).finish()
    }
}

impl<P> Retry<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(name: impl Into<String>, config: RetryConfig, policy: P) -> ConfigResult<Self> {
        config.validate()?;
        let name: String = name.into();
        Ok(Self {
            name: Arc::from(name),
            config: Arc::new(config),
            policy: Arc::new(policy),
            counters: Arc::new(RetryCounters::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self
                .counters
                .successful_without_retry
                .load(Ordering::Acquire),
            successful_calls_with_retry: self.counters.successful_with_retry.load(Ordering::Acquire),
            failed_calls_without_retry: self.counters.failed_without_retry.load(Ordering::Acquire),
            failed_calls_with_retry: self.counters.failed_with_retry.load(Ordering::Acquire),
        }
    }

    /// Decide what follows failed attempt number `attempts` (1-based)
    pub(crate) fn next_step<E>(&self, error: &E, attempts: u32) -> NextStep
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
    {
        let attempt_index = attempts.saturating_sub(1);
        match self.policy.should_retry(error, attempt_index) {
            RetryDecision::Stop => {
                debug!(retry = %self.name, attempts, ?error, "Error is not retryable");
                NextStep::GiveUp
            }
            _ if attempts >= self.config.max_attempts => {
                warn!(
                    retry = %self.name,
                    attempts,
                    ?error,
                    "All retry attempts exhausted"
                );
                NextStep::GiveUp
            }
            RetryDecision::Retry => {
                let delay = self.config.backoff.delay_for(attempt_index);
                warn!(
                    retry = %self.name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    ?error,
                    "Attempt failed, retrying"
                );
                NextStep::Wait(delay)
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    retry = %self.name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    ?error,
                    "Attempt failed, retrying after requested delay"
                );
                NextStep::Wait(delay)
            }
        }
    }

    /// Count the aggregate result of one retried call
    pub(crate) fn record_result(&self, succeeded: bool, attempts: u32) {
        let counter = match (succeeded, attempts > 1) {
            (true, false) => &self.counters.successful_without_retry,
            (true, true) => &self.counters.successful_with_retry,
            (false, false) => &self.counters.failed_without_retry,
            (false, true) => &self.counters.failed_with_retry,
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Execute an operation on the calling thread, sleeping between attempts
    pub fn execute_blocking<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Result<T, E>,
    {
        self.execute_blocking_with_outcome(operation).into_result()
    }

    /// Blocking execution returning outcome statistics
    #[instrument(skip(self, operation), fields(retry = %self.name, max_attempts = self.config.max_attempts))]
    pub fn execute_blocking_with_outcome<F, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        loop {
            attempts = attempts.saturating_add(1);
            match operation() {
                Ok(value) => {
                    self.record_result(true, attempts);
                    return RetryOutcome { result: Ok(value), attempts, total_delay };
                }
                Err(error) => match self.next_step(&error, attempts) {
                    NextStep::GiveUp => {
                        self.record_result(false, attempts);
                        return RetryOutcome { result: Err(error), attempts, total_delay };
                    }
                    NextStep::Wait(delay) => {
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                        total_delay += delay;
                    }
                },
            }
        }
    }

    /// Execute an async operation, awaiting the tokio timer between attempts
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Async execution returning outcome statistics
    #[instrument(skip(self, operation), fields(retry = %self.name, max_attempts = self.config.max_attempts))]
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        loop {
            attempts = attempts.saturating_add(1);
            match operation().await {
                Ok(value) => {
                    self.record_result(true, attempts);
                    return RetryOutcome { result: Ok(value), attempts, total_delay };
                }
                Err(error) => match self.next_step(&error, attempts) {
                    NextStep::GiveUp => {
                        self.record_result(false, attempts);
                        return RetryOutcome { result: Err(error), attempts, total_delay };
                    }
                    NextStep::Wait(delay) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        total_delay += delay;
                    }
                },
            }
        }
    }
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Retries errors that classify themselves as retryable
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RetryOnRetryable;

    impl<E: ErrorClassification> RetryPolicy<E> for RetryOnRetryable {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if error.is_retryable() {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}
