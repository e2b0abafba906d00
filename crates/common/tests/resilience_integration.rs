//! Integration tests for resilience module
//!
//! Tests circuit breaker and retry logic with various failure scenarios,
//! including the composition where retry runs inside the breaker.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faultline_common::resilience::{
    policies, CallNotPermitted, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStream,
    CircuitState, MockClock, ResilienceError, Retry, RetryConfig, RetryStream,
};
use faultline_common::{ErrorClassification, ErrorSeverity};
use futures::stream::{self, StreamExt};
use thiserror::Error;

/// Custom error type for testing
#[derive(Debug, Clone, PartialEq, Error)]
enum TestError {
    #[error("transient failure")]
    Transient,
    #[error("permanent failure")]
    Permanent,
    #[error("rejected by breaker")]
    Rejected,
}

impl ErrorClassification for TestError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl From<CallNotPermitted> for TestError {
    fn from(_: CallNotPermitted) -> Self {
        Self::Rejected
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_breaker(clock: MockClock) -> CircuitBreaker<MockClock> {
    let config = CircuitBreakerConfig::builder()
        .sliding_window_size(4)
        .minimum_number_of_calls(4)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open_state(Duration::from_secs(10))
        .permitted_calls_in_half_open_state(1)
        .build()
        .expect("valid breaker config");
    CircuitBreaker::with_clock("integration", config, clock).expect("valid breaker")
}

/// Validates retry with the classification-driven policy.
///
/// # Test Steps
/// 1. Configure retry with 3 attempts and no backoff
/// 2. Fail twice with a transient error, then succeed
/// 3. Verify the success is returned after exactly 3 attempts
/// 4. Verify metrics count one success after retry
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_absorbs_transient_failures() {
    init_tracing();
    let attempts = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::builder()
        .max_attempts(3)
        .fixed_backoff(Duration::ZERO)
        .build()
        .expect("Failed to build config");
    let retry = Retry::new("absorb", config, policies::RetryOnRetryable).expect("valid retry");

    let counter = Arc::clone(&attempts);
    let result = retry
        .execute(|| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok("value")
                }
            }
        })
        .await;

    assert_eq!(result, Ok("value"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(retry.metrics().successful_calls_with_retry, 1);
}

/// Validates that a non-retryable error is returned immediately.
///
/// # Test Steps
/// 1. Configure retry with 5 attempts
/// 2. Fail with a permanent error
/// 3. Verify only one attempt was made and the original error surfaced
#[test]
fn test_retry_stops_on_permanent_error() {
    let attempts = AtomicU32::new(0);
    let retry = Retry::new("permanent", RetryConfig::default(), policies::RetryOnRetryable)
        .expect("valid retry");

    let result: Result<(), _> = retry.execute_blocking(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(TestError::Permanent)
    });

    assert_eq!(result, Err(TestError::Permanent));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(retry.metrics().failed_calls_without_retry, 1);
}

/// Validates the complete breaker lifecycle with a mock clock.
///
/// # Test Steps
/// 1. Record 2 successes and 2 failures (50% over a full window)
/// 2. Verify the circuit opens and rejects calls without running them
/// 3. Advance past the wait duration
/// 4. Verify a successful trial call closes the circuit
#[test]
fn test_circuit_breaker_full_lifecycle() {
    init_tracing();
    let clock = MockClock::new();
    let breaker = small_breaker(clock.clone());

    for ok in [true, true, false, false] {
        let _ = breaker.call(|| if ok { Ok(()) } else { Err(TestError::Transient) });
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let executed = AtomicU32::new(0);
    let rejected = breaker.call(|| {
        executed.fetch_add(1, Ordering::SeqCst);
        Ok::<_, TestError>(())
    });
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen(_))));
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    clock.advance(Duration::from_secs(10));
    assert!(breaker.call(|| Ok::<_, TestError>(())).is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().buffered_calls, 0);
}

/// Validates that retry inside the breaker reports one aggregate outcome.
///
/// # Test Steps
/// 1. Wrap a retry (3 attempts) in a breaker
/// 2. Run a call that fails twice before succeeding
/// 3. Verify the breaker buffered exactly one successful outcome
#[tokio::test]
async fn test_retry_inside_breaker_records_once() {
    let breaker = small_breaker(MockClock::new());
    let config = RetryConfig::builder()
        .max_attempts(3)
        .fixed_backoff(Duration::ZERO)
        .build()
        .expect("Failed to build config");
    let retry = Retry::new("inner", config, policies::RetryOnRetryable).expect("valid retry");
    let attempts = Arc::new(AtomicU32::new(0));

    let result = breaker
        .execute(|| {
            retry.execute(|| {
                let attempts = Arc::clone(&attempts);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(7)
                    }
                }
            })
        })
        .await;

    assert_eq!(result.ok(), Some(7));
    let metrics = breaker.metrics();
    assert_eq!(metrics.buffered_calls, 1);
    assert_eq!(metrics.failed_calls, 0);
}

/// Validates stream composition: breaker outside, retry inside.
///
/// # Test Steps
/// 1. Build a stream factory whose first subscription fails
/// 2. Wrap it in `RetryStream` and then `CircuitBreakerStream`
/// 3. Verify items from both subscriptions reach the consumer
/// 4. Verify the breaker recorded a single success
#[tokio::test]
async fn test_stream_adapters_compose() {
    let breaker = small_breaker(MockClock::new());
    let config = RetryConfig::builder()
        .max_attempts(2)
        .fixed_backoff(Duration::ZERO)
        .build()
        .expect("Failed to build config");
    let retry = Retry::new("stream", config, policies::RetryOnRetryable).expect("valid retry");
    let subscriptions = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&subscriptions);
    let factory = move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            stream::iter(vec![Ok(1), Err(TestError::Transient)])
        } else {
            stream::iter(vec![Ok(2), Ok(3)])
        }
    };
    let protected = CircuitBreakerStream::new(breaker.clone(), RetryStream::new(retry, factory));

    let items: Vec<_> = protected.collect().await;

    assert_eq!(items, vec![Ok(1), Ok(2), Ok(3)]);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.metrics().buffered_calls, 1);
    assert_eq!(breaker.metrics().failed_calls, 0);
}

/// Validates that an open breaker rejects a stream without subscribing.
#[tokio::test]
async fn test_open_breaker_rejects_stream() {
    let breaker = small_breaker(MockClock::new());
    for _ in 0..4 {
        breaker.on_error();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let polled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&polled);
    let inner = stream::iter(vec![Ok::<u32, TestError>(1)]).inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let items: Vec<_> = CircuitBreakerStream::new(breaker, inner).collect().await;

    assert_eq!(items, vec![Err(TestError::Rejected)]);
    assert_eq!(polled.load(Ordering::SeqCst), 0);
}

/// Validates breaker accounting under concurrent blocking callers.
///
/// # Test Steps
/// 1. Spawn 8 threads, each recording 25 successes through `call`
/// 2. Verify the breaker stays closed
/// 3. Verify the window is full and failure-free
#[test]
fn test_circuit_breaker_concurrent_callers() {
    let config = CircuitBreakerConfig::builder()
        .sliding_window_size(100)
        .minimum_number_of_calls(10)
        .build()
        .expect("valid breaker config");
    let breaker = CircuitBreaker::new("concurrent", config).expect("valid breaker");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let breaker = breaker.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let _ = breaker.call(|| Ok::<_, TestError>(()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.buffered_calls, 100);
    assert_eq!(metrics.failed_calls, 0);
    assert_eq!(metrics.failure_rate, Some(0.0));
}

/// Validates the async breaker path from a non-async test harness.
#[test]
fn test_breaker_execute_with_block_on() -> anyhow::Result<()> {
    let breaker = small_breaker(MockClock::new());

    let value = tokio_test::block_on(breaker.execute(|| async { Ok::<_, TestError>(42) }))?;

    assert_eq!(value, 42);
    assert_eq!(breaker.metrics().buffered_calls, 1);
    Ok(())
}
