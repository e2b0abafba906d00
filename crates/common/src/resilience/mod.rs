//! Resilience patterns for fault tolerance and error handling
//!
//! This module provides generic, reusable building blocks:
//! - **Circuit Breaker**: count-based sliding window that stops calls to a
//!   failing dependency and probes it again after a wait
//! - **Retry**: bounded or unbounded retry with pluggable policies and
//!   backoff functions
//! - **Stream adapters**: the same two patterns applied to lazy streams
//!
//! Everything here is generic over the error type. Domain crates decide which
//! errors are retryable and how rejections are surfaced.
//!
//! ## Composition
//!
//! When both patterns protect the same call, retry runs *inside* the
//! breaker: the breaker sees one aggregate outcome per logical call, no
//! matter how many attempts the retry made.

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod retry;
pub mod stream;

pub use backoff::{Backoff, BackoffStrategy, Jitter};
pub use circuit_breaker::{
    CallNotPermitted, CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, ResilienceError,
    ResilienceResult,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use retry::{
    policies, Retry, RetryConfig, RetryConfigBuilder, RetryDecision, RetryMetrics, RetryOutcome,
    RetryPolicy,
};
pub use stream::{CircuitBreakerStream, RetryStream};
