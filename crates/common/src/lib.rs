//! Common building blocks shared across faultline crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error classification, configuration errors, serde helpers
//! - `runtime`: resilience primitives (circuit breaker, retry, backoff,
//!   stream adapters)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{BoxedError, ConfigError, ConfigResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    Backoff, BackoffStrategy, CallNotPermitted, CallOutcome, CallPermit, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitBreakerStream, CircuitState, Clock, Jitter, MockClock, ResilienceError,
    ResilienceResult, Retry, RetryConfig, RetryConfigBuilder, RetryDecision, RetryMetrics,
    RetryOutcome, RetryPolicy, RetryStream, SystemClock,
};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
