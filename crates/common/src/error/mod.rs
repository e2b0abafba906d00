//! Common error types and utilities shared by the faultline crates
//!
//! This module provides the error-handling vocabulary the resilience layer
//! relies on:
//!
//! 1. **`ErrorClassification` trait**: A standard interface for classifying
//!    errors by their characteristics (retryability, severity, criticality).
//!    Retry policies consult it to decide whether a failure is transient.
//!
//! 2. **`ErrorSeverity` enum**: A unified severity level used when logging
//!    failures.
//!
//! 3. **`ConfigError`**: Raised when a resilience or cluster configuration is
//!    rejected by validation.
//!
//! 4. **`BoxedError`**: The dynamic error type used to carry arbitrary causes
//!    across crate boundaries.
//!
//! ## Implementing ErrorClassification
//!
//! ```rust
//! use std::time::Duration;
//!
//! use faultline_common::error::{ErrorClassification, ErrorSeverity};
//!
//! #[derive(Debug)]
//! enum FetchError {
//!     Timeout,
//!     NotFound,
//! }
//!
//! impl ErrorClassification for FetchError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, Self::Timeout)
//!     }
//!
//!     fn severity(&self) -> ErrorSeverity {
//!         match self {
//!             Self::Timeout => ErrorSeverity::Warning,
//!             Self::NotFound => ErrorSeverity::Info,
//!         }
//!     }
//!
//!     fn is_critical(&self) -> bool {
//!         false
//!     }
//!
//!     fn retry_after(&self) -> Option<Duration> {
//!         None
//!     }
//! }
//!
//! assert!(FetchError::Timeout.is_retryable());
//! assert!(!FetchError::NotFound.is_retryable());
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type for causes whose concrete type is not known statically
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },

    /// The configuration document could not be parsed
    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },
}

impl ConfigError {
    /// Create an invalid-field error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid { field: field.into(), message: message.into() }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }
}

/// Result type for configuration validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Standard trait for error classification
///
/// All error types surfaced by the resilience layer implement this trait so
/// retry policies and logging can make consistent decisions.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again, such as command timeouts.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::parse(err.to_string())
    }
}
