//! Cluster access error types
//!
//! [`ClusterError`] is the single error type callers of the access layer
//! see. Driver failures, breaker rejections and configuration problems map
//! onto dedicated variants; anything else is carried as
//! [`ClusterError::Failed`] with the original cause attached.

use std::time::Duration;

use faultline_common::error::{BoxedError, ConfigError, ErrorClassification, ErrorSeverity};
use faultline_common::resilience::CallNotPermitted;
use thiserror::Error;

/// Errors surfaced by the cluster access layer
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The driver gave up waiting for a command reply
    #[error("Command timed out after {timeout:?}")]
    CommandTimeout { timeout: Duration },

    /// The connection is not connected and rejects commands
    #[error("Connection is disconnected")]
    Disconnected,

    /// Any other failure reported by the driver
    #[error("Driver error: {message}")]
    Driver { message: String },

    /// The circuit breaker rejected the call without running it
    #[error(transparent)]
    CircuitOpen(#[from] CallNotPermitted),

    /// The client was shut down
    #[error("Cluster client '{name}' has been shut down")]
    ShutDown { name: String },

    /// The client or one of its policies was misconfigured
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// The operation failed with an error from outside the access layer
    #[error("Cluster operation failed")]
    Failed(#[source] BoxedError),
}

impl ClusterError {
    /// Create a driver error
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver { message: message.into() }
    }

    /// Normalize an arbitrary error into a `ClusterError`
    ///
    /// A cause that already is a `ClusterError` is returned as-is; anything
    /// else is wrapped in [`ClusterError::Failed`].
    pub fn from_boxed(error: BoxedError) -> Self {
        match error.downcast::<Self>() {
            Ok(cluster_error) => *cluster_error,
            Err(other) => Self::Failed(other),
        }
    }

    /// Shorthand for [`ClusterError::from_boxed`] on any convertible error
    pub fn failed(error: impl Into<BoxedError>) -> Self {
        Self::from_boxed(error.into())
    }

    /// Whether this error is a circuit breaker rejection
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}

impl ErrorClassification for ClusterError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CommandTimeout { .. } | Self::CircuitOpen(_) => ErrorSeverity::Warning,
            Self::ShutDown { .. } => ErrorSeverity::Info,
            Self::Disconnected | Self::Driver { .. } | Self::Failed(_) => ErrorSeverity::Error,
            Self::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(rejection) => rejection.retry_after,
            _ => None,
        }
    }
}

/// Failure of an asynchronous driver command
///
/// Returned when awaiting or waiting on a
/// [`CommandFuture`](crate::driver::CommandFuture). The driver's own error is
/// kept as the source.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Asynchronous command failed")]
    Failed(#[source] ClusterError),

    #[error("Asynchronous command was cancelled before completing")]
    Cancelled,
}

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;
