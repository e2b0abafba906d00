//! Breaker and retry composition for every execution shape
//!
//! Retry always runs inside the breaker. The breaker is asked for a
//! permission once per logical call and sees exactly one outcome, no matter
//! how many attempts the retry made.
//!
//! Errors returned by caller-supplied work are normalized into
//! [`ClusterError`] before the retry policy looks at them: a `ClusterError`
//! passes through unchanged, anything else becomes
//! [`ClusterError::Failed`]. Only [`ClusterError::CommandTimeout`] is
//! retried.

use std::future::Future;

use faultline_common::error::BoxedError;
use faultline_common::resilience::policies::RetryOnRetryable;
use faultline_common::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerStream, Retry, RetryMetrics, RetryStream,
};
use futures::stream::{Stream, TryStreamExt};
use tracing::instrument;

use crate::error::ClusterError;

/// Retry policy applied to cluster commands
pub type CommandRetry = Retry<RetryOnRetryable>;

fn normalize<E: Into<BoxedError>>(error: E) -> ClusterError {
    ClusterError::from_boxed(error.into())
}

/// A circuit breaker and a retry shared by every call of one client
///
/// Cloning is cheap; clones share the breaker state and retry metrics.
#[derive(Debug, Clone)]
pub struct ProtectedExecutor {
    breaker: CircuitBreaker,
    retry: CommandRetry,
}

impl ProtectedExecutor {
    pub fn new(breaker: CircuitBreaker, retry: CommandRetry) -> Self {
        Self { breaker, retry }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &CommandRetry {
        &self.retry
    }

    pub fn circuit_breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        self.retry.metrics()
    }

    /// Run blocking work on the calling thread
    ///
    /// Backoff waits block the calling thread as well.
    #[instrument(skip_all, fields(breaker = %self.breaker.name()))]
    pub fn run_blocking<T, E, F>(&self, mut work: F) -> Result<T, ClusterError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxedError>,
    {
        let permit = self.breaker.acquire()?;
        let result = self.retry.execute_blocking(|| work().map_err(normalize));

        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Run asynchronous work, waiting between attempts on the tokio timer
    ///
    /// Dropping the returned future abandons the call: the breaker
    /// permission is released and no outcome is recorded.
    #[instrument(skip_all, fields(breaker = %self.breaker.name()))]
    pub async fn run_async<T, E, F, Fut>(&self, mut work: F) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxedError>,
    {
        let permit = self.breaker.acquire()?;
        let result = self
            .retry
            .execute(|| {
                let attempt = work();
                async move { attempt.await.map_err(normalize) }
            })
            .await;

        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Protect a lazily produced stream
    ///
    /// `factory` is called once per subscription attempt. Nothing happens
    /// until the returned stream is first polled; at that point the breaker
    /// is consulted, and a rejection is yielded as the only item.
    pub fn run_stream<T, E, F, S>(
        &self,
        mut factory: F,
    ) -> impl Stream<Item = Result<T, ClusterError>> + Unpin + Send + 'static
    where
        F: FnMut() -> S + Unpin + Send + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxedError> + 'static,
    {
        let retrying = RetryStream::new(self.retry.clone(), move || {
            factory().map_err(normalize::<E> as fn(E) -> ClusterError)
        });
        CircuitBreakerStream::new(self.breaker.clone(), retrying)
    }
}
