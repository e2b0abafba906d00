//! Stream adapters applying retry and circuit breaking to lazy streams
//!
//! The two adapters are independent and order-sensitive:
//!
//! - [`RetryStream`] resubscribes on error: it owns a factory producing a
//!   fresh stream per attempt and, when the current stream yields a
//!   retryable error, waits per the backoff and starts over with a new
//!   stream from the factory. Items already yielded by a failed attempt are
//!   not suppressed; the new attempt starts from the beginning.
//! - [`CircuitBreakerStream`] gates on subscription: it asks the breaker for
//!   a permission on first poll and records exactly one outcome when the
//!   wrapped stream terminates.
//!
//! Wrapping a `RetryStream` in a `CircuitBreakerStream` keeps retries
//! invisible to the breaker, which only ever sees the aggregate outcome.
//!
//! Neither adapter buffers. Items are yielded as soon as the inner stream
//! yields them, and dropping an adapter drops the inner stream together with
//! any pending backoff timer. An error item is always terminal.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::ready;
use futures::stream::{FusedStream, Stream};
use tokio::time::Sleep;

use super::circuit_breaker::{CallNotPermitted, CallPermit, CircuitBreaker};
use super::clock::{Clock, SystemClock};
use super::retry::{NextStep, Retry, RetryPolicy};

enum RetryState<S> {
    Idle,
    Streaming(Pin<Box<S>>),
    Waiting(Pin<Box<Sleep>>),
    Done,
}

/// Resubscribe-on-error stream adapter
///
/// Created by [`RetryStream::new`]. The factory is not invoked until the
/// adapter is first polled.
pub struct RetryStream<F, S, P> {
    retry: Retry<P>,
    factory: F,
    state: RetryState<S>,
    attempts: u32,
}

impl<F, S, P> RetryStream<F, S, P>
where
    F: FnMut() -> S,
{
    pub fn new(retry: Retry<P>, factory: F) -> Self {
        Self { retry, factory, state: RetryState::Idle, attempts: 0 }
    }
}

impl<F, S, P> RetryStream<F, S, P> {
    /// Number of subscriptions made to the factory so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl<F, S, P> fmt::Debug for RetryStream<F, S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStream")
            .field("retry", &self.retry)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl<F, S, T, E, P> Stream for RetryStream<F, S, P>
where
    F: FnMut() -> S + Unpin,
    S: Stream<Item = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                RetryState::Idle => {
                    this.attempts = this.attempts.saturating_add(1);
                    this.state = RetryState::Streaming(Box::pin((this.factory)()));
                }
                RetryState::Streaming(stream) => match ready!(stream.as_mut().poll_next(cx)) {
                    Some(Ok(item)) => return Poll::Ready(Some(Ok(item))),
                    Some(Err(error)) => match this.retry.next_step(&error, this.attempts) {
                        NextStep::Wait(delay) if delay == Duration::ZERO => {
                            this.state = RetryState::Idle;
                        }
                        NextStep::Wait(delay) => {
                            this.state = RetryState::Waiting(Box::pin(tokio::time::sleep(delay)));
                        }
                        NextStep::GiveUp => {
                            this.retry.record_result(false, this.attempts);
                            this.state = RetryState::Done;
                            return Poll::Ready(Some(Err(error)));
                        }
                    },
                    None => {
                        this.retry.record_result(true, this.attempts);
                        this.state = RetryState::Done;
                        return Poll::Ready(None);
                    }
                },
                RetryState::Waiting(sleep) => {
                    ready!(sleep.as_mut().poll(cx));
                    this.state = RetryState::Idle;
                }
                RetryState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<F, S, T, E, P> FusedStream for RetryStream<F, S, P>
where
    F: FnMut() -> S + Unpin,
    S: Stream<Item = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    fn is_terminated(&self) -> bool {
        matches!(self.state, RetryState::Done)
    }
}

enum Gate<C: Clock> {
    Pending,
    Admitted(CallPermit<C>),
    Done,
}

/// Gate-on-subscribe stream adapter
///
/// A rejected subscription yields a single error converted from
/// [`CallNotPermitted`] and never polls the inner stream.
pub struct CircuitBreakerStream<S, C: Clock = SystemClock> {
    breaker: CircuitBreaker<C>,
    inner: Pin<Box<S>>,
    gate: Gate<C>,
}

impl<S, C: Clock> CircuitBreakerStream<S, C> {
    pub fn new(breaker: CircuitBreaker<C>, inner: S) -> Self {
        Self { breaker, inner: Box::pin(inner), gate: Gate::Pending }
    }
}

impl<S, C: Clock> fmt::Debug for CircuitBreakerStream<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gate = match self.gate {
            Gate::Pending => "pending",
            Gate::Admitted(_) => "admitted",
            Gate::Done => "done",
        };
        f.debug_struct("CircuitBreakerStream")
            .field("breaker", &self.breaker.name())
            .field("gate", &gate)
            .finish()
    }
}

impl<S, T, E, C> Stream for CircuitBreakerStream<S, C>
where
    S: Stream<Item = Result<T, E>>,
    E: From<CallNotPermitted>,
    C: Clock,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Gate::Pending = this.gate {
            match this.breaker.acquire() {
                Ok(permit) => this.gate = Gate::Admitted(permit),
                Err(rejection) => {
                    this.gate = Gate::Done;
                    return Poll::Ready(Some(Err(E::from(rejection))));
                }
            }
        }

        if let Gate::Done = this.gate {
            return Poll::Ready(None);
        }

        match ready!(this.inner.as_mut().poll_next(cx)) {
            Some(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Some(Err(error)) => {
                if let Gate::Admitted(permit) = std::mem::replace(&mut this.gate, Gate::Done) {
                    permit.failure();
                }
                Poll::Ready(Some(Err(error)))
            }
            None => {
                if let Gate::Admitted(permit) = std::mem::replace(&mut this.gate, Gate::Done) {
                    permit.success();
                }
                Poll::Ready(None)
            }
        }
    }
}

impl<S, T, E, C> FusedStream for CircuitBreakerStream<S, C>
where
    S: Stream<Item = Result<T, E>>,
    E: From<CallNotPermitted>,
    C: Clock,
{
    fn is_terminated(&self) -> bool {
        matches!(self.gate, Gate::Done)
    }
}
