//! Fault-tolerant access layer for a clustered key-value store.
//!
//! Every command issued through a [`ClusterClient`] is protected by a
//! circuit breaker and a bounded retry from `faultline-common`, whether it
//! is blocking, asynchronous or stream-shaped. Pub/sub connections deliver
//! events on a dedicated thread and resubscribe after topology changes.
//!
//! The driver doing the network I/O is abstracted behind
//! [`ClusterTransport`]; enable the `test-utils` feature for an in-memory
//! implementation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pubsub;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::ClusterClient;
pub use config::{
    BackoffConfiguration, CircuitBreakerConfiguration, ClusterConfiguration, ClusterUri,
    RetryConfiguration,
};
pub use driver::{
    ClusterClientOptions, ClusterConnection, ClusterTransport, CommandCompleter, CommandFuture,
    DisconnectedBehavior, PubSubConnection, PubSubEvent, RefreshTrigger,
};
pub use error::{ClusterError, ClusterResult, ExecutionError};
pub use executor::ProtectedExecutor;
pub use pubsub::FaultTolerantPubSubConnection;
