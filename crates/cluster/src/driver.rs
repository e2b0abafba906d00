//! Contract between the access layer and the cluster driver
//!
//! The driver performs the actual network I/O: connection management,
//! command routing, topology discovery and reconnects. The access layer
//! only needs the handful of operations described here. Command methods
//! live on the concrete connection types and are reached through the
//! closures callers pass to the facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::stream::BoxStream;

use crate::error::{ClusterError, ExecutionError};

/// How a connection treats commands issued while it is disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectedBehavior {
    /// Driver default: buffer while auto-reconnect is on
    Default,
    /// Buffer commands until the connection is re-established
    AcceptCommands,
    /// Fail commands immediately
    RejectCommands,
}

/// Events that make the driver refresh its view of the cluster topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTrigger {
    MovedRedirect,
    AskRedirect,
    PersistentReconnects,
    UncoveredSlot,
    UnknownNode,
}

impl RefreshTrigger {
    /// Every adaptive refresh trigger the driver supports
    pub const ALL: [Self; 5] = [
        Self::MovedRedirect,
        Self::AskRedirect,
        Self::PersistentReconnects,
        Self::UncoveredSlot,
        Self::UnknownNode,
    ];
}

/// Options the access layer applies to the driver before connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterClientOptions {
    pub disconnected_behavior: DisconnectedBehavior,
    pub validate_cluster_node_membership: bool,
    pub adaptive_refresh_triggers: Vec<RefreshTrigger>,
    /// Fixed timeout applied to every command
    pub command_timeout: Duration,
    /// Emit stream signals on the driver's own scheduler instead of its I/O
    /// threads
    pub publish_on_scheduler: bool,
}

impl ClusterClientOptions {
    /// Options used by the fault-tolerant facade
    ///
    /// Commands fail fast while disconnected, cluster membership is not
    /// validated, every adaptive topology refresh trigger is enabled, and
    /// stream signals are published on the driver's scheduler.
    pub fn fault_tolerant(command_timeout: Duration) -> Self {
        Self {
            disconnected_behavior: DisconnectedBehavior::RejectCommands,
            validate_cluster_node_membership: false,
            adaptive_refresh_triggers: RefreshTrigger::ALL.to_vec(),
            command_timeout,
            publish_on_scheduler: true,
        }
    }
}

/// A connection owned by the access layer
pub trait ClusterConnection: Send + Sync + 'static {
    /// Close the connection; later commands fail
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Event delivered on a publish/subscribe connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent<K, V> {
    Message { channel: K, message: V },
    PatternMessage { pattern: K, channel: K, message: V },
    Subscribed { channel: K, count: u64 },
    Unsubscribed { channel: K, count: u64 },
    /// The driver observed a change in the cluster topology; subscriptions
    /// held on nodes that moved may have been lost
    TopologyChanged,
}

impl<K, V> PubSubEvent<K, V> {
    pub fn is_topology_changed(&self) -> bool {
        matches!(self, Self::TopologyChanged)
    }
}

/// A publish/subscribe connection
pub trait PubSubConnection: ClusterConnection {
    type Key: Send + 'static;
    type Value: Send + 'static;

    /// Start receiving events
    ///
    /// Each call returns an independent stream that observes every event
    /// emitted after the call. The stream ends when the connection closes.
    fn events(&self) -> BoxStream<'static, PubSubEvent<Self::Key, Self::Value>>;
}

/// Entry point into the cluster driver
pub trait ClusterTransport: Send + Sync + 'static {
    type Connection: ClusterConnection;
    type BinaryConnection: ClusterConnection;
    type PubSubConnection: PubSubConnection;

    fn set_options(&self, options: ClusterClientOptions);

    /// Open a connection with text keys and values
    fn connect(&self) -> Result<Self::Connection, ClusterError>;

    /// Open a connection with binary keys and values
    fn connect_binary(&self) -> Result<Self::BinaryConnection, ClusterError>;

    fn connect_pub_sub(&self) -> Result<Self::PubSubConnection, ClusterError>;

    /// Release driver resources (event loops, timers, thread pools)
    fn shutdown(&self);
}

/// Completion side of a [`CommandFuture`]
#[derive(Debug)]
pub struct CommandCompleter<T> {
    sender: oneshot::Sender<Result<T, ClusterError>>,
}

impl<T> CommandCompleter<T> {
    /// Complete the command
    ///
    /// Completing a command whose future was dropped is a no-op.
    pub fn complete(self, result: Result<T, ClusterError>) {
        let _ = self.sender.send(result);
    }
}

/// Pending result of an asynchronous driver command
///
/// Resolves to [`ExecutionError::Failed`] when the driver reports an error
/// and to [`ExecutionError::Cancelled`] when the completer is dropped
/// without a result.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct CommandFuture<T> {
    receiver: oneshot::Receiver<Result<T, ClusterError>>,
}

impl<T> CommandFuture<T> {
    /// Create a pending command and its completer
    pub fn pending() -> (CommandCompleter<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        (CommandCompleter { sender }, Self { receiver })
    }

    /// Create an already completed command
    pub fn ready(result: Result<T, ClusterError>) -> Self {
        let (completer, future) = Self::pending();
        completer.complete(result);
        future
    }

    /// Block the calling thread until the command completes
    pub fn wait(self) -> Result<T, ExecutionError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = Result<T, ExecutionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(ExecutionError::Failed(error))),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(ExecutionError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
