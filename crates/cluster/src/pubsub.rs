//! Fault-tolerant publish/subscribe connection
//!
//! Commands issued on the subscription connection (subscribe, unsubscribe,
//! ping) go through the owning client's breaker and retry like any other
//! command. Events coming back from the driver are delivered on the
//! connection's [`DispatchContext`], one at a time.
//!
//! When the cluster topology changes, subscriptions held on nodes that moved
//! may be lost. Handlers registered with
//! [`FaultTolerantPubSubConnection::subscribe_to_cluster_topology_changed_events`]
//! are expected to resubscribe; they run under the topology retry, which
//! keeps trying with exponential backoff until the handler succeeds.

use std::fmt;
use std::sync::Arc;

use faultline_common::error::BoxedError;
use faultline_common::resilience::policies::AlwaysRetry;
use faultline_common::resilience::Retry;
use futures::future;
use futures::StreamExt;
use tracing::{info, instrument, warn};

use crate::dispatch::DispatchContext;
use crate::driver::{PubSubConnection, PubSubEvent};
use crate::error::ClusterError;
use crate::executor::ProtectedExecutor;

/// Retry driving resubscription after topology changes
pub type TopologyRetry = Retry<AlwaysRetry>;

/// Publish/subscribe connection protected by its client's policies
pub struct FaultTolerantPubSubConnection<P: PubSubConnection> {
    name: String,
    connection: Arc<P>,
    executor: ProtectedExecutor,
    topology_retry: TopologyRetry,
    dispatch: Arc<DispatchContext>,
}

impl<P: PubSubConnection> fmt::Debug for FaultTolerantPubSubConnection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultTolerantPubSubConnection")
            .field("name", &self.name)
            .field("open", &self.connection.is_open())
            .field("dispatch", &self.dispatch.name())
            .finish()
    }
}

impl<P: PubSubConnection> FaultTolerantPubSubConnection<P> {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<P>,
        executor: ProtectedExecutor,
        topology_retry: TopologyRetry,
        dispatch: Arc<DispatchContext>,
    ) -> Self {
        Self { name: name.into(), connection, executor, topology_retry, dispatch }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch_context(&self) -> &DispatchContext {
        &self.dispatch
    }

    /// Run a command on the subscription connection
    pub fn use_pub_sub_connection<E, F>(&self, mut f: F) -> Result<(), ClusterError>
    where
        F: FnMut(&P) -> Result<(), E>,
        E: Into<BoxedError>,
    {
        self.executor.run_blocking(|| f(&self.connection))
    }

    /// Run a command on the subscription connection and return its value
    pub fn with_pub_sub_connection<T, E, F>(&self, mut f: F) -> Result<T, ClusterError>
    where
        F: FnMut(&P) -> Result<T, E>,
        E: Into<BoxedError>,
    {
        self.executor.run_blocking(|| f(&self.connection))
    }

    /// Deliver every event of this connection to `listener`
    ///
    /// The listener runs on the dispatch context and never concurrently with
    /// other listeners of the same connection. Delivery stops when the
    /// connection closes.
    pub fn subscribe_events<L>(&self, mut listener: L) -> Result<(), ClusterError>
    where
        L: FnMut(PubSubEvent<P::Key, P::Value>) + Send + 'static,
    {
        let events = self.connection.events();
        self.dispatch.spawn(events.for_each(move |event| {
            listener(event);
            future::ready(())
        }))
    }

    /// Run `handler` every time the cluster topology changes
    ///
    /// A failing handler is retried under the topology retry until it
    /// succeeds. The next topology change is not handled before the current
    /// one has been.
    ///
    /// A handler that captures this connection keeps its dispatch thread
    /// alive until [`ClusterClient::shutdown`](crate::ClusterClient::shutdown)
    /// stops it.
    #[instrument(skip_all, fields(connection = %self.name))]
    pub fn subscribe_to_cluster_topology_changed_events<E, H>(
        &self,
        handler: H,
    ) -> Result<(), ClusterError>
    where
        H: Fn() -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxedError> + 'static,
    {
        let mut events = self.connection.events();
        let retry = self.topology_retry.clone();
        let name = self.name.clone();

        self.dispatch.spawn(async move {
            while let Some(event) = events.next().await {
                if !event.is_topology_changed() {
                    continue;
                }
                info!(connection = %name, "Cluster topology changed, running resubscription handler");
                let outcome = retry
                    .execute_with_outcome(|| {
                        future::ready(handler().map_err(|e| ClusterError::from_boxed(e.into())))
                    })
                    .await;
                match outcome.result {
                    Ok(()) if outcome.attempts > 1 => {
                        info!(
                            connection = %name,
                            attempts = outcome.attempts,
                            "Resubscribed after topology change"
                        );
                    }
                    Ok(()) => {}
                    Err(error) => {
                        warn!(
                            connection = %name,
                            attempts = outcome.attempts,
                            %error,
                            "Giving up on resubscription after topology change"
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use faultline_common::resilience::policies::RetryOnRetryable;
    use faultline_common::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};

    use super::*;
    use crate::driver::ClusterConnection;
    use crate::testing::MockPubSubConnection;

    fn pub_sub(connection: MockPubSubConnection) -> FaultTolerantPubSubConnection<MockPubSubConnection> {
        let breaker = CircuitBreaker::new("pubsub-breaker", CircuitBreakerConfig::default())
            .expect("valid breaker");
        let retry = Retry::new("pubsub-retry", RetryConfig::default(), RetryOnRetryable)
            .expect("valid retry");
        let topology_retry = Retry::new(
            "pubsub-topology-changed-retry",
            RetryConfig::builder().unbounded().fixed_backoff(Duration::ZERO).build().expect("valid"),
            AlwaysRetry,
        )
        .expect("valid retry");
        let dispatch = DispatchContext::start("pubsub-test-events").expect("context starts");

        FaultTolerantPubSubConnection::new(
            "pubsub-test",
            Arc::new(connection),
            ProtectedExecutor::new(breaker, retry),
            topology_retry,
            Arc::new(dispatch),
        )
    }

    #[test]
    fn test_events_are_delivered_in_order() {
        let mock = MockPubSubConnection::new();
        let connection = pub_sub(mock.clone());
        let (tx, rx) = mpsc::channel();

        connection
            .subscribe_events(move |event| {
                let _ = tx.send(event);
            })
            .expect("subscribed");
        for i in 0..5 {
            mock.publish("updates", &format!("m{i}"));
        }

        for i in 0..5 {
            let event = rx.recv_timeout(Duration::from_secs(5)).expect("event delivered");
            assert_eq!(
                event,
                PubSubEvent::Message { channel: "updates".to_string(), message: format!("m{i}") }
            );
        }
        connection.dispatch_context().shutdown();
    }

    #[test]
    fn test_topology_handler_is_retried_until_success() {
        let mock = MockPubSubConnection::new();
        let connection = pub_sub(mock.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();

        let counter = Arc::clone(&calls);
        connection
            .subscribe_to_cluster_topology_changed_events(move || {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(ClusterError::Disconnected);
                }
                let _ = tx.send(());
                Ok(())
            })
            .expect("subscribed");
        mock.trigger_topology_change();

        rx.recv_timeout(Duration::from_secs(5)).expect("handler succeeded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        connection.dispatch_context().shutdown();
    }

    #[test]
    fn test_commands_go_through_executor() {
        let mock = MockPubSubConnection::new();
        let connection = pub_sub(mock.clone());

        connection
            .use_pub_sub_connection(|conn| conn.subscribe("alerts"))
            .expect("subscribe succeeds");
        assert_eq!(mock.subscriptions(), vec!["alerts".to_string()]);

        mock.close();
        let err = connection
            .with_pub_sub_connection(|conn| conn.subscribe("more"))
            .expect_err("closed connection");
        assert!(matches!(err, ClusterError::Disconnected));
        assert!(!mock.is_open());
        connection.dispatch_context().shutdown();
    }
}
