//! Fault-tolerant cluster client
//!
//! [`ClusterClient`] owns one text connection, one binary connection and any
//! number of pub/sub connections opened on demand. Every command issued
//! through it runs under the client's circuit breaker and retry, whatever
//! its shape:
//!
//! | Shape | Entry points |
//! |-------|--------------|
//! | blocking | `use_cluster`, `with_cluster`, `use_binary_cluster`, `with_binary_cluster` |
//! | async | `with_cluster_async`, `with_binary_cluster_async` |
//! | stream | `with_cluster_reactive`, `with_binary_cluster_reactive` |
//!
//! Connections are never replaced; reconnecting is the driver's job.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use faultline_common::error::BoxedError;
use faultline_common::resilience::policies::{AlwaysRetry, RetryOnRetryable};
use faultline_common::resilience::{
    Backoff, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, Retry, RetryConfig,
    RetryMetrics,
};
use futures::stream::Stream;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::config::{ClusterConfiguration, ClusterUri};
use crate::dispatch::DispatchContext;
use crate::driver::{ClusterClientOptions, ClusterConnection, ClusterTransport};
use crate::error::ClusterError;
use crate::executor::ProtectedExecutor;
use crate::pubsub::{FaultTolerantPubSubConnection, TopologyRetry};

const TOPOLOGY_RETRY_INITIAL_WAIT: Duration = Duration::from_secs(1);
const TOPOLOGY_RETRY_MULTIPLIER: f64 = 1.5;
const TOPOLOGY_RETRY_MAX_WAIT: Duration = Duration::from_secs(30);

struct PubSubRecord<P> {
    connection: Arc<P>,
    dispatch: Arc<DispatchContext>,
}

struct PubSubRegistry<P> {
    shut_down: bool,
    records: Vec<PubSubRecord<P>>,
}

/// Fault-tolerant access to one cluster
pub struct ClusterClient<T: ClusterTransport> {
    name: String,
    transport: T,
    connection: Arc<T::Connection>,
    binary_connection: Arc<T::BinaryConnection>,
    executor: ProtectedExecutor,
    topology_retry: TopologyRetry,
    pub_sub: Mutex<PubSubRegistry<T::PubSubConnection>>,
}

impl<T: ClusterTransport> std::fmt::Debug for ClusterClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.pub_sub.lock();
        f.debug_struct("ClusterClient")
            .field("name", &self.name)
            .field("breaker", self.executor.circuit_breaker())
            .field("pub_sub_connections", &registry.records.len())
            .field("shut_down", &registry.shut_down)
            .finish()
    }
}

impl<T: ClusterTransport> ClusterClient<T> {
    /// Configure the driver and open the text and binary connections
    ///
    /// Policies are named after the client: `{name}-breaker`,
    /// `{name}-retry` and `{name}-topology-changed-retry`.
    #[instrument(skip_all, fields(cluster = %name.as_ref()))]
    pub fn new(
        name: impl AsRef<str>,
        transport: T,
        command_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
        retry_config: RetryConfig,
    ) -> Result<Self, ClusterError> {
        let name = name.as_ref().to_string();

        let breaker = CircuitBreaker::new(format!("{name}-breaker"), breaker_config)?;
        let retry = Retry::new(format!("{name}-retry"), retry_config, RetryOnRetryable)?;
        let topology_retry = Retry::new(
            format!("{name}-topology-changed-retry"),
            RetryConfig::builder()
                .unbounded()
                .backoff(Backoff::exponential_random(
                    TOPOLOGY_RETRY_INITIAL_WAIT,
                    TOPOLOGY_RETRY_MULTIPLIER,
                    TOPOLOGY_RETRY_MAX_WAIT,
                ))
                .build()?,
            AlwaysRetry,
        )?;

        transport.set_options(ClusterClientOptions::fault_tolerant(command_timeout));
        let connection = Arc::new(transport.connect()?);
        let binary_connection = match transport.connect_binary() {
            Ok(binary_connection) => Arc::new(binary_connection),
            Err(error) => {
                connection.close();
                return Err(error);
            }
        };

        info!(cluster = %name, ?command_timeout, "Cluster client connected");
        Ok(Self {
            name,
            transport,
            connection,
            binary_connection,
            executor: ProtectedExecutor::new(breaker, retry),
            topology_retry,
            pub_sub: Mutex::new(PubSubRegistry { shut_down: false, records: Vec::new() }),
        })
    }

    /// Build a client from a configuration document
    ///
    /// `connect` receives the parsed configuration URI, with the command
    /// timeout embedded, and returns the driver to use.
    pub fn from_configuration<F>(
        name: impl AsRef<str>,
        configuration: &ClusterConfiguration,
        connect: F,
    ) -> Result<Self, ClusterError>
    where
        F: FnOnce(&ClusterUri) -> Result<T, ClusterError>,
    {
        configuration.validate()?;
        let uri = configuration.cluster_uri()?;
        debug!(cluster = %name.as_ref(), %uri, "Creating cluster client from configuration");
        let transport = connect(&uri)?;

        Self::new(
            name,
            transport,
            uri.timeout(),
            configuration.circuit_breaker.to_circuit_breaker_config()?,
            configuration.retry.to_retry_config()?,
        )
    }

    /// Name of this client; only used to label policies, threads and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        self.executor.circuit_breaker()
    }

    pub fn circuit_breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.executor.circuit_breaker_metrics()
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        self.executor.retry_metrics()
    }

    pub fn is_shut_down(&self) -> bool {
        self.pub_sub.lock().shut_down
    }

    // -------------------------------------------------------------------------
    // Text connection
    // -------------------------------------------------------------------------

    pub fn use_cluster<E, F>(&self, f: F) -> Result<(), ClusterError>
    where
        F: FnMut(&T::Connection) -> Result<(), E>,
        E: Into<BoxedError>,
    {
        self.use_connection(self.connection.as_ref(), f)
    }

    pub fn with_cluster<R, E, F>(&self, f: F) -> Result<R, ClusterError>
    where
        F: FnMut(&T::Connection) -> Result<R, E>,
        E: Into<BoxedError>,
    {
        self.with_connection(self.connection.as_ref(), f)
    }

    pub async fn with_cluster_async<R, E, F, Fut>(&self, f: F) -> Result<R, ClusterError>
    where
        F: FnMut(Arc<T::Connection>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxedError>,
    {
        self.with_connection_async(Arc::clone(&self.connection), f).await
    }

    pub fn with_cluster_reactive<R, E, F, S>(
        &self,
        f: F,
    ) -> impl Stream<Item = Result<R, ClusterError>> + Unpin + Send + 'static
    where
        F: FnMut(Arc<T::Connection>) -> S + Unpin + Send + 'static,
        S: Stream<Item = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Into<BoxedError> + 'static,
    {
        self.with_connection_reactive(Arc::clone(&self.connection), f)
    }

    // -------------------------------------------------------------------------
    // Binary connection
    // -------------------------------------------------------------------------

    pub fn use_binary_cluster<E, F>(&self, f: F) -> Result<(), ClusterError>
    where
        F: FnMut(&T::BinaryConnection) -> Result<(), E>,
        E: Into<BoxedError>,
    {
        self.use_connection(self.binary_connection.as_ref(), f)
    }

    pub fn with_binary_cluster<R, E, F>(&self, f: F) -> Result<R, ClusterError>
    where
        F: FnMut(&T::BinaryConnection) -> Result<R, E>,
        E: Into<BoxedError>,
    {
        self.with_connection(self.binary_connection.as_ref(), f)
    }

    pub async fn with_binary_cluster_async<R, E, F, Fut>(&self, f: F) -> Result<R, ClusterError>
    where
        F: FnMut(Arc<T::BinaryConnection>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxedError>,
    {
        self.with_connection_async(Arc::clone(&self.binary_connection), f).await
    }

    pub fn with_binary_cluster_reactive<R, E, F, S>(
        &self,
        f: F,
    ) -> impl Stream<Item = Result<R, ClusterError>> + Unpin + Send + 'static
    where
        F: FnMut(Arc<T::BinaryConnection>) -> S + Unpin + Send + 'static,
        S: Stream<Item = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Into<BoxedError> + 'static,
    {
        self.with_connection_reactive(Arc::clone(&self.binary_connection), f)
    }

    // -------------------------------------------------------------------------
    // Generic entry points
    // -------------------------------------------------------------------------

    /// Run blocking work against `connection` under this client's policies
    pub fn use_connection<C, E, F>(&self, connection: &C, mut f: F) -> Result<(), ClusterError>
    where
        F: FnMut(&C) -> Result<(), E>,
        E: Into<BoxedError>,
    {
        self.executor.run_blocking(|| f(connection))
    }

    /// Run blocking work against `connection` and return its value
    pub fn with_connection<C, R, E, F>(&self, connection: &C, mut f: F) -> Result<R, ClusterError>
    where
        F: FnMut(&C) -> Result<R, E>,
        E: Into<BoxedError>,
    {
        self.executor.run_blocking(|| f(connection))
    }

    /// Run asynchronous work against `connection`
    pub async fn with_connection_async<C, R, E, F, Fut>(
        &self,
        connection: Arc<C>,
        mut f: F,
    ) -> Result<R, ClusterError>
    where
        F: FnMut(Arc<C>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxedError>,
    {
        self.executor.run_async(|| f(Arc::clone(&connection))).await
    }

    /// Produce a protected stream from `connection`
    ///
    /// `f` is called again for every resubscription after a retryable
    /// error.
    pub fn with_connection_reactive<C, R, E, F, S>(
        &self,
        connection: Arc<C>,
        mut f: F,
    ) -> impl Stream<Item = Result<R, ClusterError>> + Unpin + Send + 'static
    where
        C: Send + Sync + 'static,
        F: FnMut(Arc<C>) -> S + Unpin + Send + 'static,
        S: Stream<Item = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Into<BoxedError> + 'static,
    {
        self.executor.run_stream(move || f(Arc::clone(&connection)))
    }

    // -------------------------------------------------------------------------
    // Publish/subscribe and lifecycle
    // -------------------------------------------------------------------------

    /// Open a pub/sub connection bound to this client's policies
    ///
    /// The connection gets its own dispatch thread, named
    /// `{name}-pubsub-events`. Both are released by [`ClusterClient::shutdown`].
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub fn create_pub_sub_connection(
        &self,
    ) -> Result<FaultTolerantPubSubConnection<T::PubSubConnection>, ClusterError> {
        let mut registry = self.pub_sub.lock();
        if registry.shut_down {
            return Err(ClusterError::ShutDown { name: self.name.clone() });
        }

        let connection = Arc::new(self.transport.connect_pub_sub()?);
        let dispatch = match DispatchContext::start(format!("{}-pubsub-events", self.name)) {
            Ok(dispatch) => Arc::new(dispatch),
            Err(error) => {
                connection.close();
                return Err(error);
            }
        };

        registry.records.push(PubSubRecord {
            connection: Arc::clone(&connection),
            dispatch: Arc::clone(&dispatch),
        });
        debug!(cluster = %self.name, open = registry.records.len(), "Pub/sub connection created");

        Ok(FaultTolerantPubSubConnection::new(
            format!("{}-pubsub", self.name),
            connection,
            self.executor.clone(),
            self.topology_retry.clone(),
            dispatch,
        ))
    }

    /// Close every connection and release the driver
    ///
    /// Order: text connection, binary connection, each pub/sub connection
    /// followed by its dispatch thread, then the transport. Later calls do
    /// nothing.
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub fn shutdown(&self) {
        let mut registry = self.pub_sub.lock();
        if registry.shut_down {
            debug!(cluster = %self.name, "Cluster client already shut down");
            return;
        }
        registry.shut_down = true;

        self.connection.close();
        self.binary_connection.close();
        for record in registry.records.drain(..) {
            record.connection.close();
            record.dispatch.shutdown();
        }
        self.transport.shutdown();

        info!(cluster = %self.name, "Cluster client shut down");
    }
}
