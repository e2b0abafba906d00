//! In-memory driver for tests
//!
//! [`MockTransport`] hands out connections that never touch the network.
//! Their command methods follow scripts set up by the test, which makes it
//! possible to exercise breaker, retry and shutdown behavior
//! deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;

use crate::driver::{
    ClusterClientOptions, ClusterConnection, ClusterTransport, CommandFuture, PubSubConnection,
    PubSubEvent,
};
use crate::error::ClusterError;

const DEFAULT_MOCK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct ConnectionState {
    open: AtomicBool,
    calls: AtomicU32,
    responses: Mutex<VecDeque<Result<String, ClusterError>>>,
    command_timeout: Mutex<Duration>,
}

/// Scripted command connection
///
/// Clones share the same state, so a test can keep a handle to the
/// connection owned by a client.
#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<ConnectionState>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ConnectionState {
                open: AtomicBool::new(true),
                calls: AtomicU32::new(0),
                responses: Mutex::new(VecDeque::new()),
                command_timeout: Mutex::new(DEFAULT_MOCK_TIMEOUT),
            }),
        }
    }

    /// Queue the result of the next `get`
    pub fn push_response(&self, response: Result<String, ClusterError>) {
        self.state.responses.lock().push_back(response);
    }

    /// Queue `count` command timeouts
    pub fn push_timeouts(&self, count: usize) {
        let timeout = *self.state.command_timeout.lock();
        let mut responses = self.state.responses.lock();
        for _ in 0..count {
            responses.push_back(Err(ClusterError::CommandTimeout { timeout }));
        }
    }

    /// Number of commands issued on this connection
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Return the next scripted response, or the key itself once the script
    /// is exhausted
    pub fn get(&self, key: &str) -> Result<String, ClusterError> {
        self.begin_command()?;
        self.state.responses.lock().pop_front().unwrap_or_else(|| Ok(key.to_string()))
    }

    /// Blocking pop that never receives an element; times out like the
    /// driver would
    pub fn blpop(&self, _timeout: Duration, _key: &str) -> Result<Option<String>, ClusterError> {
        self.begin_command()?;
        Err(ClusterError::CommandTimeout { timeout: *self.state.command_timeout.lock() })
    }

    /// Asynchronous variant of [`MockConnection::blpop`]
    pub fn blpop_async(&self, timeout: Duration, key: &str) -> CommandFuture<Option<String>> {
        CommandFuture::ready(self.blpop(timeout, key))
    }

    fn begin_command(&self) -> Result<(), ClusterError> {
        if !self.is_open() {
            return Err(ClusterError::Disconnected);
        }
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_command_timeout(&self, timeout: Duration) {
        *self.state.command_timeout.lock() = timeout;
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterConnection for MockConnection {
    fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

type MockEvent = PubSubEvent<String, String>;

#[derive(Debug)]
struct PubSubState {
    open: AtomicBool,
    listeners: Mutex<Vec<mpsc::UnboundedSender<MockEvent>>>,
    subscriptions: Mutex<Vec<String>>,
}

/// Publish/subscribe connection whose events are injected by the test
#[derive(Debug, Clone)]
pub struct MockPubSubConnection {
    state: Arc<PubSubState>,
}

impl MockPubSubConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(PubSubState {
                open: AtomicBool::new(true),
                listeners: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, channel: &str) -> Result<(), ClusterError> {
        if !self.is_open() {
            return Err(ClusterError::Disconnected);
        }
        let count = {
            let mut subscriptions = self.state.subscriptions.lock();
            subscriptions.push(channel.to_string());
            subscriptions.len() as u64
        };
        self.emit(PubSubEvent::Subscribed { channel: channel.to_string(), count });
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    /// Deliver a message to every listener
    pub fn publish(&self, channel: &str, message: &str) {
        self.emit(PubSubEvent::Message {
            channel: channel.to_string(),
            message: message.to_string(),
        });
    }

    /// Simulate the driver noticing a topology change
    ///
    /// Subscriptions are forgotten, as they would be on nodes that moved.
    pub fn trigger_topology_change(&self) {
        self.state.subscriptions.lock().clear();
        self.emit(PubSubEvent::TopologyChanged);
    }

    fn emit(&self, event: MockEvent) {
        self.state
            .listeners
            .lock()
            .retain(|listener| listener.unbounded_send(event.clone()).is_ok());
    }
}

impl Default for MockPubSubConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterConnection for MockPubSubConnection {
    fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
        self.state.listeners.lock().clear();
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

impl PubSubConnection for MockPubSubConnection {
    type Key = String;
    type Value = String;

    fn events(&self) -> BoxStream<'static, MockEvent> {
        let (sender, receiver) = mpsc::unbounded();
        if self.is_open() {
            self.state.listeners.lock().push(sender);
        }
        receiver.boxed()
    }
}

#[derive(Debug, Default)]
struct TransportState {
    options: Mutex<Option<ClusterClientOptions>>,
    shut_down: AtomicBool,
    fail_pub_sub: AtomicBool,
    fail_binary: AtomicBool,
    pub_sub_connections: Mutex<Vec<MockPubSubConnection>>,
}

/// In-memory [`ClusterTransport`]
///
/// `connect` and `connect_binary` return handles to the same two
/// connections every time; every `connect_pub_sub` creates a new one.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
    connection: MockConnection,
    binary_connection: MockConnection,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> &MockConnection {
        &self.connection
    }

    pub fn binary_connection(&self) -> &MockConnection {
        &self.binary_connection
    }

    /// Pub/sub connections opened so far, in creation order
    pub fn pub_sub_connections(&self) -> Vec<MockPubSubConnection> {
        self.state.pub_sub_connections.lock().clone()
    }

    /// Options applied by the client, if any
    pub fn options(&self) -> Option<ClusterClientOptions> {
        self.state.options.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }

    /// Make the next binary connection attempts fail
    pub fn fail_binary_connections(&self, fail: bool) {
        self.state.fail_binary.store(fail, Ordering::SeqCst);
    }

    /// Make the next pub/sub connection attempts fail
    pub fn fail_pub_sub_connections(&self, fail: bool) {
        self.state.fail_pub_sub.store(fail, Ordering::SeqCst);
    }
}

impl ClusterTransport for MockTransport {
    type Connection = MockConnection;
    type BinaryConnection = MockConnection;
    type PubSubConnection = MockPubSubConnection;

    fn set_options(&self, options: ClusterClientOptions) {
        self.connection.set_command_timeout(options.command_timeout);
        self.binary_connection.set_command_timeout(options.command_timeout);
        *self.state.options.lock() = Some(options);
    }

    fn connect(&self) -> Result<MockConnection, ClusterError> {
        Ok(self.connection.clone())
    }

    fn connect_binary(&self) -> Result<MockConnection, ClusterError> {
        if self.state.fail_binary.load(Ordering::SeqCst) {
            return Err(ClusterError::driver("binary connection refused"));
        }
        Ok(self.binary_connection.clone())
    }

    fn connect_pub_sub(&self) -> Result<MockPubSubConnection, ClusterError> {
        if self.state.fail_pub_sub.load(Ordering::SeqCst) {
            return Err(ClusterError::driver("pub/sub connection refused"));
        }
        let connection = MockPubSubConnection::new();
        self.state.pub_sub_connections.lock().push(connection.clone());
        Ok(connection)
    }

    fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::SeqCst);
    }
}
