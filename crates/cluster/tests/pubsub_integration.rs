//! Integration tests for fault-tolerant pub/sub connections
//!
//! Covers serialized event delivery on the dispatch thread, resubscription
//! after topology changes and release of pub/sub resources on shutdown.

#![cfg(feature = "test-utils")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use faultline_cluster::testing::{MockPubSubConnection, MockTransport};
use faultline_cluster::{
    ClusterClient, ClusterConnection, ClusterError, FaultTolerantPubSubConnection, PubSubEvent,
};
use faultline_common::resilience::{CircuitBreakerConfig, RetryConfig};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(transport: MockTransport) -> ClusterClient<MockTransport> {
    ClusterClient::new(
        "events",
        transport,
        Duration::from_millis(100),
        CircuitBreakerConfig::default(),
        RetryConfig::builder()
            .max_attempts(3)
            .fixed_backoff(Duration::ZERO)
            .build()
            .expect("valid retry config"),
    )
    .expect("client connects")
}

fn mock_of(transport: &MockTransport, index: usize) -> MockPubSubConnection {
    transport.pub_sub_connections()[index].clone()
}

/// Validates that events reach listeners one at a time on the dispatch
/// thread.
///
/// # Test Steps
/// 1. Open a pub/sub connection and register a listener
/// 2. Publish from several threads at once
/// 3. Verify every message arrives on the `events-pubsub-events` thread
/// 4. Verify the listener never ran concurrently with itself
#[test]
fn test_events_are_delivered_serially_on_dispatch_thread() {
    init_tracing();
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let pub_sub = client.create_pub_sub_connection().expect("pub/sub opens");
    let mock = mock_of(&transport, 0);

    let in_listener = Arc::new(AtomicU32::new(0));
    let (tx, rx) = mpsc::channel();
    let guard = Arc::clone(&in_listener);
    pub_sub
        .subscribe_events(move |event| {
            assert_eq!(guard.fetch_add(1, Ordering::SeqCst), 0, "listener re-entered");
            let thread_name = thread::current().name().map(str::to_string);
            if let PubSubEvent::Message { message, .. } = event {
                let _ = tx.send((message, thread_name));
            }
            guard.fetch_sub(1, Ordering::SeqCst);
        })
        .expect("listener registered");

    let publishers: Vec<_> = (0..4)
        .map(|p| {
            let mock = mock.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    mock.publish("updates", &format!("{p}-{i}"));
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().expect("publisher panicked");
    }

    let mut received = Vec::new();
    for _ in 0..100 {
        let (message, thread_name) = rx.recv_timeout(RECEIVE_TIMEOUT).expect("message delivered");
        assert_eq!(thread_name.as_deref(), Some("events-pubsub-events"));
        received.push(message);
    }
    received.sort();
    received.dedup();
    assert_eq!(received.len(), 100);

    client.shutdown();
}

/// Validates per-publisher ordering is preserved through dispatch.
#[test]
fn test_events_keep_publication_order() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let pub_sub = client.create_pub_sub_connection().expect("pub/sub opens");
    let (tx, rx) = mpsc::channel();

    pub_sub
        .subscribe_events(move |event| {
            if let PubSubEvent::Message { message, .. } = event {
                let _ = tx.send(message);
            }
        })
        .expect("listener registered");
    for i in 0..20 {
        mock_of(&transport, 0).publish("ordered", &i.to_string());
    }

    let received: Vec<String> =
        (0..20).map(|_| rx.recv_timeout(RECEIVE_TIMEOUT).expect("message delivered")).collect();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(received, expected);
}

/// Validates resubscription after a topology change.
///
/// # Test Steps
/// 1. Subscribe to a channel through the protected connection
/// 2. Register a topology handler that fails once, then resubscribes
/// 3. Trigger a topology change, which drops the subscription
/// 4. Verify the handler is retried and the subscription restored
#[test]
fn test_topology_change_triggers_resubscription() {
    init_tracing();
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let pub_sub = Arc::new(client.create_pub_sub_connection().expect("pub/sub opens"));
    let mock = mock_of(&transport, 0);

    pub_sub.use_pub_sub_connection(|conn| conn.subscribe("alerts")).expect("subscribed");
    assert_eq!(mock.subscriptions(), vec!["alerts".to_string()]);

    let invocations = Arc::new(AtomicU32::new(0));
    let (tx, rx) = mpsc::channel();
    let handler_connection: Arc<FaultTolerantPubSubConnection<MockPubSubConnection>> =
        Arc::clone(&pub_sub);
    let counter = Arc::clone(&invocations);
    pub_sub
        .subscribe_to_cluster_topology_changed_events(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ClusterError::driver("node not ready"));
            }
            handler_connection.use_pub_sub_connection(|conn| conn.subscribe("alerts"))?;
            let _ = tx.send(());
            Ok::<_, ClusterError>(())
        })
        .expect("handler registered");

    mock.trigger_topology_change();
    assert!(mock.subscriptions().is_empty());

    // The second invocation waits for one jittered backoff of at most 1s.
    rx.recv_timeout(RECEIVE_TIMEOUT).expect("handler eventually succeeds");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(mock.subscriptions(), vec!["alerts".to_string()]);

    // The handler holds the connection; shutdown still stops its thread.
    client.shutdown();
    assert!(pub_sub.dispatch_context().is_shut_down());
    assert!(!mock.is_open());
}

/// Validates that non-topology events never run the handler.
#[test]
fn test_topology_handler_ignores_messages() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let pub_sub = client.create_pub_sub_connection().expect("pub/sub opens");
    let invocations = Arc::new(AtomicU32::new(0));
    let (handled_tx, handled_rx) = mpsc::channel();
    let (events_tx, events_rx) = mpsc::channel();

    let counter = Arc::clone(&invocations);
    pub_sub
        .subscribe_to_cluster_topology_changed_events(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = handled_tx.send(());
            Ok::<_, ClusterError>(())
        })
        .expect("handler registered");
    pub_sub
        .subscribe_events(move |event| {
            let _ = events_tx.send(event.is_topology_changed());
        })
        .expect("listener registered");

    let mock = mock_of(&transport, 0);
    mock.publish("alerts", "one");
    mock.publish("alerts", "two");
    mock.trigger_topology_change();

    let seen: Vec<bool> = (0..3)
        .map(|_| events_rx.recv_timeout(RECEIVE_TIMEOUT).expect("event delivered"))
        .collect();
    assert_eq!(seen, vec![false, false, true]);
    handled_rx.recv_timeout(RECEIVE_TIMEOUT).expect("topology change handled");

    client.shutdown();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// Validates that client shutdown releases every pub/sub connection.
///
/// # Test Steps
/// 1. Open two pub/sub connections with listeners
/// 2. Shut the client down
/// 3. Verify connections are closed and their dispatch threads stopped
/// 4. Verify new listeners are refused
#[test]
fn test_shutdown_releases_pub_sub_connections() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let first = client.create_pub_sub_connection().expect("first pub/sub");
    let second = client.create_pub_sub_connection().expect("second pub/sub");
    first.subscribe_events(|_| {}).expect("listener registered");
    second.subscribe_events(|_| {}).expect("listener registered");

    client.shutdown();

    for mock in transport.pub_sub_connections() {
        assert!(!mock.is_open());
        assert!(mock.subscribe("late").is_err());
    }
    assert!(first.dispatch_context().is_shut_down());
    assert!(second.dispatch_context().is_shut_down());
    assert!(matches!(first.subscribe_events(|_| {}), Err(ClusterError::ShutDown { .. })));

    let err = second
        .use_pub_sub_connection(|conn| conn.subscribe("late"))
        .expect_err("connection closed");
    assert!(matches!(err, ClusterError::Disconnected));
}
