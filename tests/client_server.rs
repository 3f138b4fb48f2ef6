//! Client/Server Integration Tests
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test client_server -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test --test client_server -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test client_server -- --nocapture
//! ```


use config::Config;
use message_types::*;
use peerlink::prelude::*;
use peerlink::{ConnectionState, MessageProcessor};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Helper Functions
// ============================================================================

fn build_config() -> Config {
    Config::builder()
        .set_default("process_loop_delay_ms", 1i64)
        .unwrap()
        .set_default("connect_timeout_ms", 1000i64)
        .unwrap()
        .build()
        .unwrap()
}

fn start_server() -> (Server, SocketAddr) {
    init_tracing();
    let server = Server::new(&build_config(), &test_registry());
    let addr = server.bind("127.0.0.1:0").expect("Failed to bind server");
    (server, addr)
}

fn new_client() -> Client {
    Client::new(&build_config(), &test_registry())
}

// An address nothing listens on
fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

// Runs a closure for every new session
struct SessionHook<F>(F);

impl<F> ConnectionListener for SessionHook<F>
where
    F: Fn(&Arc<Connection>) + Send + Sync,
{
    fn on_connected(&self, connection: &Arc<Connection>) {
        (self.0)(connection)
    }
}

#[derive(Default)]
struct CountingListener {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl ConnectionListener for CountingListener {
    fn on_connected(&self, _connection: &Arc<Connection>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, _connection: &Arc<Connection>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

// Forwards every IntMessage a session receives
fn forward_ints(server: &Server) -> mpsc::Receiver<i32> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    server.add_connection_listener(Arc::new(SessionHook(move |conn: &Arc<Connection>| {
        let tx = Mutex::new(tx.lock().unwrap().clone());
        conn.message_bus()
            .listen_always::<IntMessage, _>(None, move |msg| {
                let _ = tx.lock().unwrap().send(msg.i);
            });
    })));
    rx
}

// ============================================================================
// Messaging
// ============================================================================

#[test]
fn client_message_reaches_server() {
    let (server, addr) = start_server();
    let received = forward_ints(&server);

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    client.enqueue_message(IntMessage { i: 42 }).unwrap();

    assert_eq!(received.recv_timeout(WAIT).unwrap(), 42);
    assert!(received.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn server_message_reaches_client() {
    let (server, addr) = start_server();
    server.add_connection_listener(Arc::new(SessionHook(|conn: &Arc<Connection>| {
        conn.enqueue_message(TextMessage {
            text: "welcome".to_string(),
        })
        .unwrap();
    })));

    let client = new_client();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client
        .message_bus()
        .listen_once::<TextMessage, _>(None, move |msg| {
            let _ = tx.lock().unwrap().send(msg.text.clone());
        });
    assert!(client.connect(addr).unwrap());

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "welcome");
}

#[test]
fn mixed_burst_is_fully_delivered() {
    let (server, addr) = start_server();
    let ints = Arc::new(AtomicUsize::new(0));
    let texts = Arc::new(AtomicUsize::new(0));
    let marker = Arc::new(AtomicI32::new(-1));
    {
        let (ints, texts, marker) = (ints.clone(), texts.clone(), marker.clone());
        server.add_connection_listener(Arc::new(SessionHook(move |conn: &Arc<Connection>| {
            let (ints, marker) = (ints.clone(), marker.clone());
            conn.message_bus()
                .listen_always::<IntMessage, _>(None, move |msg| {
                    marker.store(msg.i, Ordering::SeqCst);
                    ints.fetch_add(1, Ordering::SeqCst);
                });
            let texts = texts.clone();
            conn.message_bus()
                .listen_always::<TextMessage, _>(None, move |_| {
                    texts.fetch_add(1, Ordering::SeqCst);
                });
        })));
    }

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    for i in 0..100 {
        if i % 2 == 0 {
            client.enqueue_message(IntMessage { i }).unwrap();
        } else {
            client.enqueue_message(TextMessage::ones(i as usize)).unwrap();
        }
    }

    assert!(wait_until(WAIT, || {
        ints.load(Ordering::SeqCst) + texts.load(Ordering::SeqCst) == 100
    }));
    assert_eq!(ints.load(Ordering::SeqCst), 50);
    assert_eq!(texts.load(Ordering::SeqCst), 50);
    assert_eq!(marker.load(Ordering::SeqCst), 98);
}

#[test]
fn messages_arrive_in_enqueue_order() {
    let (server, addr) = start_server();
    let received = forward_ints(&server);

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    for i in 0..500 {
        client.enqueue_message(IntMessage { i }).unwrap();
    }

    let order: Vec<i32> = (0..500)
        .map(|_| received.recv_timeout(WAIT).unwrap())
        .collect();
    assert_eq!(order, (0..500).collect::<Vec<_>>());
}

#[test]
fn large_messages_are_reassembled() {
    let (server, addr) = start_server();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    server.add_connection_listener(Arc::new(SessionHook(move |conn: &Arc<Connection>| {
        let tx = Mutex::new(tx.lock().unwrap().clone());
        conn.message_bus()
            .listen_always::<LargeMessage, _>(None, move |msg| {
                let intact = msg.values.iter().all(|v| *v == i32::MAX);
                let _ = tx.lock().unwrap().send((msg.values.len(), intact));
            });
    })));

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    let sizes: Vec<usize> = (0..20).map(|n| 50_000 + (n * 7_919) % 100_000).collect();
    for size in &sizes {
        client.enqueue_message(LargeMessage::filled(*size)).unwrap();
    }

    for size in sizes {
        let (len, intact) = rx.recv_timeout(Duration::from_secs(20)).unwrap();
        assert_eq!(len, size);
        assert!(intact);
    }
}

#[test]
fn large_message_reaches_client() {
    let (server, addr) = start_server();
    server.add_connection_listener(Arc::new(SessionHook(|conn: &Arc<Connection>| {
        conn.enqueue_message(LargeMessage::filled(100_000)).unwrap();
    })));

    let client = new_client();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client
        .message_bus()
        .listen_once::<LargeMessage, _>(None, move |msg| {
            let _ = tx.lock().unwrap().send(msg.clone());
        });
    assert!(client.connect(addr).unwrap());

    let received = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(received, LargeMessage::filled(100_000));
}

#[test]
fn queued_messages_survive_until_connect() {
    let (server, addr) = start_server();
    let received = forward_ints(&server);

    let client = new_client();
    client.enqueue_message(IntMessage { i: 7 }).unwrap();
    assert_eq!(client.processor().pending_messages(), 1);
    assert!(client.connect(addr).unwrap());

    assert_eq!(received.recv_timeout(WAIT).unwrap(), 7);
}

#[test]
fn injected_bus_receives_messages() {
    let (server, addr) = start_server();
    server.add_connection_listener(Arc::new(SessionHook(|conn: &Arc<Connection>| {
        conn.enqueue_message(IntMessage { i: 5 }).unwrap();
    })));

    // Subscribed before the client exists
    let bus = Arc::new(MessageBus::new());
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.listen_always::<IntMessage, _>(None, move |msg| {
        let _ = tx.lock().unwrap().send(msg.i);
    });

    let client = new_client().with_message_bus(bus.clone());
    assert!(Arc::ptr_eq(client.message_bus(), &bus));
    assert!(client.connect(addr).unwrap());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 5);
}

#[test]
fn injected_processor_sends_its_queue() {
    let (server, addr) = start_server();
    let received = forward_ints(&server);

    let processor = Arc::new(MessageProcessor::new(test_registry()));
    processor.enqueue_message(IntMessage { i: 11 }).unwrap();
    let client = new_client().with_processor(processor.clone());
    assert!(Arc::ptr_eq(client.processor(), &processor));
    assert!(client.connect(addr).unwrap());

    assert_eq!(received.recv_timeout(WAIT).unwrap(), 11);
    assert!(wait_until(WAIT, || !processor.has_pending()));
}

#[test]
fn unregistered_messages_are_refused() {
    #[derive(Debug)]
    struct Unknown;
    impl_message!(Unknown);

    let client = new_client();
    let result = client.enqueue_message(Unknown);
    assert!(matches!(result, Err(Error::UnregisteredMessage { .. })));
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

#[test]
fn is_connected_follows_the_session() {
    let (server, addr) = start_server();
    let client = new_client();
    assert!(!client.is_connected());

    assert!(client.connect(addr).unwrap());
    assert!(client.is_connected());
    assert!(wait_until(WAIT, || server.is_client_connected()));

    client.close();
    assert!(!client.is_connected());
    assert!(wait_until(WAIT, || !server.is_client_connected()));

    assert!(client.connect(addr).unwrap());
    assert!(client.is_connected());
    assert!(wait_until(WAIT, || server.is_client_connected()));

    server.close_client();
    assert!(wait_until(WAIT, || !client.is_connected()));
}

#[test]
fn liveness_check_writes_two_heartbeats() {
    let (server, addr) = start_server();
    let heartbeats = Arc::new(AtomicUsize::new(0));
    let counter = heartbeats.clone();
    server.add_connection_listener(Arc::new(SessionHook(move |conn: &Arc<Connection>| {
        let counter = counter.clone();
        conn.message_bus()
            .listen_always::<EmptyMessage, _>(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
    })));

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    assert!(wait_until(WAIT, || server.client().is_some()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(heartbeats.load(Ordering::SeqCst), 0);

    assert!(client.is_connected());
    assert!(wait_until(WAIT, || heartbeats.load(Ordering::SeqCst) >= 2));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(heartbeats.load(Ordering::SeqCst), 2);
}

#[test]
fn client_notices_server_shutdown() {
    let (server, addr) = start_server();
    let client = new_client();
    assert!(client.connect(addr).unwrap());
    assert!(wait_until(WAIT, || server.client().is_some()));

    server.close();
    assert!(wait_until(WAIT, || !client.is_connected()));
    assert!(!client.connect(addr).unwrap());
}

#[test]
fn only_one_client_at_a_time() {
    let (server, addr) = start_server();
    let first = new_client();
    assert!(first.connect(addr).unwrap());
    assert!(wait_until(WAIT, || server.client().is_some()));

    // The handshake may complete, but the server closes the socket at once
    let second = new_client();
    let _ = second.connect(addr).unwrap();
    assert!(wait_until(WAIT, || !second.is_connected()));
    assert!(first.is_connected());

    first.close();
    assert!(wait_until(WAIT, || server.client().is_none()));

    let third = new_client();
    assert!(third.connect(addr).unwrap());
    assert!(wait_until(WAIT, || server.is_client_connected()));
    assert!(third.is_connected());
}

// Linux keeps at most backlog + 1 completed handshakes queued
#[cfg(target_os = "linux")]
#[test]
fn listen_backlog_holds_one_pending_handshake() {
    let (server, addr) = start_server();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    // Stalls the server loop, so nothing else gets accepted
    server.add_connection_listener(Arc::new(SessionHook(move |_conn: &Arc<Connection>| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv_timeout(WAIT);
    })));

    let first = new_client();
    assert!(first.connect(addr).unwrap());
    entered_rx.recv_timeout(WAIT).unwrap();

    let completed: Vec<_> = (0..8)
        .filter_map(|_| {
            std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)).ok()
        })
        .collect();
    assert!(
        completed.len() < 8,
        "{} handshakes completed",
        completed.len()
    );

    let _ = release_tx.send(());
}

#[test]
fn connection_listeners_fire_once_per_session() {
    let (server, addr) = start_server();
    let counting = Arc::new(CountingListener::default());
    let listener: Arc<dyn ConnectionListener> = counting.clone();
    server.add_connection_listener(listener.clone());

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    assert!(wait_until(WAIT, || counting.connected.load(Ordering::SeqCst) == 1));
    client.close();
    assert!(wait_until(WAIT, || counting.disconnected.load(Ordering::SeqCst) == 1));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(counting.connected.load(Ordering::SeqCst), 1);
    assert_eq!(counting.disconnected.load(Ordering::SeqCst), 1);

    server.remove_connection_listener(&listener);
    assert!(client.connect(addr).unwrap());
    assert!(wait_until(WAIT, || server.client().is_some()));
    assert_eq!(counting.connected.load(Ordering::SeqCst), 1);
}

#[test]
fn close_from_a_listener_is_deferred() {
    let (server, addr) = start_server();
    let client = new_client();
    assert!(client.connect(addr).unwrap());
    let connection = client.connection().unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let weak = Arc::downgrade(&connection);
    client
        .message_bus()
        .listen_once::<TextMessage, _>(None, move |_| {
            if let Some(conn) = weak.upgrade() {
                let alive = conn.is_connected();
                conn.close();
                let _ = tx.lock().unwrap().send(alive);
            }
        });

    assert!(wait_until(WAIT, || server.client().is_some()));
    server
        .client()
        .unwrap()
        .enqueue_message(TextMessage::ones(1))
        .unwrap();

    assert!(rx.recv_timeout(WAIT).unwrap());
    assert!(wait_until(WAIT, || connection.state() == ConnectionState::Closed));
    assert!(!client.is_connected());
    assert!(wait_until(WAIT, || !server.is_client_connected()));
}

// ============================================================================
// Connecting
// ============================================================================

#[test]
fn refused_connect_returns_false() {
    init_tracing();
    let client = new_client();
    assert!(!client.connect(dead_addr()).unwrap());
    assert!(!client.is_connected());
}

#[test]
fn unresolvable_address_is_an_error() {
    let client = new_client();
    let result = client.connect("not an address");
    assert!(matches!(result, Err(Error::InvalidAddress)));
}

#[test]
fn connect_gives_up_after_the_timeout() {
    init_tracing();
    let config = Config::builder()
        .set_default("connect_timeout_ms", 200i64)
        .unwrap()
        .build()
        .unwrap();
    let client = Client::new(&config, &test_registry());

    // Non-routable address; either unreachable at once or silent
    let started = Instant::now();
    assert!(!client.connect("10.255.255.1:9").unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn connect_with_retry_waits_for_the_server() {
    init_tracing();
    let addr = dead_addr();
    let late_server = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        let server = Server::new(&build_config(), &test_registry());
        server.bind(addr).unwrap();
        server
    });

    let client = new_client();
    assert!(client.connect_with_retry(addr, 100, 50).unwrap());
    let server = late_server.join().unwrap();
    assert!(wait_until(WAIT, || server.is_client_connected()));
}

#[test]
fn connect_with_retry_gives_up() {
    let client = new_client();
    let started = Instant::now();
    assert!(!client.connect_with_retry(dead_addr(), 20, 3).unwrap());
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn server_binds_once() {
    let (server, addr) = start_server();
    assert_eq!(server.local_addr(), Some(addr));
    let result = server.bind("127.0.0.1:0");
    assert!(matches!(result, Err(Error::AlreadyBound { .. })));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn named_settings_take_priority() {
    let config = Config::builder()
        .set_default("read_buffer_size", 1024i64)
        .unwrap()
        .set_default("fast.read_buffer_size", 2048i64)
        .unwrap()
        .set_default("fast.process_loop_delay_ms", 0i64)
        .unwrap()
        .set_default("write_buffer_size", "lots")
        .unwrap()
        .build()
        .unwrap();
    let registry = test_registry();

    let plain = Client::new(&config, &registry);
    assert_eq!(plain.processor().read_buffer_size(), 1024);
    assert_eq!(plain.processor().process_loop_delay(), Duration::from_millis(5));
    // Unparsable values fall back to the default
    assert_eq!(plain.processor().write_buffer_size(), 4096);

    let fast = Client::new_named(&config, &registry, "fast");
    assert_eq!(fast.processor().read_buffer_size(), 2048);
    assert_eq!(fast.processor().process_loop_delay(), Duration::ZERO);
}

#[test]
fn tunables_can_change_while_connected() {
    let (server, addr) = start_server();
    let received = forward_ints(&server);

    let client = new_client();
    assert!(client.connect(addr).unwrap());
    client.processor().set_write_buffer_size(64);
    client.processor().set_read_buffer_size(64);
    client.processor().set_process_loop_delay(Duration::from_millis(2));
    assert_eq!(client.processor().write_buffer_size(), 64);
    assert_eq!(client.processor().process_loop_delay(), Duration::from_millis(2));

    for i in 0..20 {
        client.enqueue_message(IntMessage { i }).unwrap();
    }
    let order: Vec<i32> = (0..20)
        .map(|_| received.recv_timeout(WAIT).unwrap())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
}
