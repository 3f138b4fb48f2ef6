use super::executor::{Executor, ThreadExecutor};
use super::{run_process_loop, Connection, CONNECTION_TOKEN};
use crate::bus::MessageBus;
use crate::config::Settings;
use crate::error::Error;
use crate::framing::MessageProcessor;
use crate::message::{Message, MessageRegistry};
use ::config::Config;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// The connecting endpoint.
///
/// A client has at most one live [`Connection`]. Its [`MessageProcessor`]
/// (with the outgoing queue) and its [`MessageBus`] (with the listeners)
/// belong to the client, not to the connection, so they survive reconnects:
/// subscribe once, then connect, close and connect again as often as needed.
///
/// # Example
///
/// ```no_run
/// use config::Config;
/// use peerlink::{Client, EmptyMessage, MessageRegistry};
///
/// let client = Client::new(&Config::default(), &MessageRegistry::new());
/// client.message_bus().listen_always::<EmptyMessage, _>(None, |_| {
///     println!("heartbeat from server");
/// });
/// if client.connect("127.0.0.1:8080").unwrap() {
///     client.enqueue_message(EmptyMessage).unwrap();
/// }
/// ```
pub struct Client {
    processor: Arc<MessageProcessor>,
    bus: Arc<MessageBus>,
    connection: Mutex<Option<Arc<Connection>>>,
    // Serializes connect attempts; the slot lock is never held while closing
    connecting: Mutex<()>,
    executor: Arc<dyn Executor>,
    settings: Settings,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &*self.lock_connection())
            .field("settings", &self.settings)
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Client {
    /// Creates a client using the global configuration keys.
    pub fn new(config: &Config, registry: &MessageRegistry) -> Self {
        Self::new_named(config, registry, "")
    }

    /// Creates a client reading `{name}.{key}` before `{key}` from `config`.
    pub fn new_named(config: &Config, registry: &MessageRegistry, name: &str) -> Self {
        let settings = Settings::from_config(config, name);
        let thread_name = if name.is_empty() {
            "peerlink-client".to_string()
        } else {
            format!("{name}-client")
        };
        let processor = MessageProcessor::with_shared_registry(
            Arc::new(RwLock::new(registry.clone())),
            &settings,
        );
        Self {
            processor: Arc::new(processor),
            bus: Arc::new(MessageBus::new()),
            connection: Mutex::new(None),
            connecting: Mutex::new(()),
            executor: Arc::new(ThreadExecutor::new(thread_name)),
            settings,
        }
    }

    /// Replaces the executor running connection loops.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the bus receiving decoded messages, e.g. one with listeners
    /// already subscribed or one shared with other clients.
    pub fn with_message_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Replaces the processor holding the registry and the outgoing queue.
    /// Messages already queued on `processor` are sent after connecting.
    pub fn with_processor(mut self, processor: Arc<MessageProcessor>) -> Self {
        self.processor = processor;
        self
    }
}

// ============================================================================
// Connecting
// ============================================================================

impl Client {
    /// Connects to `addr`, closing any previous connection first.
    ///
    /// Returns `Ok(true)` once the TCP handshake completed and the process
    /// loop was started, `Ok(false)` if the peer refused or did not answer
    /// within the connect timeout. Unresolvable addresses fail with
    /// [`Error::InvalidAddress`].
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<bool, Error> {
        let addr = resolve(addr)?;
        self.connect_addr(addr)
    }

    /// Calls [`Self::connect`] up to `retries` times, waiting `timeout_ms`
    /// milliseconds after each failed attempt.
    pub fn connect_with_retry<A: ToSocketAddrs>(
        &self,
        addr: A,
        timeout_ms: u64,
        retries: u32,
    ) -> Result<bool, Error> {
        let addr = resolve(addr)?;
        for attempt in 1..=retries {
            if self.connect_addr(addr)? {
                return Ok(true);
            }
            debug!(attempt, retries, %addr, "Connect attempt failed");
            if attempt < retries {
                thread::sleep(Duration::from_millis(timeout_ms));
            }
        }
        Ok(false)
    }

    #[instrument(skip(self))]
    fn connect_addr(&self, addr: SocketAddr) -> Result<bool, Error> {
        let _connecting = self
            .connecting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = self.lock_connection().take();
        if let Some(previous) = previous {
            debug!("Closing previous connection");
            previous.close();
        }

        let mut poll = Poll::new()?;
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                info!(%err, "Connection failed");
                return Ok(false);
            }
        };
        poll.registry()
            .register(&mut stream, CONNECTION_TOKEN, Interest::WRITABLE)?;
        if !self.wait_for_connect(&mut poll, &stream)? {
            return Ok(false);
        }

        stream.set_nodelay(true)?;
        poll.registry().reregister(
            &mut stream,
            CONNECTION_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let connection = Arc::new(Connection::from_parts(
            stream,
            poll,
            self.processor.clone(),
            self.bus.clone(),
            &self.settings,
        ));
        info!(local_addr = ?connection.local_addr(), "Connected");

        let worker = connection.clone();
        if let Err(err) = self
            .executor
            .execute(Box::new(move || run_process_loop(worker)))
        {
            warn!(%err, "Failed to start process loop");
            connection.close();
            return Err(err);
        }
        *self.lock_connection() = Some(connection);
        Ok(true)
    }

    // Waits until the non-blocking connect finished, failed or timed out.
    fn wait_for_connect(&self, poll: &mut Poll, stream: &TcpStream) -> Result<bool, Error> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        let mut events = Events::with_capacity(self.settings.poll_capacity);
        loop {
            let now = Instant::now();
            if now >= deadline {
                info!(timeout = ?self.settings.connect_timeout, "Connect timed out");
                return Ok(false);
            }
            match poll.poll(&mut events, Some(deadline - now)) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            for event in events.iter() {
                if event.token() != CONNECTION_TOKEN {
                    continue;
                }
                match stream.take_error() {
                    Ok(Some(err)) | Err(err) => {
                        info!(%err, "Connection failed");
                        return Ok(false);
                    }
                    Ok(None) => {}
                }
                match stream.peer_addr() {
                    Ok(_) => return Ok(true),
                    Err(err) if err.kind() == ErrorKind::NotConnected => {}
                    Err(err) => {
                        info!(%err, "Connection failed");
                        return Ok(false);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

impl Client {
    /// Probes the current connection, see [`Connection::is_connected`].
    pub fn is_connected(&self) -> bool {
        // Clone out, the probe must not block connect() or close()
        let connection = self.lock_connection().clone();
        connection.is_some_and(|conn| conn.is_connected())
    }

    /// Closes the current connection, if any. Queued messages stay queued.
    pub fn close(&self) {
        let connection = self.lock_connection().take();
        if let Some(connection) = connection {
            connection.close();
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.lock_connection().clone()
    }

    /// Queues a message. It is sent once a connection's process loop runs.
    pub fn enqueue_message<M: Message>(&self, msg: M) -> Result<(), Error> {
        self.processor.enqueue_message(msg)
    }

    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()
        .map_err(|_| Error::InvalidAddress)?
        .next()
        .ok_or(Error::InvalidAddress)
}
