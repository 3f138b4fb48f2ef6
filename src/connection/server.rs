use super::executor::{Executor, ThreadExecutor};
use super::Connection;
use crate::bus::MessageBus;
use crate::config::Settings;
use crate::error::Error;
use crate::framing::MessageProcessor;
use crate::message::{MessageCodec, MessageRegistry};
use ::config::Config;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const LISTENER_TOKEN: Token = Token(0);

// One pending handshake at most; the server serves a single client
const LISTEN_BACKLOG: i32 = 1;

/// Observer of the server's client sessions.
///
/// Both callbacks run on the server's loop thread. `on_connected` runs
/// before the first frame of the session is read, so subscriptions made on
/// the connection's message bus see every message of the session.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    fn on_disconnected(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }
}

/// The accepting endpoint. Serves at most one client at a time.
///
/// While a live client is connected, further connections are accepted and
/// closed right away. A client that went away frees the slot for the next
/// one. Each session gets a fresh [`MessageProcessor`] and [`MessageBus`];
/// the message registry is shared by all sessions.
///
/// # Example
///
/// ```no_run
/// use config::Config;
/// use peerlink::{Connection, ConnectionListener, EmptyMessage, MessageRegistry, Server};
/// use std::sync::Arc;
///
/// struct Greeter;
///
/// impl ConnectionListener for Greeter {
///     fn on_connected(&self, connection: &Arc<Connection>) {
///         connection.enqueue_message(EmptyMessage).unwrap();
///     }
/// }
///
/// let server = Server::new(&Config::default(), &MessageRegistry::new());
/// server.add_connection_listener(Arc::new(Greeter));
/// let addr = server.bind("127.0.0.1:0").unwrap();
/// println!("listening on {addr}");
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    executor: Arc<dyn Executor>,
}

struct ServerShared {
    registry: Arc<RwLock<MessageRegistry>>,
    settings: Settings,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    client: Mutex<Option<Arc<Connection>>>,
    acceptor: Mutex<Option<Acceptor>>,
    close_requested: AtomicBool,
    bound_addr: Mutex<Option<SocketAddr>>,
}

struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    events: Events,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("client", &self.client())
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Server {
    /// Creates a server using the global configuration keys.
    pub fn new(config: &Config, registry: &MessageRegistry) -> Self {
        Self::new_named(config, registry, "")
    }

    /// Creates a server reading `{name}.{key}` before `{key}` from `config`.
    pub fn new_named(config: &Config, registry: &MessageRegistry, name: &str) -> Self {
        let thread_name = if name.is_empty() {
            "peerlink-server".to_string()
        } else {
            format!("{name}-server")
        };
        Self {
            shared: Arc::new(ServerShared {
                registry: Arc::new(RwLock::new(registry.clone())),
                settings: Settings::from_config(config, name),
                listeners: Mutex::new(Vec::new()),
                client: Mutex::new(None),
                acceptor: Mutex::new(None),
                close_requested: AtomicBool::new(false),
                bound_addr: Mutex::new(None),
            }),
            executor: Arc::new(ThreadExecutor::new(thread_name)),
        }
    }

    /// Replaces the executor running the server loop.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Server {
    /// Starts listening on `addr` and spawns the server loop.
    ///
    /// Returns the bound address, which tells the actual port when binding
    /// to port 0. A server binds once; later calls fail with
    /// [`Error::AlreadyBound`].
    #[instrument(skip(self, addr))]
    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr, Error> {
        let mut bound = lock(&self.shared.bound_addr);
        if let Some(addr) = *bound {
            return Err(Error::AlreadyBound { addr });
        }

        let requested = addr
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let mut listener = bind_listener(requested)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        *lock(&self.shared.acceptor) = Some(Acceptor {
            listener,
            poll,
            events: Events::with_capacity(self.shared.settings.poll_capacity),
        });
        *bound = Some(local_addr);
        drop(bound);

        let shared = self.shared.clone();
        if let Err(err) = self.executor.execute(Box::new(move || shared.run())) {
            error!(%err, "Failed to start server loop");
            lock(&self.shared.acceptor).take();
            return Err(err);
        }
        info!(%local_addr, "Listening for connections");
        Ok(local_addr)
    }

    /// Stops listening and closes the client connection. Idempotent.
    ///
    /// The listening socket is closed before this returns. Connection
    /// listeners are notified from the server loop as it winds down.
    #[instrument(skip(self))]
    pub fn close(&self) {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = lock(&self.shared.acceptor).take() {
            info!(local_addr = ?acceptor.listener.local_addr().ok(), "Closed listener");
        }
        let client = lock(&self.shared.client).clone();
        if let Some(client) = client {
            client.close();
        }
    }

    /// Closes the current client connection. The server keeps listening.
    pub fn close_client(&self) {
        let client = lock(&self.shared.client).clone();
        if let Some(client) = client {
            client.close();
        }
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Server {
    /// The bound address, once [`Self::bind`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.bound_addr)
    }

    /// The current client session.
    pub fn client(&self) -> Option<Arc<Connection>> {
        lock(&self.shared.client).clone()
    }

    /// Probes the current client session, see [`Connection::is_connected`].
    pub fn is_client_connected(&self) -> bool {
        self.client().is_some_and(|client| client.is_connected())
    }

    /// Registers a message codec for all current and future sessions.
    pub fn register_message(&self, id: u16, codec: MessageCodec) -> Result<(), Error> {
        self.shared
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(id, codec)?;
        Ok(())
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        lock(&self.shared.listeners).push(listener);
    }

    /// Removes a listener previously added with the same `Arc`.
    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        lock(&self.shared.listeners).retain(|existing| !same_listener(existing, listener));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Server Loop
// ============================================================================

impl ServerShared {
    fn run(self: Arc<Self>) {
        debug!("Server loop started");
        loop {
            if self.close_requested.load(Ordering::Acquire) {
                break;
            }

            // Don't hold up a live session while waiting for connections
            let timeout = if self.current_client().is_some() {
                Duration::ZERO
            } else {
                self.settings.accept_timeout
            };
            match self.accept_pending(timeout) {
                Ok(Some(streams)) => {
                    for (stream, peer_addr) in streams {
                        self.admit(stream, peer_addr);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "Error accepting connections, stopping server");
                    lock(&self.acceptor).take();
                    break;
                }
            }

            if let Some(client) = self.current_client() {
                if !client.process() {
                    self.release_client(&client);
                }
            }
        }

        let client = self.current_client();
        if let Some(client) = client {
            self.release_client(&client);
        }
        lock(&self.acceptor).take();
        debug!("Server loop stopped");
    }

    // Returns None once the listener is gone.
    fn accept_pending(
        &self,
        timeout: Duration,
    ) -> Result<Option<Vec<(TcpStream, SocketAddr)>>, Error> {
        let mut guard = lock(&self.acceptor);
        let Some(acceptor) = guard.as_mut() else {
            return Ok(None);
        };

        match acceptor.poll.poll(&mut acceptor.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Some(Vec::new())),
            Err(err) => return Err(err.into()),
        }
        if acceptor.events.is_empty() {
            return Ok(Some(Vec::new()));
        }

        // Collect first, listeners must not run while the acceptor is locked
        let mut streams = Vec::new();
        loop {
            match acceptor.listener.accept() {
                Ok(accepted) => streams.push(accepted),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => return Err(err.into()),
                },
            }
        }
        Ok(Some(streams))
    }

    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Some(existing) = self.current_client() {
            if existing.is_connected() {
                warn!(%peer_addr, "Refusing connection, a client is already connected");
                drop(stream);
                return;
            }
            info!(%peer_addr, "Replacing disconnected client");
            self.release_client(&existing);
        }

        let processor = Arc::new(MessageProcessor::with_shared_registry(
            self.registry.clone(),
            &self.settings,
        ));
        let bus = Arc::new(MessageBus::new());
        let connection = match Connection::accepted(stream, processor, bus, &self.settings) {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                warn!(%peer_addr, %err, "Failed to set up accepted connection");
                return;
            }
        };
        info!(%peer_addr, "Accepted connection");
        *lock(&self.client) = Some(connection.clone());
        self.notify(&connection, |listener, conn| listener.on_connected(conn));
    }

    // Closes `client` and, if it still is the current client, clears the
    // slot and notifies listeners. Only one caller ever wins the slot.
    fn release_client(&self, client: &Arc<Connection>) {
        client.close();
        let removed = {
            let mut slot = lock(&self.client);
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, client) => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(peer_addr = ?client.peer_addr(), "Client disconnected");
            self.notify(client, |listener, conn| listener.on_disconnected(conn));
        }
    }

    fn notify<F>(&self, connection: &Arc<Connection>, callback: F)
    where
        F: Fn(&dyn ConnectionListener, &Arc<Connection>),
    {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref(), connection)));
            if result.is_err() {
                error!(peer_addr = ?connection.peer_addr(), "Connection listener panicked");
            }
        }
    }

    fn current_client(&self) -> Option<Arc<Connection>> {
        lock(&self.client).clone()
    }
}

// Builds the listening socket by hand, mio's bind always uses a large backlog
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn same_listener(a: &Arc<dyn ConnectionListener>, b: &Arc<dyn ConnectionListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
