//! Connections and the two endpoints that create them.
//!
//! A [`Connection`] owns one non-blocking TCP socket, its own mio [`Poll`]
//! and the buffers of the framing engine. Some thread repeatedly calls
//! [`Connection::process`] until it returns `false` and then calls
//! [`Connection::close`]. The [`Client`] and [`Server`] run that loop on an
//! [`Executor`].

mod client;
mod executor;
mod server;

pub use client::Client;
pub use executor::{Executor, Task, ThreadExecutor};
pub use server::{ConnectionListener, Server};

use crate::bus::MessageBus;
use crate::config::Settings;
use crate::error::Error;
use crate::framing::{
    read_frames, write_all_spinning, write_frames, FrameBuffers, MessageProcessor, HEARTBEAT_FRAME,
};
use crate::message::Message;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace};

pub(crate) const CONNECTION_TOKEN: Token = Token(0);

/// Lifecycle of a [`Connection`]. There is no way back from `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Close was requested and the worker has not released the socket yet.
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }
}

// Everything torn down by close(), guarded by one lock
struct ConnectionIo {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    buffers: FrameBuffers,
}

/// One established TCP session.
///
/// All methods take `&self`; a connection is shared between its worker and
/// the application through an `Arc`.
pub struct Connection {
    io: Mutex<Option<ConnectionIo>>,
    state: AtomicU8,
    close_requested: AtomicBool,
    // Set while process() runs, so calls from listeners don't self-deadlock
    processing_thread: Mutex<Option<ThreadId>>,
    processor: Arc<MessageProcessor>,
    bus: Arc<MessageBus>,
    poll_timeout: Duration,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Connection {
    // Wraps a stream accepted by a listener.
    pub(crate) fn accepted(
        mut stream: TcpStream,
        processor: Arc<MessageProcessor>,
        bus: Arc<MessageBus>,
        settings: &Settings,
    ) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            CONNECTION_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(Self::from_parts(stream, poll, processor, bus, settings))
    }

    // Wraps a connected stream already registered with `poll`.
    pub(crate) fn from_parts(
        stream: TcpStream,
        poll: Poll,
        processor: Arc<MessageProcessor>,
        bus: Arc<MessageBus>,
        settings: &Settings,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let buffers = FrameBuffers::for_processor(&processor);
        Self {
            io: Mutex::new(Some(ConnectionIo {
                stream,
                poll,
                events: Events::with_capacity(settings.poll_capacity),
                buffers,
            })),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            close_requested: AtomicBool::new(false),
            processing_thread: Mutex::new(None),
            processor,
            bus,
            poll_timeout: settings.poll_timeout,
            local_addr,
            peer_addr,
        }
    }
}

// ============================================================================
// Processing
// ============================================================================

impl Connection {
    /// Runs one iteration of the connection loop.
    ///
    /// Pauses for the process loop delay, waits up to the poll timeout for
    /// socket readiness, writes all queued messages and reads all available
    /// frames, dispatching them to the message bus. Listeners run on this
    /// thread before `process` returns.
    ///
    /// Returns `false` once the connection is closed or failed; the caller
    /// must then stop looping and call [`Self::close`].
    pub fn process(&self) -> bool {
        if self.close_requested.load(Ordering::Acquire) {
            return false;
        }
        let delay = self.processor.process_loop_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.close_requested.load(Ordering::Acquire) {
            return false;
        }

        let mut io = self.lock_io();
        let Some(active) = io.as_mut() else {
            return false;
        };

        self.set_processing_thread(Some(thread::current().id()));
        let result = active.step(&self.processor, &self.bus, self.poll_timeout);
        self.set_processing_thread(None);

        let healthy = match result {
            Ok(()) => true,
            Err(Error::ConnectionClosed) => {
                info!(peer_addr = ?self.peer_addr, "Peer closed connection");
                false
            }
            Err(err) => {
                error!(peer_addr = ?self.peer_addr, %err, "Connection failed");
                false
            }
        };

        // A listener asked to close while we held the lock
        if self.close_requested.load(Ordering::Acquire) {
            if let Some(active) = io.take() {
                self.teardown(active);
            }
            return false;
        }
        healthy
    }
}

impl ConnectionIo {
    fn step(
        &mut self,
        processor: &MessageProcessor,
        bus: &MessageBus,
        poll_timeout: Duration,
    ) -> Result<(), Error> {
        match self.poll.poll(&mut self.events, Some(poll_timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        // mio reports errors alongside the readiness bits; the read surfaces
        // the actual failure
        let readable = self.events.iter().any(|event| {
            event.token() == CONNECTION_TOKEN
                && (event.is_readable() || event.is_read_closed() || event.is_error())
        });

        if processor.has_pending() {
            write_frames(&mut self.stream, processor, &mut self.buffers)?;
        }
        if readable {
            read_frames(&mut self.stream, processor, bus, &mut self.buffers)?;
        }
        Ok(())
    }

    fn shutdown(mut self) {
        if let Err(err) = self.poll.registry().deregister(&mut self.stream) {
            trace!(?err, "Error deregistering stream");
        }
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!(?err, "Error shutting down stream");
        }
    }
}

// ============================================================================
// Liveness and Closing
// ============================================================================

impl Connection {
    /// Probes whether the session is still usable.
    ///
    /// Returns `false` if the connection was closed or has no peer address.
    /// Otherwise two heartbeat frames are written straight to the socket, and
    /// the result is `true` only if both writes succeeded. A peer that closed
    /// its end usually fails the second write. Called from a listener during
    /// [`Self::process`], the probe is skipped and the state is reported.
    pub fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Open || self.close_requested.load(Ordering::Acquire) {
            return false;
        }
        if self.is_processing_thread() {
            return true;
        }

        let mut io = self.lock_io();
        let Some(active) = io.as_mut() else {
            return false;
        };
        if active.stream.peer_addr().is_err() {
            return false;
        }
        for _ in 0..2 {
            if let Err(err) = write_all_spinning(&mut active.stream, &HEARTBEAT_FRAME) {
                debug!(peer_addr = ?self.peer_addr, %err, "Heartbeat failed");
                return false;
            }
        }
        true
    }

    /// Closes the connection. Idempotent.
    ///
    /// Waits for a running [`Self::process`] iteration to finish, then closes
    /// the socket. Called from a listener during `process`, the socket is
    /// closed when that iteration ends.
    #[instrument(skip(self), fields(peer_addr = ?self.peer_addr))]
    pub fn close(&self) {
        self.close_requested.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            ConnectionState::Open.as_u8(),
            ConnectionState::Closing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.is_processing_thread() {
            debug!("Close requested from the processing thread, deferring");
            return;
        }

        let taken = self.lock_io().take();
        match taken {
            Some(active) => self.teardown(active),
            None => self
                .state
                .store(ConnectionState::Closed.as_u8(), Ordering::Release),
        }
    }

    fn teardown(&self, active: ConnectionIo) {
        active.shutdown();
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
        info!(local_addr = ?self.local_addr, peer_addr = ?self.peer_addr, "Closed connection");
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Connection {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queues a message for sending, see [`MessageProcessor::enqueue_message`].
    pub fn enqueue_message<M: Message>(&self, msg: M) -> Result<(), Error> {
        self.processor.enqueue_message(msg)
    }

    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    /// The bus receiving every message decoded on this connection.
    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl Connection {
    fn lock_io(&self) -> MutexGuard<'_, Option<ConnectionIo>> {
        self.io.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_processing_thread(&self, id: Option<ThreadId>) {
        *self
            .processing_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    fn is_processing_thread(&self) -> bool {
        let current = thread::current().id();
        *self
            .processing_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            == Some(current)
    }
}

// Drives `connection` until it stops, then releases it.
pub(crate) fn run_process_loop(connection: Arc<Connection>) {
    info!(peer_addr = ?connection.peer_addr(), "Process loop started");
    while connection.process() {}
    connection.close();
    info!(peer_addr = ?connection.peer_addr(), "Process loop stopped");
}
