use super::HEADER_SIZE;
use crate::config::Settings;
use crate::error::Error;
use crate::message::{Message, MessageCodec, MessageRegistry, RegisteredOutgoing};
use std::any::TypeId;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, instrument};

/// Per-connection message state: the registry, the outgoing queue and the
/// buffer tunables.
///
/// A processor is shared between the application (which enqueues messages)
/// and the connection's worker (which drains the queue). It outlives
/// connections: a [`Client`](crate::Client) keeps the same processor, and
/// therefore the same queue, across reconnects.
pub struct MessageProcessor {
    registry: Arc<RwLock<MessageRegistry>>,
    outgoing: Mutex<VecDeque<Box<dyn Message>>>,
    read_buffer_size: AtomicUsize,
    write_buffer_size: AtomicUsize,
    process_loop_delay_ms: AtomicU64,
}

impl fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("pending", &self.pending_messages())
            .field("read_buffer_size", &self.read_buffer_size())
            .field("write_buffer_size", &self.write_buffer_size())
            .field("process_loop_delay", &self.process_loop_delay())
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl MessageProcessor {
    /// Creates a processor with default tunables.
    pub fn new(registry: MessageRegistry) -> Self {
        Self::with_shared_registry(Arc::new(RwLock::new(registry)), &Settings::default())
    }

    pub(crate) fn with_shared_registry(
        registry: Arc<RwLock<MessageRegistry>>,
        settings: &Settings,
    ) -> Self {
        Self {
            registry,
            outgoing: Mutex::new(VecDeque::new()),
            read_buffer_size: AtomicUsize::new(settings.read_buffer_size.max(HEADER_SIZE)),
            write_buffer_size: AtomicUsize::new(settings.write_buffer_size.max(HEADER_SIZE)),
            process_loop_delay_ms: AtomicU64::new(settings.process_loop_delay.as_millis() as u64),
        }
    }
}

// ============================================================================
// Registration
// ============================================================================

impl MessageProcessor {
    /// Registers a message codec, see [`MessageRegistry::register`].
    pub fn register_message(&self, id: u16, codec: MessageCodec) -> Result<(), Error> {
        self.registry_write().register(id, codec)?;
        Ok(())
    }

    /// Returns true if `T` can be enqueued.
    pub fn is_outgoing_registered<T: Message>(&self) -> bool {
        self.registry().resolve_outgoing(TypeId::of::<T>()).is_some()
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, MessageRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, MessageRegistry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn outgoing_for(&self, msg: &dyn Message) -> Option<RegisteredOutgoing> {
        self.registry().outgoing_for(msg)
    }
}

// ============================================================================
// Outgoing Queue
// ============================================================================

impl MessageProcessor {
    /// Appends a message to the outgoing queue.
    ///
    /// Fails with [`Error::UnregisteredMessage`] if the message type has no
    /// outgoing registration. Messages are sent in the order they were
    /// enqueued.
    #[instrument(skip(self, msg), fields(msg = msg.message_name()))]
    pub fn enqueue_message<M: Message>(&self, msg: M) -> Result<(), Error> {
        self.enqueue_boxed(Box::new(msg))
    }

    /// Like [`Self::enqueue_message`], for already boxed messages.
    pub fn enqueue_boxed(&self, msg: Box<dyn Message>) -> Result<(), Error> {
        if self.outgoing_for(msg.as_ref()).is_none() {
            return Err(Error::UnregisteredMessage {
                type_name: msg.message_name(),
            });
        }
        let mut queue = self.queue();
        queue.push_back(msg);
        debug!(pending = queue.len(), "Enqueued message");
        Ok(())
    }

    /// Number of messages waiting to be sent.
    pub fn pending_messages(&self) -> usize {
        self.queue().len()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue().is_empty()
    }

    /// Drops all messages waiting to be sent.
    pub fn clear_pending(&self) {
        self.queue().clear();
    }

    pub(crate) fn pop_pending(&self) -> Option<Box<dyn Message>> {
        self.queue().pop_front()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Box<dyn Message>>> {
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Tunables
// ============================================================================

impl MessageProcessor {
    /// Sets the read buffer size. Takes effect at the start of the next read
    /// pass, never in the middle of a frame. Values below the header size are
    /// raised to it.
    pub fn set_read_buffer_size(&self, bytes: usize) {
        self.read_buffer_size
            .store(bytes.max(HEADER_SIZE), Ordering::Relaxed);
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size.load(Ordering::Relaxed)
    }

    /// Sets the write buffer size. Takes effect at the start of the next
    /// write pass.
    pub fn set_write_buffer_size(&self, bytes: usize) {
        self.write_buffer_size
            .store(bytes.max(HEADER_SIZE), Ordering::Relaxed);
    }

    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size.load(Ordering::Relaxed)
    }

    /// Sets the pause between two iterations of the connection's process
    /// loop. Zero disables the pause.
    pub fn set_process_loop_delay(&self, delay: Duration) {
        self.process_loop_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn process_loop_delay(&self) -> Duration {
        Duration::from_millis(self.process_loop_delay_ms.load(Ordering::Relaxed))
    }
}
