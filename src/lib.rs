//! peerlink - Point-to-point messaging over a single TCP connection
//!
//! peerlink connects exactly two peers: a [`Server`] that serves one client
//! at a time and a [`Client`] that connects to it. Both sides exchange typed
//! messages framed as `[id: u16][length: u32][payload]` in network byte
//! order. Received messages are posted to a typed [`MessageBus`]; messages
//! to send are queued on the connection's [`MessageProcessor`] and written
//! by a background process loop.
//!
//! Which types can be sent and received, and under which id, is declared in
//! a [`MessageRegistry`] shared by both peers.

// Internal-only modules
pub(crate) mod bus;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod framing;
pub(crate) mod message;

// These are the intended public API
pub use bus::{ListenerId, MessageBus, Owner};
pub use connection::{
    Client, Connection, ConnectionListener, ConnectionState, Executor, Server, Task,
    ThreadExecutor,
};
pub use error::{Direction, Error};
pub use framing::{FrameHeader, MessageProcessor, HEADER_SIZE, HEARTBEAT_FRAME};
pub use message::{
    decode_message, encode_message, Decode, EmptyMessage, Encode, Message, MessageCodec,
    MessageDecoder, MessageEncoder, MessageReader, MessageRegistry, MessageWriter, HEARTBEAT_ID,
};

// Bincode support (optional feature, enabled by default)
#[cfg(feature = "bincode")]
pub use message::bincode;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::bus::{ListenerId, MessageBus, Owner};
    pub use crate::connection::{Client, Connection, ConnectionListener, Server};
    pub use crate::error::Error;
    pub use crate::impl_message;
    pub use crate::message::{
        Decode, EmptyMessage, Encode, Message, MessageCodec, MessageReader, MessageRegistry,
        MessageWriter,
    };

    // Bincode support (optional feature, enabled by default)
    #[cfg(feature = "bincode")]
    pub use crate::impl_bincode_message;
}

// Re-export the framing engine internals that are only needed for testing
// Hidden from documentation to discourage use in production code
#[doc(hidden)]
pub use framing::{read_frames, write_all_spinning, write_frames, ByteRegion, FrameBuffers};
